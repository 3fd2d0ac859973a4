use proptest::prelude::*;

use tptfs::alloc::{find_free_run, state, State};
use tptfs::{plan, BlockMap, BlockRef, TptfsError, N_DIRECT, N_INDIRECT, PTRS_PER_BLOCK};

fn page_sizes() -> impl Strategy<Value = u32> {
    prop_oneof![Just(512_u32), Just(1024), Just(4096), Just(8192)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn layout_regions_add_up_to_the_budget(
        total_pages in 2_u64..5_000_000,
        page_size in page_sizes(),
        inode_entry_size in prop_oneof![Just(64_u32), Just(128), Just(256)],
        pages_per_file in 1_u32..16,
    ) {
        if let Ok(layout) = plan(total_pages, page_size, inode_entry_size, pages_per_file) {
            prop_assert_eq!(
                1 + layout.page_bitmap + layout.inode_bitmap + layout.inode_table + layout.data_region,
                total_pages
            );
            let inodes_per_page = u64::from(page_size / inode_entry_size);
            let bits_per_page = u64::from(page_size) * 8;
            prop_assert_eq!(layout.inode_count, layout.inode_table * inodes_per_page);
            prop_assert!(layout.page_bitmap * bits_per_page >= layout.data_region);
            prop_assert!(layout.inode_bitmap * bits_per_page >= layout.inode_count);
            prop_assert!(layout.data_region > 0);
        }
    }

    #[test]
    fn growing_the_budget_never_shrinks_the_data_region(
        total_pages in 2_u64..5_000_000,
        growth in 1_u64..10_000,
        page_size in page_sizes(),
        pages_per_file in 1_u32..8,
    ) {
        let smaller = plan(total_pages, page_size, 256, pages_per_file);
        let larger = plan(total_pages + growth, page_size, 256, pages_per_file);
        match (smaller, larger) {
            (Ok(smaller), Ok(larger)) => prop_assert!(larger.data_region >= smaller.data_region),
            (Ok(_), Err(err)) => prop_assert!(false, "larger budget failed: {}", err),
            (Err(_), _) => {}
        }
    }

    #[test]
    fn direct_blocks_resolve_to_an_empty_path(lbn in 0_u64..N_DIRECT) {
        let path = BlockMap::default().resolve(BlockRef::Data(lbn)).unwrap();
        prop_assert!(path.is_direct());
        prop_assert!(path.is_empty());
    }

    #[test]
    fn resolved_paths_stay_within_the_indirection_depth(
        lbn in 0_u64..(N_DIRECT + PTRS_PER_BLOCK + PTRS_PER_BLOCK.pow(2) + PTRS_PER_BLOCK.pow(3)),
    ) {
        let path = BlockMap::default().resolve(BlockRef::Data(lbn)).unwrap();
        prop_assert!(path.len() <= N_INDIRECT);
        if let Some(slot) = path.root_slot() {
            prop_assert_eq!(path.len(), slot + 1);
        }
        // Every hop leads through an indirect block.
        for hop in &path {
            prop_assert!(hop.block.is_meta());
            prop_assert!(hop.offset < PTRS_PER_BLOCK);
        }
    }

    #[test]
    fn found_runs_are_free_and_maximal_on_the_left(
        bitmap in proptest::collection::vec(any::<u8>(), 1..64),
        preferred_start_bit in 0_usize..512,
        run_length in 1_usize..40,
    ) {
        if let Some(found) = find_free_run(&bitmap, preferred_start_bit, run_length) {
            for bit in found..found + run_length {
                prop_assert_eq!(state(&bitmap, bit), State::Free);
            }
            // First fit from the scan's starting byte, so a run can only begin
            // mid-run on that byte boundary. Runs of a byte or more start on a
            // boundary and may follow free bits of a partially used byte.
            let scan_start = (preferred_start_bit / 8).min(bitmap.len()) * 8;
            if run_length >= 8 {
                prop_assert_eq!(found % 8, 0);
                if found > 0 && found != scan_start {
                    prop_assert_ne!(bitmap[found / 8 - 1], 0xff);
                }
            } else if found > 0 && found != scan_start {
                prop_assert_eq!(state(&bitmap, found - 1), State::Used);
            }
        }
    }

    #[test]
    fn scanning_twice_gives_the_same_answer(
        bitmap in proptest::collection::vec(any::<u8>(), 0..64),
        preferred_start_bit in 0_usize..512,
        run_length in 0_usize..40,
    ) {
        let first = find_free_run(&bitmap, preferred_start_bit, run_length);
        prop_assert_eq!(find_free_run(&bitmap, preferred_start_bit, run_length), first);
    }
}

#[test]
fn smallest_overflowing_block_is_the_capacity() {
    let map = BlockMap::default();
    let boundary = N_DIRECT + PTRS_PER_BLOCK + PTRS_PER_BLOCK.pow(2) + PTRS_PER_BLOCK.pow(3);

    assert_eq!(map.capacity(), boundary);
    assert!(map.resolve(BlockRef::Data(boundary - 1)).is_ok());
    assert!(matches!(
        map.resolve(BlockRef::Data(boundary)),
        Err(TptfsError::Overflow(n)) if n == boundary
    ));
}

#[test]
fn one_thousand_page_device_has_sixteen_inodes_per_table_page() {
    let layout = plan(1024, 4096, 256, 1).unwrap();
    assert_eq!(
        1 + layout.page_bitmap + layout.inode_bitmap + layout.inode_table + layout.data_region,
        1024
    );
    assert_eq!(layout.inode_count, layout.inode_table * 16);
}

#[test]
fn byte_sized_run_starts_after_a_partially_used_byte() {
    assert_eq!(find_free_run(&[0xf3, 0xff], 0, 8), Some(8));
}
