use tptfs::io::FileBlockEmulatorBuilder;
use tptfs::{BlockRef, StorageBudget, Tptfs};

pub fn main() {
    env_logger::init();

    let pages = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(1024);

    let tmp = tempfile::tempfile().unwrap();
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(pages)
        .build()
        .expect("Could not initialize disk emulator.");

    // create a new file system on the device and hand out a few pages
    let mut fs = Tptfs::create(dev, &StorageBudget::new(pages)).expect("should create");
    println!("{:#?}", fs.layout());

    let ino = fs.alloc_inode().unwrap();
    let first = fs.alloc_pages(4).unwrap();
    println!("inode {} owns pages {}..{}", ino, first, first + 4);

    for lbn in &[0, 12, 12 + 512, 12 + 512 + 512 * 512] {
        let path = fs.map(BlockRef::Data(*lbn)).unwrap();
        println!("block {} -> slot {:?} via {:?}", lbn, path.root_slot(), path.as_slice());
    }
}
