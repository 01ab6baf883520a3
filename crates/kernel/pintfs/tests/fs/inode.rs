use pintfs::{FsError, MAX_FILE_SIZE, ROOT_DIR_SECTOR, SECTOR_SIZE, SectorNo};
use rand::{Rng as _, SeedableRng as _, rngs::SmallRng};

use crate::common::{self, Fs, MemDisk};

const NUM_DIRECT: usize = 12;
const PTRS_PER_SECTOR: usize = 128;

fn root() -> SectorNo {
    SectorNo::new(ROOT_DIR_SECTOR)
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut bytes = vec![0; len];
    SmallRng::seed_from_u64(seed).fill(&mut bytes[..]);
    bytes
}

#[test]
fn write_past_end_reads_zeros_in_gap() {
    common::init_logger();
    let disk = MemDisk::filled(256, 0xaa);
    let fs = Fs::format(disk, &common::config(16)).unwrap();
    let sector = fs.create(0, false, root()).unwrap();
    let file = fs.open(sector).unwrap();
    assert_eq!(file.length(), 0);

    assert_eq!(file.write_at(b"head", 10).unwrap(), 4);
    assert_eq!(file.write_at(b"tail", 5000).unwrap(), 4);
    assert_eq!(file.length(), 5004);

    let mut buf = vec![0xff; 6000];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), 5004);
    assert!(buf[..10].iter().all(|&b| b == 0));
    assert_eq!(&buf[10..14], b"head");
    assert!(buf[14..5000].iter().all(|&b| b == 0));
    assert_eq!(&buf[5000..5004], b"tail");
    file.close().unwrap();
}

#[test]
fn created_length_reads_as_zeros() {
    common::init_logger();
    let disk = MemDisk::filled(128, 0xcc);
    let fs = Fs::format(disk, &common::config(8)).unwrap();
    let sector = fs.create(3 * SECTOR_SIZE + 7, false, root()).unwrap();
    let file = fs.open(sector).unwrap();

    let mut buf = vec![0xff; 4 * SECTOR_SIZE];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), 3 * SECTOR_SIZE + 7);
    assert!(buf[..3 * SECTOR_SIZE + 7].iter().all(|&b| b == 0));
    assert_eq!(file.read_at(&mut buf, 3 * SECTOR_SIZE + 7).unwrap(), 0);
}

#[test]
fn data_round_trips_through_every_index_level() {
    let len = (NUM_DIRECT + PTRS_PER_SECTOR + 50) * SECTOR_SIZE + 77;
    let data = random_bytes(len, 7);
    let (disk, fs) = common::format(1024, 8);

    let sector = fs.create(0, false, root()).unwrap();
    let file = fs.open(sector).unwrap();
    let mut rng = SmallRng::seed_from_u64(8);
    let mut pos = 0;
    while pos < len {
        let chunk = rng.random_range(1..=3 * SECTOR_SIZE).min(len - pos);
        assert_eq!(file.write_at(&data[pos..][..chunk], pos).unwrap(), chunk);
        pos += chunk;
    }
    file.close().unwrap();
    assert_eq!(fs.open_inodes(), 0);

    let file = fs.open(sector).unwrap();
    assert_eq!(file.length(), len);
    let mut buf = vec![0; len];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), len);
    assert!(buf == data);

    // unaligned reads straddling sector boundaries
    for _ in 0..50 {
        let offset = rng.random_range(0..len);
        let n = rng.random_range(1..2000);
        let mut buf = vec![0; n];
        let read = file.read_at(&mut buf, offset).unwrap();
        assert_eq!(read, n.min(len - offset));
        assert_eq!(buf[..read], data[offset..][..read]);
    }
    file.close().unwrap();
    assert!(fs.cache().stats().evictions > 0);

    fs.shutdown().unwrap();
    let fs = Fs::mount(disk, &common::config(8)).unwrap();
    let file = fs.open(sector).unwrap();
    let mut buf = vec![0; len];
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), len);
    assert!(buf == data);
}

#[test]
fn removed_inode_is_freed_on_last_close() {
    let (_disk, fs) = common::format(512, 16);
    let free = fs.free_sectors();

    let blocks = NUM_DIRECT + PTRS_PER_SECTOR + 3;
    let sector = fs.create(blocks * SECTOR_SIZE, false, root()).unwrap();
    // 18 groups of 8 for 143 data blocks, 3 index blocks, the inode itself
    assert_eq!(free - fs.free_sectors(), 18 * 8 + 3 + 1);

    let a = fs.open(sector).unwrap();
    let b = a.reopen().unwrap();
    assert_eq!(b.open_count(), 2);
    a.remove();
    assert!(b.is_removed());
    a.close().unwrap();
    assert_eq!(free - fs.free_sectors(), 18 * 8 + 3 + 1);

    // still readable and writable through the remaining handle
    assert_eq!(b.write_at(b"x", 0).unwrap(), 1);
    let mut buf = [0; 1];
    assert_eq!(b.read_at(&mut buf, 0).unwrap(), 1);
    assert_eq!(&buf, b"x");

    b.close().unwrap();
    assert_eq!(fs.free_sectors(), free);
    assert_eq!(fs.open_inodes(), 0);
}

#[test]
fn deleted_inode_cannot_be_opened() {
    let (_disk, fs) = common::format(256, 8);
    let sector = fs.create(2 * SECTOR_SIZE, false, root()).unwrap();
    let file = fs.open(sector).unwrap();
    file.remove();
    file.close().unwrap();

    assert_eq!(fs.open(sector).err(), Some(FsError::NotAnInode(sector)));
    assert_eq!(fs.open_inodes(), 0);

    // the freed sector is handed out again and opens as the new inode
    let reused = fs.create(5 * SECTOR_SIZE, false, root()).unwrap();
    assert_eq!(reused, sector);
    assert_eq!(fs.open(reused).unwrap().length(), 5 * SECTOR_SIZE);
}

#[test]
fn dropped_handle_closes_inode() {
    let (_disk, fs) = common::format(128, 8);
    let free = fs.free_sectors();
    let sector = fs.create(100, false, root()).unwrap();
    {
        let file = fs.open(sector).unwrap();
        file.remove();
        assert_eq!(fs.open_inodes(), 1);
    }
    assert_eq!(fs.open_inodes(), 0);
    assert_eq!(fs.free_sectors(), free);
}

#[test]
fn denied_writes_do_nothing() {
    let (_disk, fs) = common::format(128, 8);
    let sector = fs.create(0, false, root()).unwrap();
    let mut exe = fs.open(sector).unwrap();
    let other = exe.reopen().unwrap();

    exe.deny_write();
    exe.deny_write();
    assert_eq!(other.write_at(b"data", 0).unwrap(), 0);
    assert_eq!(exe.write_at(b"data", 0).unwrap(), 0);
    assert_eq!(other.length(), 0);

    exe.allow_write();
    assert_eq!(other.write_at(b"data", 0).unwrap(), 4);

    // closing a denying handle lifts its denial
    exe.deny_write();
    assert_eq!(other.write_at(b"more", 4).unwrap(), 0);
    exe.close().unwrap();
    assert_eq!(other.write_at(b"more", 4).unwrap(), 4);
    assert_eq!(other.length(), 8);
}

#[test]
fn size_limit_is_enforced() {
    let (_disk, fs) = common::format(128, 8);
    let free = fs.free_sectors();
    assert_eq!(
        fs.create(MAX_FILE_SIZE + 1, false, root()),
        Err(FsError::FileTooLarge)
    );
    assert_eq!(fs.free_sectors(), free);

    let sector = fs.create(0, false, root()).unwrap();
    let file = fs.open(sector).unwrap();
    assert_eq!(file.write_at(b"z", MAX_FILE_SIZE), Err(FsError::FileTooLarge));
    assert_eq!(file.write_at(b"z", usize::MAX), Err(FsError::FileTooLarge));
    assert_eq!(file.length(), 0);
}

#[test]
fn exhausted_disk_leaves_state_unchanged() {
    let (_disk, fs) = common::format(64, 8);
    let free = fs.free_sectors();
    assert_eq!(
        fs.create(60 * SECTOR_SIZE, false, root()),
        Err(FsError::NoSpace)
    );
    assert_eq!(fs.free_sectors(), free);

    let sector = fs.create(SECTOR_SIZE, false, root()).unwrap();
    let file = fs.open(sector).unwrap();
    let used = fs.free_sectors();
    assert_eq!(
        file.write_at(&[1; SECTOR_SIZE], 60 * SECTOR_SIZE),
        Err(FsError::NoSpace)
    );
    assert_eq!(file.length(), SECTOR_SIZE);
    assert_eq!(fs.free_sectors(), used);

    assert_eq!(file.write_at(&[1; 10], 2 * SECTOR_SIZE).unwrap(), 10);
    assert_eq!(file.length(), 2 * SECTOR_SIZE + 10);
}

#[test]
fn open_rejects_sector_without_inode() {
    let (_disk, fs) = common::format(64, 8);
    let sector = SectorNo::new(40);
    assert_eq!(fs.open(sector).err(), Some(FsError::NotAnInode(sector)));
    assert_eq!(fs.open_inodes(), 0);
}

#[test]
fn root_directory_is_its_own_parent() {
    let (_disk, fs) = common::format(64, 8);
    let root_dir = fs.root().unwrap();
    assert!(root_dir.is_dir());
    assert_eq!(root_dir.inumber(), root());
    assert_eq!(root_dir.parent(), root());
    assert_eq!(root_dir.length(), 0);

    let dir = fs.create(0, true, root()).unwrap();
    let dir = fs.open(dir).unwrap();
    assert!(dir.is_dir());
    assert_eq!(dir.parent(), root());
}

#[test]
fn read_failure_is_reported() {
    let (disk, fs) = common::format(64, 4);
    let sector = fs.create(SECTOR_SIZE, false, root()).unwrap();
    let file = fs.open(sector).unwrap();
    assert_eq!(file.write_at(&[7; 4], 0).unwrap(), 4);
    fs.sync().unwrap();

    // push the data sector out of the cache, then break it
    let data = (0..64).find(|&i| disk.sector(i)[..4] == [7; 4]).unwrap();
    let mut buf = [0; 4];
    let mut i = 0;
    while fs.cache().resident_blocks().contains(&data) {
        fs.cache().read(20 + i % 30, 0, &mut buf).unwrap();
        i += 1;
        assert!(i < 1000, "sector {data} never evicted");
    }
    disk.set_faulty(data, true);
    assert_eq!(file.read_at(&mut buf, 0), Err(FsError::Io));

    disk.set_faulty(data, false);
    assert_eq!(file.read_at(&mut buf, 0).unwrap(), 4);
    assert_eq!(buf, [7; 4]);
}
