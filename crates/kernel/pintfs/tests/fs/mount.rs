use pintfs::{FREE_MAP_SECTOR, FsError, ROOT_DIR_SECTOR, SectorNo};

use crate::common::{self, Fs, MemDisk};

#[test]
fn unformatted_disk_is_rejected() {
    common::init_logger();
    let Err(e) = Fs::mount(MemDisk::new(64), &common::config(8)) else {
        panic!("mounted a blank disk");
    };
    assert_eq!(e, FsError::NotFormatted);

    let Err(e) = Fs::mount(MemDisk::new(1), &common::config(8)) else {
        panic!("mounted a one-sector disk");
    };
    assert_eq!(e, FsError::NotFormatted);
}

#[test]
fn tiny_disk_cannot_be_formatted() {
    common::init_logger();
    for num_sectors in [1, 2, 9] {
        let Err(e) = Fs::format(MemDisk::new(num_sectors), &common::config(4)) else {
            panic!("formatted {num_sectors} sectors");
        };
        assert_eq!(e, FsError::NoSpace);
    }
}

#[test]
fn free_map_and_files_survive_remount() {
    let (disk, fs) = common::format(256, 8);
    let root = SectorNo::new(ROOT_DIR_SECTOR);
    let a = fs.create(0, false, root).unwrap();
    let b = fs.create(3000, false, root).unwrap();
    let file = fs.open(a).unwrap();
    assert_eq!(file.write_at(b"persistent", 600).unwrap(), 10);
    file.close().unwrap();
    let free = fs.free_sectors();
    fs.shutdown().unwrap();

    let fs = Fs::mount(disk.clone(), &common::config(8)).unwrap();
    assert_eq!(fs.free_sectors(), free);
    let file = fs.open(a).unwrap();
    assert_eq!(file.length(), 610);
    let mut buf = [0; 10];
    assert_eq!(file.read_at(&mut buf, 600).unwrap(), 10);
    assert_eq!(&buf, b"persistent");
    assert_eq!(fs.open(b).unwrap().length(), 3000);

    // freeing after remount returns to the state of a fresh format
    file.remove();
    file.close().unwrap();
    fs.open(b).unwrap().remove();
    fs.sync().unwrap();
    drop(fs);

    let fresh = common::format(256, 8).1.free_sectors();
    let fs = Fs::mount(disk, &common::config(8)).unwrap();
    assert_eq!(fs.free_sectors(), fresh);
}

#[test]
fn reserved_inodes_are_in_use() {
    let (_disk, fs) = common::format(128, 8);
    let free_map = fs.open(SectorNo::new(FREE_MAP_SECTOR)).unwrap();
    assert!(!free_map.is_dir());
    assert_eq!(free_map.length(), 128 / 8);
    // two reserved inodes and the free map's allocation group
    assert_eq!(fs.free_sectors(), 128 - 2 - 8);
}

#[test]
fn sync_writes_dirty_sectors() {
    let (disk, fs) = common::format(64, 8);
    let sector = fs.create(0, false, SectorNo::new(ROOT_DIR_SECTOR)).unwrap();
    let file = fs.open(sector).unwrap();
    let writes = disk.writes();
    assert_eq!(file.write_at(&[0x42; 20], 0).unwrap(), 20);
    assert_eq!(disk.writes(), writes);

    fs.sync().unwrap();
    assert!(disk.writes() > writes);
    assert!((0..64).any(|i| disk.sector(i)[..20] == [0x42; 20]));
}
