//! End-to-end walks over a freshly formatted image: create, read back,
//! truncate, append, directories and moves.

mod common;

use common::scenario_volume;
use vfat32::{Error, Mode, NodeKind, SeekFrom};

#[test]
fn create_write_read_back() {
    let (vol, _disk, _layout) = scenario_volume();

    let mut file = vol.open_file("/a.txt", Mode::Write).unwrap();
    let payload = [0xABu8; 1500];
    assert_eq!(file.write(&payload).unwrap(), 1500);
    file.close().unwrap();

    let stat = vol.stat("/a.txt").unwrap();
    assert_eq!(stat.kind, NodeKind::File);
    assert_eq!(stat.size, 1500);

    let mut file = vol.open_file("/a.txt", Mode::Read).unwrap();
    let mut buf = vec![0u8; 4096];
    assert_eq!(file.read(&mut buf).unwrap(), 1500);
    assert!(buf[..1500].iter().all(|&b| b == 0xAB));
    assert_eq!(file.read(&mut buf).unwrap(), 0);
    assert!(file.eof());
    assert_eq!(file.tell(), 1500);
}

#[test]
fn long_name_round_trip() {
    let (vol, disk, layout) = scenario_volume();

    let mut file = vol.open_file("/Long File Name.dat", Mode::Write).unwrap();
    assert_eq!(file.write(&[0x42u8; 10]).unwrap(), 10);
    file.close().unwrap();

    let mut dir = vol.open_dir("/").unwrap();
    let mut names = Vec::new();
    while let Some(record) = dir.read_entry().unwrap() {
        names.push(record.name);
    }
    assert!(names.iter().any(|n| n == "Long File Name.dat"));

    // Raw slot layout in the root: the name needs two chunks, so slot 0 is
    // the LAST-flagged chunk, slot 1 the first chunk, slot 2 the short
    // entry.
    let slots = layout.dir_slots(&disk, 2);
    assert_eq!(slots[0][11], 0x0F);
    assert_ne!(slots[0][0] & 0x40, 0);
    assert_eq!(slots[1][11], 0x0F);
    assert_eq!(slots[1][0], 1);
    assert_ne!(slots[2][11] & 0x0F, 0x0F);
    assert_eq!(slots[2][28..32], 10u32.to_le_bytes());
}

#[test]
fn reopen_for_write_truncates() {
    let (vol, disk, layout) = scenario_volume();

    let mut file = vol.open_file("/a.txt", Mode::Write).unwrap();
    file.write(&[0xABu8; 1500]).unwrap();
    file.close().unwrap();
    let free_before = vol.free_clusters();

    let file = vol.open_file("/a.txt", Mode::Write).unwrap();
    file.close().unwrap();

    assert_eq!(vol.stat("/a.txt").unwrap().size, 0);
    // 1500 bytes over 512-byte clusters held three clusters.
    assert_eq!(vol.free_clusters(), free_before + 3);
    assert_eq!(layout.fsinfo_free(&disk), free_before + 3);
}

#[test]
fn append_extends() {
    let (vol, _disk, _layout) = scenario_volume();

    let mut file = vol.open_file("/a.txt", Mode::Write).unwrap();
    file.write(&[0xABu8; 1500]).unwrap();
    file.close().unwrap();

    let mut file = vol.open_file("/a.txt", Mode::Append).unwrap();
    assert_eq!(file.tell(), 1500);
    assert_eq!(file.write(&[0xCDu8; 100]).unwrap(), 100);
    file.close().unwrap();

    assert_eq!(vol.stat("/a.txt").unwrap().size, 1600);
    let mut file = vol.open_file("/a.txt", Mode::Read).unwrap();
    let mut buf = vec![0u8; 1600];
    assert_eq!(file.read(&mut buf).unwrap(), 1600);
    assert!(buf[..1500].iter().all(|&b| b == 0xAB));
    assert!(buf[1500..].iter().all(|&b| b == 0xCD));
}

#[test]
fn make_dir_and_remove_dir() {
    let (vol, _disk, _layout) = scenario_volume();

    vol.make_dir("/d").unwrap();
    assert_eq!(vol.stat("/d").unwrap().kind, NodeKind::Dir);

    let mut dir = vol.open_dir("/d").unwrap();
    let mut names = Vec::new();
    while let Some(record) = dir.read_entry().unwrap() {
        names.push(record.name);
    }
    assert_eq!(names, [".", ".."]);

    vol.remove_dir("/d").unwrap();
    assert_eq!(vol.remove_dir("/d").unwrap_err(), Error::NotFound);
    assert_eq!(vol.stat("/d").unwrap_err(), Error::NotFound);
}

#[test]
fn remove_dir_rejects_non_empty() {
    let (vol, _disk, _layout) = scenario_volume();

    vol.make_dir("/d").unwrap();
    let mut file = vol.open_file("/d/f", Mode::Write).unwrap();
    file.write(&[1u8]).unwrap();
    file.close().unwrap();

    assert_eq!(vol.remove_dir("/d").unwrap_err(), Error::NotEmpty);

    vol.remove("/d/f").unwrap();
    vol.remove_dir("/d").unwrap();
}

#[test]
fn rename_across_directories() {
    let (vol, _disk, _layout) = scenario_volume();

    vol.make_dir("/a").unwrap();
    vol.make_dir("/b").unwrap();
    let mut file = vol.open_file("/a/x", Mode::Write).unwrap();
    file.write(b"hello").unwrap();
    file.close().unwrap();

    vol.rename("/a/x", "/b/y").unwrap();

    assert_eq!(vol.stat("/a/x").unwrap_err(), Error::NotFound);
    assert_eq!(vol.stat("/b/y").unwrap().size, 5);

    let mut file = vol.open_file("/b/y", Mode::Read).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(file.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
}

#[test]
fn fill_until_no_space() {
    let (vol, disk, layout) = common::small_volume();

    let mut file = vol.open_file("/big.bin", Mode::Write).unwrap();
    let chunk = [0x55u8; 512];
    let mut written = 0u64;
    loop {
        match file.write(&chunk) {
            Ok(n) => {
                assert_eq!(n, 512);
                written += n as u64;
            }
            Err(err) => {
                assert_eq!(err, Error::NoSpace);
                break;
            }
        }
    }
    file.close().unwrap();

    // Every allocatable cluster went to the file.
    assert_eq!(written, layout.initial_free as u64 * 512);
    assert_eq!(vol.free_clusters(), 0);
    assert_eq!(layout.fsinfo_free(&disk), 0);

    // Freeing the chain restores exactly that many clusters.
    vol.remove("/big.bin").unwrap();
    assert_eq!(vol.free_clusters(), layout.initial_free);
    assert_eq!(layout.fsinfo_free(&disk), layout.initial_free);
}

#[test]
fn seek_is_bounded_by_size() {
    let (vol, _disk, _layout) = scenario_volume();

    let mut file = vol.open_file("/s.bin", Mode::Write).unwrap();
    file.write(&[7u8; 2000]).unwrap();
    file.close().unwrap();

    let mut file = vol.open_file("/s.bin", Mode::Read).unwrap();
    assert_eq!(file.seek(SeekFrom::Start(1999)).unwrap(), 1999);
    assert_eq!(file.seek(SeekFrom::End(0)).unwrap(), 2000);
    assert_eq!(file.seek(SeekFrom::Current(-2000)).unwrap(), 0);
    assert_eq!(file.seek(SeekFrom::Start(2001)).unwrap_err(), Error::Invalid);
    assert_eq!(file.seek(SeekFrom::Current(-1)).unwrap_err(), Error::Invalid);

    // Backward then forward repositioning still reads the right bytes.
    file.seek(SeekFrom::Start(512)).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(file.read(&mut buf).unwrap(), 8);
    assert_eq!(buf, [7u8; 8]);
}

#[test]
fn open_mode_rules() {
    let (vol, _disk, _layout) = scenario_volume();

    assert_eq!(
        vol.open_file("/missing", Mode::Read).unwrap_err(),
        Error::NotFound
    );

    vol.make_dir("/d").unwrap();
    assert_eq!(
        vol.open_file("/d", Mode::Read).unwrap_err(),
        Error::IsDirectory
    );
    assert_eq!(vol.open_dir("/missing").unwrap_err(), Error::NotFound);

    let mut file = vol.open_file("/f", Mode::Write).unwrap();
    file.write(b"abc").unwrap();
    file.close().unwrap();
    assert_eq!(vol.open_dir("/f").unwrap_err(), Error::NotADirectory);

    // Append creates missing files too.
    let mut file = vol.open_file("/g", Mode::Append).unwrap();
    file.write(b"xy").unwrap();
    file.close().unwrap();
    assert_eq!(vol.stat("/g").unwrap().size, 2);

    // Handles only move data in their own direction.
    let mut buf = [0u8; 4];
    let mut reader = vol.open_file("/f", Mode::Read).unwrap();
    assert_eq!(reader.write(b"zz").unwrap(), 0);
    let mut writer = vol.open_file("/g", Mode::Append).unwrap();
    assert_eq!(writer.read(&mut buf).unwrap(), 0);
}

#[test]
fn rename_within_directory_and_conflicts() {
    let (vol, _disk, _layout) = scenario_volume();

    let mut file = vol.open_file("/x", Mode::Write).unwrap();
    file.write(b"data").unwrap();
    file.close().unwrap();

    vol.rename("/x", "/y").unwrap();
    assert_eq!(vol.stat("/x").unwrap_err(), Error::NotFound);
    assert_eq!(vol.stat("/y").unwrap().size, 4);

    let file = vol.open_file("/z", Mode::Write).unwrap();
    file.close().unwrap();
    assert_eq!(vol.rename("/y", "/z").unwrap_err(), Error::AlreadyExists);
    assert_eq!(vol.rename("/gone", "/w").unwrap_err(), Error::NotFound);
    assert_eq!(vol.make_dir("/y").unwrap_err(), Error::AlreadyExists);
}

#[test]
fn unmount_rewrites_hints() {
    let (vol, disk, layout) = scenario_volume();

    let mut file = vol.open_file("/a", Mode::Write).unwrap();
    file.write(&[9u8; 600]).unwrap();
    file.close().unwrap();
    let free = vol.free_clusters();

    vol.unmount().unwrap();
    assert_eq!(layout.fsinfo_free(&disk), free);
}
