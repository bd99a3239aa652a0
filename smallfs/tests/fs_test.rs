use smallfs::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use smallfs::{Config, SFSError, BLOCK_SIZE, MAX_FILE_BLOCKS, SFS};
use tempfile::NamedTempFile;

const DISK_BLOCKS: usize = 1024;
/// Data blocks left on a default volume of `DISK_BLOCKS` blocks.
const DATA_BLOCKS: usize = DISK_BLOCKS - 12;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn create_test_device(blocks: usize) -> FileBlockEmulator {
    FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
        .with_block_count(blocks)
        .build()
        .expect("Could not initialize disk emulator.")
}

fn fresh_fs() -> SFS<FileBlockEmulator> {
    init();
    SFS::mount(create_test_device(DISK_BLOCKS), true).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn written_bytes_read_back() {
    let mut fs = fresh_fs();
    let data = pattern(3 * BLOCK_SIZE + 17);

    let fd = fs.open("a").unwrap();
    assert_eq!(fs.write(fd, &data).unwrap(), data.len());
    fs.seek(fd, 0).unwrap();

    assert_eq!(fs.read(fd, data.len()).unwrap(), data);
    assert_eq!(fs.file_size("a").unwrap(), data.len());
}

#[test]
fn hello_end_to_end() {
    let mut fs = fresh_fs();

    let fd = fs.open("a.txt").unwrap();
    assert_eq!(fs.write(fd, b"hello").unwrap(), 5);
    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, 5).unwrap(), b"hello");
    fs.close(fd).unwrap();
    fs.remove("a.txt").unwrap();

    assert!(matches!(fs.file_size("a.txt"), Err(SFSError::NotFound)));
    assert_eq!(fs.free_blocks(), DATA_BLOCKS);
}

#[test]
fn new_files_are_empty() {
    let mut fs = fresh_fs();
    for name in &["x", "notes.txt", "sixteen_chars_ok", "ünïcödé"] {
        fs.open(name).unwrap();
        assert_eq!(fs.file_size(name).unwrap(), 0);
    }
    assert_eq!(fs.free_blocks(), DATA_BLOCKS);
}

#[test]
fn opening_existing_file_keeps_content() {
    let mut fs = fresh_fs();
    let fd = fs.open("a").unwrap();
    fs.write(fd, b"kept").unwrap();

    let again = fs.open("a").unwrap();
    assert_ne!(fd, again);
    assert_eq!(fs.read(again, 10).unwrap(), b"kept");
    assert_eq!(fs.stat("a").unwrap().inode, fs.stat("a").unwrap().inode);
}

#[test]
fn removed_files_are_gone() {
    let mut fs = fresh_fs();
    let fd = fs.open("gone").unwrap();
    fs.write(fd, &pattern(20 * BLOCK_SIZE)).unwrap();
    fs.close(fd).unwrap();

    fs.remove("gone").unwrap();

    assert!(matches!(fs.file_size("gone"), Err(SFSError::NotFound)));
    assert!(matches!(fs.remove("gone"), Err(SFSError::NotFound)));
    // Indirect block included.
    assert_eq!(fs.free_blocks(), DATA_BLOCKS);

    // The name can be reused for a new, empty file.
    let fd = fs.open("gone").unwrap();
    assert_eq!(fs.file_size("gone").unwrap(), 0);
    assert!(fs.read(fd, 10).unwrap().is_empty());
}

#[test]
fn listing_yields_each_file_once() {
    let mut fs = fresh_fs();
    for name in &["f1", "f2", "f3"] {
        fs.open(name).unwrap();
    }

    let mut names = Vec::new();
    loop {
        match fs.next_filename() {
            Ok(name) => names.push(name),
            Err(SFSError::EndOfDirectory) => break,
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    assert_eq!(names, vec!["f1", "f2", "f3"]);
    // The listing does not restart by itself.
    assert!(matches!(fs.next_filename(), Err(SFSError::EndOfDirectory)));
}

#[test]
fn listing_is_a_live_view() {
    let mut fs = fresh_fs();
    for name in &["f1", "f2", "f3"] {
        fs.open(name).unwrap();
    }

    assert_eq!(fs.next_filename().unwrap(), "f1");
    fs.remove("f1").unwrap();
    fs.remove("f3").unwrap();
    // Reuses the slot of f1, behind the listing.
    fs.open("f4").unwrap();
    // Lands in a slot ahead of the listing.
    fs.open("f5").unwrap();

    assert_eq!(fs.next_filename().unwrap(), "f2");
    assert_eq!(fs.next_filename().unwrap(), "f5");
    assert!(matches!(fs.next_filename(), Err(SFSError::EndOfDirectory)));
}

#[test]
fn empty_directory_ends_immediately() {
    let mut fs = fresh_fs();
    assert!(matches!(fs.next_filename(), Err(SFSError::EndOfDirectory)));
}

#[test]
fn failed_allocation_changes_nothing() {
    init();
    let config = Config {
        inode_count: 8,
        max_open_files: 4,
    };
    // Super block, bitmap, inode table and directory take one block each.
    let mut fs = SFS::mount_with_config(create_test_device(64), true, config).unwrap();
    assert_eq!(fs.free_blocks(), 60);

    let big = fs.open("big").unwrap();
    fs.write(big, &pattern(50 * BLOCK_SIZE)).unwrap();
    // Fifty data blocks and an indirect block.
    assert_eq!(fs.free_blocks(), 9);

    let small = fs.open("small").unwrap();
    fs.write(small, b"before").unwrap();
    assert_eq!(fs.free_blocks(), 8);

    fs.seek(small, 0).unwrap();
    match fs.write(small, &pattern(10 * BLOCK_SIZE)) {
        Err(SFSError::InsufficientSpace {
            requested: 10,
            available: 9,
        }) => (),
        other => panic!("unexpected result {:?}", other),
    }

    assert_eq!(fs.free_blocks(), 8);
    assert_eq!(fs.file_size("small").unwrap(), 6);
    assert_eq!(fs.read(small, 100).unwrap(), b"before");

    // Exactly the space that is left still fits.
    fs.seek(small, 0).unwrap();
    fs.write(small, &pattern(9 * BLOCK_SIZE)).unwrap();
    assert_eq!(fs.free_blocks(), 0);
}

#[test]
fn rewrite_releases_superseded_blocks() {
    let mut fs = fresh_fs();
    let fd = fs.open("doc").unwrap();
    fs.write(fd, &pattern(5000)).unwrap();
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 5);
    fs.close(fd).unwrap();

    let fd = fs.open("doc").unwrap();
    fs.write(fd, b"short").unwrap();

    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 1);
    assert_eq!(fs.stat("doc").unwrap().blocks, 1);
    assert_eq!(fs.file_size("doc").unwrap(), 5);
    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, 5000).unwrap(), b"short");
}

#[test]
fn rewriting_many_times_does_not_leak() {
    let mut fs = fresh_fs();
    let fd = fs.open("log").unwrap();
    for round in 0..50 {
        fs.seek(fd, 0).unwrap();
        fs.write(fd, &pattern(BLOCK_SIZE * (1 + round % 20))).unwrap();
    }
    // Last round wrote 10 blocks.
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 10);
}

#[test]
fn sequential_writes_append() {
    let mut fs = fresh_fs();
    let fd = fs.open("stream").unwrap();
    let first = pattern(BLOCK_SIZE + 100);
    let second = vec![0xab_u8; 2 * BLOCK_SIZE];

    fs.write(fd, &first).unwrap();
    fs.write(fd, &second).unwrap();

    let mut expected = first.clone();
    expected.extend_from_slice(&second);
    assert_eq!(fs.file_size("stream").unwrap(), expected.len());
    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, expected.len()).unwrap(), expected);
    assert_eq!(fs.stat("stream").unwrap().blocks, 4);
}

#[test]
fn writing_mid_file_truncates_at_offset() {
    let mut fs = fresh_fs();
    let fd = fs.open("t").unwrap();
    fs.write(fd, b"hello world").unwrap();

    fs.seek(fd, 6).unwrap();
    fs.write(fd, b"there").unwrap();
    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, 64).unwrap(), b"hello there");

    fs.seek(fd, 2).unwrap();
    fs.write(fd, b"y").unwrap();
    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, 64).unwrap(), b"hey");
    assert_eq!(fs.file_size("t").unwrap(), 3);
}

#[test]
fn writing_inside_later_block_keeps_earlier_blocks() {
    let mut fs = fresh_fs();
    let fd = fs.open("t").unwrap();
    let data = pattern(4 * BLOCK_SIZE);
    fs.write(fd, &data).unwrap();

    fs.seek(fd, 2 * BLOCK_SIZE + 10).unwrap();
    fs.write(fd, b"tail").unwrap();

    let mut expected = data[..2 * BLOCK_SIZE + 10].to_vec();
    expected.extend_from_slice(b"tail");
    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, 10 * BLOCK_SIZE).unwrap(), expected);
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 3);
}

#[test]
fn reads_stop_at_end_of_file() {
    let mut fs = fresh_fs();
    let fd = fs.open("r").unwrap();
    fs.write(fd, b"0123456789").unwrap();

    fs.seek(fd, 4).unwrap();
    assert_eq!(fs.read(fd, 3).unwrap(), b"456");
    // The offset moved past what was read.
    assert_eq!(fs.read(fd, 100).unwrap(), b"789");
    assert!(fs.read(fd, 100).unwrap().is_empty());
    assert!(fs.read(fd, 0).unwrap().is_empty());
}

#[test]
fn seeking_past_end_reads_nothing_until_written() {
    let mut fs = fresh_fs();
    let fd = fs.open("gap").unwrap();
    fs.write(fd, b"abc").unwrap();

    fs.seek(fd, BLOCK_SIZE + 5).unwrap();
    assert!(fs.read(fd, 10).unwrap().is_empty());

    fs.write(fd, b"xyz").unwrap();
    assert_eq!(fs.file_size("gap").unwrap(), BLOCK_SIZE + 8);

    fs.seek(fd, 0).unwrap();
    let content = fs.read(fd, 2 * BLOCK_SIZE).unwrap();
    assert_eq!(&content[..3], b"abc");
    assert!(content[3..BLOCK_SIZE + 5].iter().all(|&b| b == 0));
    assert_eq!(&content[BLOCK_SIZE + 5..], b"xyz");
}

#[test]
fn empty_write_truncates_at_offset() {
    let mut fs = fresh_fs();
    let fd = fs.open("e").unwrap();
    fs.write(fd, &pattern(3 * BLOCK_SIZE)).unwrap();
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 3);

    // Cutting inside the second block keeps the first two.
    fs.seek(fd, BLOCK_SIZE + 10).unwrap();
    assert_eq!(fs.write(fd, b"").unwrap(), 0);
    assert_eq!(fs.file_size("e").unwrap(), BLOCK_SIZE + 10);
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 2);
    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, 4 * BLOCK_SIZE).unwrap(), pattern(BLOCK_SIZE + 10));

    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.write(fd, b"").unwrap(), 0);
    assert_eq!(fs.file_size("e").unwrap(), 0);
    assert_eq!(fs.free_blocks(), DATA_BLOCKS);
}

#[test]
fn largest_file_uses_indirect_block() {
    let mut fs = fresh_fs();
    let fd = fs.open("max").unwrap();
    let data = pattern(MAX_FILE_BLOCKS * BLOCK_SIZE);

    assert_eq!(fs.write(fd, &data).unwrap(), data.len());
    assert_eq!(fs.stat("max").unwrap().blocks, MAX_FILE_BLOCKS + 1);
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - MAX_FILE_BLOCKS - 1);

    fs.seek(fd, 0).unwrap();
    assert_eq!(fs.read(fd, data.len()).unwrap(), data);

    // Shrinking below the direct pointers gives the indirect block back.
    fs.seek(fd, 0).unwrap();
    fs.write(fd, b"small").unwrap();
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 1);
}

#[test]
fn oversized_writes_exceed_capacity() {
    let mut fs = fresh_fs();
    let fd = fs.open("huge").unwrap();
    fs.write(fd, b"keep").unwrap();
    fs.seek(fd, 0).unwrap();

    match fs.write(fd, &pattern(MAX_FILE_BLOCKS * BLOCK_SIZE + 1)) {
        Err(SFSError::CapacityExceeded { blocks }) => assert_eq!(blocks, MAX_FILE_BLOCKS + 1),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(fs.file_size("huge").unwrap(), 4);
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 1);

    // Offsets count towards the limit too.
    fs.seek(fd, MAX_FILE_BLOCKS * BLOCK_SIZE).unwrap();
    assert!(matches!(
        fs.write(fd, b"x"),
        Err(SFSError::CapacityExceeded { .. })
    ));
    fs.seek(fd, usize::MAX).unwrap();
    assert!(matches!(
        fs.write(fd, b"x"),
        Err(SFSError::CapacityExceeded { .. })
    ));
    assert_eq!(fs.file_size("huge").unwrap(), 4);
}

#[test]
fn writes_near_the_end_of_the_address_space_exceed_capacity() {
    let mut fs = fresh_fs();
    let fd = fs.open("far").unwrap();
    fs.write(fd, b"keep").unwrap();

    fs.seek(fd, usize::MAX - 100).unwrap();
    assert!(matches!(
        fs.write(fd, b"x"),
        Err(SFSError::CapacityExceeded { .. })
    ));
    assert!(matches!(
        fs.write(fd, b""),
        Err(SFSError::CapacityExceeded { .. })
    ));
    assert_eq!(fs.file_size("far").unwrap(), 4);
    assert_eq!(fs.free_blocks(), DATA_BLOCKS - 1);
}

#[test]
fn descriptors_share_one_inode() {
    let mut fs = fresh_fs();
    let writer = fs.open("shared").unwrap();
    let reader = fs.open("shared").unwrap();

    fs.write(writer, b"first").unwrap();
    assert_eq!(fs.read(reader, 100).unwrap(), b"first");

    fs.write(writer, b" second").unwrap();
    assert_eq!(fs.read(reader, 100).unwrap(), b" second");
    assert_eq!(fs.file_size("shared").unwrap(), 12);
}

#[test]
fn descriptors_of_removed_files_dangle() {
    let mut fs = fresh_fs();
    let fd = fs.open("victim").unwrap();
    fs.write(fd, b"data").unwrap();

    fs.remove("victim").unwrap();

    assert!(matches!(fs.read(fd, 4), Err(SFSError::NotFound)));
    assert!(matches!(fs.write(fd, b"x"), Err(SFSError::NotFound)));
    assert!(matches!(fs.seek(fd, 0), Err(SFSError::NotFound)));

    // A new file with the same name is a different file.
    let other = fs.open("victim").unwrap();
    assert_ne!(other, fd);
    assert!(matches!(fs.read(fd, 4), Err(SFSError::NotFound)));

    fs.close(fd).unwrap();
    assert!(matches!(fs.close(fd), Err(SFSError::InvalidDescriptor(_))));
}

#[test]
fn unknown_descriptors_are_rejected() {
    let mut fs = fresh_fs();
    let fd = fs.open("a").unwrap();
    fs.close(fd).unwrap();

    assert!(matches!(fs.read(fd, 1), Err(SFSError::InvalidDescriptor(_))));
    assert!(matches!(fs.write(fd, b"x"), Err(SFSError::InvalidDescriptor(_))));
    assert!(matches!(fs.seek(fd, 0), Err(SFSError::InvalidDescriptor(_))));
    assert!(matches!(fs.close(fd), Err(SFSError::InvalidDescriptor(_))));
    assert!(matches!(fs.close(1000), Err(SFSError::InvalidDescriptor(1000))));
}

#[test]
fn bad_names_are_rejected() {
    let mut fs = fresh_fs();
    assert!(matches!(
        fs.open("seventeen_chars__"),
        Err(SFSError::NameTooLong(_))
    ));
    assert!(matches!(fs.open(""), Err(SFSError::InvalidName)));
    assert!(matches!(fs.next_filename(), Err(SFSError::EndOfDirectory)));
}

#[test]
fn full_tables_reject_open_without_side_effects() {
    init();
    let config = Config {
        inode_count: 2,
        max_open_files: 3,
    };
    let mut fs = SFS::mount_with_config(create_test_device(64), true, config).unwrap();

    fs.open("a").unwrap();
    fs.open("b").unwrap();
    assert!(matches!(fs.open("c"), Err(SFSError::TableFull(_))));
    assert!(matches!(fs.file_size("c"), Err(SFSError::NotFound)));

    // Existing files can still be opened until descriptors run out.
    fs.open("a").unwrap();
    assert!(matches!(fs.open("b"), Err(SFSError::TableFull(_))));

    fs.remove("b").unwrap();
    assert!(matches!(fs.open("c"), Err(SFSError::TableFull(_))));
    assert!(matches!(fs.file_size("c"), Err(SFSError::NotFound)));
}

#[test]
fn volume_survives_remount() {
    init();
    let disk = NamedTempFile::new().unwrap();
    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(DISK_BLOCKS)
        .build()
        .unwrap();
    let mut fs = SFS::mount(dev, true).unwrap();

    let data = pattern(30 * BLOCK_SIZE + 3);
    let fd = fs.open("keep").unwrap();
    fs.write(fd, &data).unwrap();
    fs.open("empty").unwrap();
    fs.open("doomed").unwrap();
    fs.remove("doomed").unwrap();
    let old_inode = fs.stat("keep").unwrap().inode;
    let free = fs.free_blocks();
    fs.unmount().unwrap();

    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(DISK_BLOCKS)
        // Don't reset initialized disk.
        .clear_medium(false)
        .build()
        .unwrap();
    let mut fs = SFS::mount(dev, false).unwrap();

    assert_eq!(fs.free_blocks(), free);
    assert_eq!(fs.file_size("empty").unwrap(), 0);
    assert!(matches!(fs.file_size("doomed"), Err(SFSError::NotFound)));
    assert_eq!(fs.stat("keep").unwrap().inode, old_inode);

    let fd = fs.open("keep").unwrap();
    assert_eq!(fs.read(fd, data.len()).unwrap(), data);

    // The listing starts over after the mount.
    assert_eq!(fs.next_filename().unwrap(), "keep");
    assert_eq!(fs.next_filename().unwrap(), "empty");

    // Identities stay fresh across mounts.
    fs.open("new").unwrap();
    assert!(fs.stat("new").unwrap().inode > old_inode + 2);
}

#[test]
fn remount_through_open_disk() {
    init();
    let disk = NamedTempFile::new().unwrap();
    let dev = FileBlockEmulatorBuilder::from(disk.reopen().unwrap())
        .with_block_count(128)
        .build()
        .unwrap();
    let mut fs = SFS::mount(dev, true).unwrap();
    let fd = fs.open("a").unwrap();
    fs.write(fd, b"persisted").unwrap();
    drop(fs);

    let dev = FileBlockEmulator::open_disk(disk.path(), 128).unwrap();
    let mut fs = SFS::mount(dev, false).unwrap();
    let fd = fs.open("a").unwrap();
    assert_eq!(fs.read(fd, 100).unwrap(), b"persisted");
}

#[test]
fn unformatted_device_is_corrupt() {
    init();
    let result = SFS::mount(create_test_device(64), false);
    assert!(matches!(result, Err(SFSError::CorruptVolume)));
}

#[test]
fn device_too_small_is_rejected() {
    init();
    let result = SFS::mount(create_test_device(8), true);
    assert!(matches!(result, Err(SFSError::InvalidArgument(_))));

    let config = Config {
        max_open_files: 0,
        ..Config::default()
    };
    let result = SFS::mount_with_config(create_test_device(DISK_BLOCKS), true, config);
    assert!(matches!(result, Err(SFSError::InvalidArgument(_))));
}
