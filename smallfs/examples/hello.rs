use smallfs::io::FileBlockEmulatorBuilder;
use smallfs::{SFSError, SFS};

pub fn main() -> Result<(), SFSError> {
    env_logger::init();

    let tmp = tempfile::tempfile()?;
    let dev = FileBlockEmulatorBuilder::from(tmp)
        .with_block_count(1024)
        .build()?;

    // Format a new volume on the device and round trip one file through it.
    let mut sfs = SFS::mount(dev, true)?;
    let fd = sfs.open("some_name.txt")?;
    sfs.write(fd, b"hello from a small file system")?;
    sfs.seek(fd, 0)?;
    let content = sfs.read(fd, 64)?;
    println!("read back {:?}", String::from_utf8_lossy(&content));

    while let Ok(name) = sfs.next_filename() {
        println!("{}: {} bytes", name, sfs.file_size(&name)?);
    }

    sfs.close(fd)?;
    sfs.remove("some_name.txt")?;
    println!("{} blocks free", sfs.free_blocks());
    Ok(())
}
