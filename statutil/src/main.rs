//! Prints an inode's metadata, including its whole-file checksum digest.

use std::{fs::File, path::PathBuf, process::ExitCode};

use fs::{FileSystem, device::FileBlockDevice};
use fs_types::InodeNo;

fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args_os().skip(1);
    let (Some(image), Some(path)) = (args.next(), args.next()) else {
        eprintln!("Usage: statutil fs.img path");
        return ExitCode::FAILURE;
    };

    match run(PathBuf::from(image), path.to_string_lossy().as_bytes()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("statutil: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(image: PathBuf, path: &[u8]) -> Result<(), fs::Error> {
    let file = File::options()
        .read(true)
        .write(true)
        .open(&image)
        .map_err(fs::Error::Device)?;
    let device = FileBlockDevice::new(file);
    let fs = FileSystem::open(device)?;

    let root = fs.iget(InodeNo::ROOT);
    let ip = fs.namei(&root, path)?;
    let locked = ip.ilock()?;
    let stat = locked.stat()?;
    println!("{stat}");
    Ok(())
}
