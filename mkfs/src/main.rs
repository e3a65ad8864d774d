//! Builds a fresh file system image and populates it with files.

use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use fs::{FileSystem, device::FileBlockDevice};
use fs_types::{InodeNo, T_FILE};

/// Default image size, in blocks, when `--blocks` is not given.
const DEFAULT_BLOCKS: u32 = 2000;

/// Default number of inodes, when `--inodes` is not given.
const DEFAULT_INODES: u32 = 200;

#[derive(Parser)]
#[command(about = "Format a file system image and copy files into its root directory")]
struct Args {
    /// Path to the image file to create.
    image: PathBuf,

    /// Files to copy into the root directory, using their base name.
    files: Vec<PathBuf>,

    /// Image size, in blocks.
    #[arg(long, default_value_t = DEFAULT_BLOCKS)]
    blocks: u32,

    /// Number of inodes to reserve.
    #[arg(long, default_value_t = DEFAULT_INODES)]
    inodes: u32,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(err) = run(&args) {
        eprintln!("mkfs: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(args: &Args) -> io::Result<()> {
    let image = File::options()
        .read(true)
        .write(true)
        .truncate(true)
        .create(true)
        .open(&args.image)?;
    image.set_len(u64::from(args.blocks) * u64::try_from(fs::BLOCK_SIZE).unwrap())?;

    let device = FileBlockDevice::new(image);
    let fs = FileSystem::format(device, args.blocks, args.inodes)
        .map_err(|err| io::Error::other(err.to_string()))?;

    let root = fs.iget(InodeNo::ROOT);
    for path in &args.files {
        let mut content = Vec::new();
        File::open(path)?.read_to_end(&mut content)?;

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| io::Error::other(format!("not a valid file name: {}", path.display())))?;

        let file = fs
            .ialloc(T_FILE)
            .map_err(|err| io::Error::other(err.to_string()))?;
        {
            let mut locked = file.ilock().map_err(|err| io::Error::other(err.to_string()))?;
            locked.set_nlink(1);
            locked
                .write(&content, 0)
                .map_err(|err| io::Error::other(err.to_string()))?;
        }

        let mut root_locked = root.ilock().map_err(|err| io::Error::other(err.to_string()))?;
        root_locked
            .link(name.as_bytes(), file.inum())
            .map_err(|err| io::Error::other(err.to_string()))?;
        println!("mkfs: added {name} as inode {}", file.inum());
    }

    Ok(())
}
