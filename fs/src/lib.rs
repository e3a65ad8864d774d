//! A checksummed on-disk file system for a small kernel.
//!
//! Four layers, bottom to top: a bitmap block allocator ([`balloc`]),
//! an inode cache with a busy/valid per-inode lock discipline
//! ([`inode`]), directory operations over inode content
//! ([`directory`]), and slash-separated path resolution ([`path`]).
//! Every data block reachable from an inode's direct, single-indirect, or
//! double-indirect address slots has an Adler-32 checksum recorded
//! alongside its pointer, verified on every read.
//!
//! There is no journal: a crash mid-write can leave an inode's metadata
//! and its data blocks out of sync, which the next read will notice as a
//! checksum mismatch rather than silently served garbage.

pub mod device;
mod directory;
mod error;
mod inode;
mod path;

use std::fmt;

use block_io::{BlockBuf, BlockCache};
use fs_types::{BlockNo, InodeNo, SuperBlock, T_DIR};
use sync::{SleepLock, SpinLock};

pub use error::Error;
pub use inode::{Inode, InodeRef};

/// Block size used throughout the file system, in bytes.
pub const BLOCK_SIZE: usize = fs_types::FS_BLOCK_SIZE;

/// Number of simultaneously cached inodes.
pub const NINODE: usize = 50;

/// Number of buffers kept by the block cache.
pub const NBUF: usize = 30;

/// The only device number this library ever hands out; the design does not
/// support multiple attached devices.
pub const ROOTDEV: u32 = 0;

type BufferLock = SleepLock<BlockBuf<BLOCK_SIZE>>;
type SlotListLock = SpinLock<block_io::SlotList<BufferLock>>;

/// Block cache bound to this file system's block size and lock types.
pub type Cache<D> = BlockCache<D, SlotListLock>;

/// A read/write callback pair for a device-file major number.
pub type DeviceRead = fn(&mut [u8]) -> Result<usize, Error>;
pub type DeviceWrite = fn(&[u8]) -> Result<usize, Error>;

#[derive(Clone, Copy, Default)]
struct DeviceOps {
    read: Option<DeviceRead>,
    write: Option<DeviceWrite>,
}

/// In-memory, user-facing file metadata, extended with the whole-file
/// checksum digest described in the design notes.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub dev: u32,
    pub ino: InodeNo,
    pub ty: i16,
    pub nlink: i16,
    pub size: u32,
    pub checksum: u32,
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type {} dev {} ino {} nlink {} size {} checksum {:#010x}",
            self.ty, self.dev, self.ino, self.nlink, self.size, self.checksum
        )
    }
}

/// The file system: a block device, its superblock, the shared block
/// cache, and the inode cache layered on top of it.
pub struct FileSystem<D> {
    pub(crate) cache: Cache<D>,
    pub(crate) sb: SuperBlock,
    pub(crate) balloc_lock: SpinLock<()>,
    pub(crate) itable: inode::InodeTable,
    devices: SpinLock<[DeviceOps; 16]>,
}

impl<D> FileSystem<D>
where
    D: block_io::BlockDevice<BLOCK_SIZE, Error = std::io::Error>,
{
    /// Formats `device` as a fresh file system of `total_blocks` blocks
    /// with room for `ninodes` inodes, and creates the root directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] on I/O failure.
    ///
    /// # Panics
    ///
    /// Panics if `total_blocks` is too small to hold the superblock, inode
    /// table, and bitmap the requested `ninodes` and `total_blocks` imply.
    pub fn format(device: D, total_blocks: u32, ninodes: u32) -> Result<Self, Error> {
        let inode_blocks =
            u32::try_from(usize::try_from(ninodes).unwrap().div_ceil(fs_types::INODE_PER_BLOCK))
                .unwrap();
        let bmap_blocks = u32::try_from(
            usize::try_from(total_blocks)
                .unwrap()
                .div_ceil(fs_types::BITS_PER_BLOCK),
        )
        .unwrap();
        let inodestart = 2_u32;
        let bmapstart = inodestart + inode_blocks;
        let data_start = bmapstart + bmap_blocks;
        assert!(
            data_start < total_blocks,
            "image too small for the requested inode count"
        );

        let sb = SuperBlock {
            magic: SuperBlock::FS_MAGIC,
            size: total_blocks,
            nblocks: total_blocks - data_start,
            ninodes,
            inodestart,
            bmapstart,
        };

        let cache = Cache::new(device);
        cache.init(NBUF);

        for bno in inodestart..bmapstart {
            let mut handle = cache.get(bno as usize);
            handle.lock().zeroed().write()?;
        }
        for bno in bmapstart..data_start {
            let mut handle = cache.get(bno as usize);
            handle.lock().zeroed().write()?;
        }
        {
            let mut handle = cache.get(SuperBlock::SUPER_BLOCK_NO.as_index());
            let mut block = handle.lock().zeroed();
            *block.data_mut::<SuperBlock>() = SuperBlock {
                magic: sb.magic,
                size: sb.size,
                nblocks: sb.nblocks,
                ninodes: sb.ninodes,
                inodestart: sb.inodestart,
                bmapstart: sb.bmapstart,
            };
            block.write()?;
        }

        let fs = Self {
            cache,
            sb,
            balloc_lock: SpinLock::new(()),
            itable: inode::InodeTable::new(),
            devices: SpinLock::new([DeviceOps::default(); 16]),
        };

        // Reserve boot block, superblock, inode table, and bitmap blocks so
        // `balloc` never hands them out as data blocks.
        for bno in 0..data_start {
            fs.mark_reserved(BlockNo::new(bno))?;
        }

        let root = fs.ialloc(T_DIR)?;
        {
            let mut locked = root.ilock()?;
            locked.link(b".", InodeNo::ROOT)?;
            locked.link(b"..", InodeNo::ROOT)?;
            locked.set_nlink(1);
            locked.update()?;
        }
        drop(root);

        Ok(fs)
    }

    fn mark_reserved(&self, bno: BlockNo) -> Result<(), Error> {
        let bi = bno.as_index();
        let bmap_bno = self.sb.bmap_block(bi);
        let mut handle = self.cache.get(bmap_bno.as_index());
        let mut block = handle.lock().read().map_err(|(_, e)| e)?;
        let bit = bi % fs_types::BITS_PER_BLOCK;
        let bitmap: &mut fs_types::BmapBlock = block.data_mut();
        bitmap.set_bit(bit);
        block.write()?;
        Ok(())
    }

    /// Opens an already-formatted file system image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] on I/O failure, and panics if the
    /// superblock magic does not match — a corrupt superblock is a
    /// structural inconsistency, not a recoverable error.
    pub fn open(device: D) -> Result<Self, Error> {
        let cache = Cache::new(device);
        cache.init(NBUF);
        let sb = read_super_block(&cache)?;
        assert_eq!(
            sb.magic,
            SuperBlock::FS_MAGIC,
            "bad file system magic number"
        );
        Ok(Self {
            cache,
            sb,
            balloc_lock: SpinLock::new(()),
            itable: inode::InodeTable::new(),
            devices: SpinLock::new([DeviceOps::default(); 16]),
        })
    }

    /// Registers the read/write callbacks for a device-file major number.
    pub fn register_device(&self, major: i16, read: DeviceRead, write: DeviceWrite) {
        let idx = usize::try_from(major).expect("negative major number");
        let mut devices = self.devices.lock();
        devices[idx] = DeviceOps {
            read: Some(read),
            write: Some(write),
        };
    }

    #[must_use]
    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    /// Allocates a free data block, zeroing it before handing it back.
    ///
    /// Returns `Ok(None)` rather than failing when the bitmap has no clear
    /// bit, matching the design's "0 means out of blocks" convention
    /// translated into an `Option`.
    pub(crate) fn balloc(&self) -> Result<Option<BlockNo>, Error> {
        let _guard = self.balloc_lock.lock();
        let total = usize::try_from(self.sb.size).unwrap();
        let mut b = 0;
        while b < total {
            let bound = usize::min(fs_types::BITS_PER_BLOCK, total - b);
            let bmap_bno = self.sb.bmap_block(b);
            let mut handle = self.cache.get(bmap_bno.as_index());
            let mut block = handle.lock().read().map_err(|(_, e)| e)?;
            let bitmap: &fs_types::BmapBlock = block.data();
            let mut found = None;
            for bi in 0..bound {
                if !bitmap.bit(bi) {
                    found = Some(bi);
                    break;
                }
            }
            if let Some(bi) = found {
                let bitmap_mut: &mut fs_types::BmapBlock = block.data_mut();
                bitmap_mut.set_bit(bi);
                block.write()?;
                let bno = BlockNo::new(u32::try_from(b + bi).unwrap());
                self.bzero(bno)?;
                return Ok(Some(bno));
            }
            b += bound;
        }
        Ok(None)
    }

    /// Zeros the block's contents, freeing its bitmap bit, and refuses to
    /// leave stale data behind for whoever allocates the block next.
    ///
    /// # Panics
    ///
    /// Panics if the block's bitmap bit was already clear: freeing a free
    /// block means the allocator's bookkeeping has already diverged from
    /// reality, which this design treats as unrecoverable.
    pub(crate) fn bfree(&self, bno: BlockNo) -> Result<(), Error> {
        self.bzero(bno)?;
        let _guard = self.balloc_lock.lock();
        let bi = bno.as_index();
        let bmap_bno = self.sb.bmap_block(bi);
        let mut handle = self.cache.get(bmap_bno.as_index());
        let mut block = handle.lock().read().map_err(|(_, e)| e)?;
        let bit = bi % fs_types::BITS_PER_BLOCK;
        let bitmap: &fs_types::BmapBlock = block.data();
        assert!(bitmap.bit(bit), "double free of block {bno}");
        let bitmap_mut: &mut fs_types::BmapBlock = block.data_mut();
        bitmap_mut.clear_bit(bit);
        block.write()?;
        Ok(())
    }

    /// Overwrites a block with zeros.
    pub(crate) fn bzero(&self, bno: BlockNo) -> Result<(), Error> {
        let mut handle = self.cache.get(bno.as_index());
        let mut block = handle.lock().zeroed();
        block.write()?;
        Ok(())
    }

}

fn read_super_block<D>(cache: &Cache<D>) -> Result<SuperBlock, Error>
where
    D: block_io::BlockDevice<BLOCK_SIZE, Error = std::io::Error>,
{
    let mut handle = cache.get(SuperBlock::SUPER_BLOCK_NO.as_index());
    let block = handle.lock().read().map_err(|(_, e)| e)?;
    let sb: &SuperBlock = block.data();
    Ok(SuperBlock {
        magic: sb.magic,
        size: sb.size,
        nblocks: sb.nblocks,
        ninodes: sb.ninodes,
        inodestart: sb.inodestart,
        bmapstart: sb.bmapstart,
    })
}

/// Shared setup used by this crate's own tests: a freshly formatted,
/// in-memory image small enough to run fast but large enough to exercise
/// the single- and double-indirect tiers.
#[cfg(test)]
pub(crate) mod test_support {
    use device::MemBlockDevice;

    use super::FileSystem;

    pub(crate) const TEST_BLOCKS: u32 = 4096;
    pub(crate) const TEST_INODES: u32 = 64;

    pub(crate) fn small_fs() -> FileSystem<MemBlockDevice> {
        let device = MemBlockDevice::new(TEST_BLOCKS as usize);
        FileSystem::format(device, TEST_BLOCKS, TEST_INODES).expect("format")
    }
}

#[cfg(test)]
mod tests {
    use fs_types::{InodeNo, T_FILE};

    use super::test_support::small_fs;

    #[test]
    fn format_creates_readable_root() {
        let fs = small_fs();
        let root = fs.iget(InodeNo::ROOT);
        let locked = root.ilock().unwrap();
        assert!(locked.is_dir());
        assert_eq!(locked.nlink(), 1);
    }

    #[test]
    fn balloc_bfree_round_trip() {
        let fs = small_fs();
        let bno = fs.balloc().unwrap().expect("a free block");
        fs.bfree(bno).unwrap();
        let again = fs.balloc().unwrap().expect("the same block, freed");
        assert_eq!(bno, again);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let fs = small_fs();
        let bno = fs.balloc().unwrap().unwrap();
        fs.bfree(bno).unwrap();
        fs.bfree(bno).unwrap();
    }

    #[test]
    fn ialloc_returns_distinct_inodes() {
        let fs = small_fs();
        let a = fs.ialloc(T_FILE).unwrap();
        let b = fs.ialloc(T_FILE).unwrap();
        assert_ne!(a.inum(), b.inum());
        drop(a.ilock().unwrap());
    }
}
