//! Directory contents as a flat array of fixed-size dirents.

use dataview::PodMethods as _;
use fs_types::{DirEntry, InodeNo, namecmp};

use crate::{BLOCK_SIZE, Error, Inode};

const DIRENT_SIZE: usize = size_of::<DirEntry>();

impl<D> Inode<'_, '_, D>
where
    D: block_io::BlockDevice<BLOCK_SIZE, Error = std::io::Error>,
{
    /// Searches this directory for `name`, returning the inode it names.
    ///
    /// # Panics
    ///
    /// Panics if this inode is not a directory, or if a directory entry
    /// reads short — a directory whose size is not a multiple of the dirent
    /// size is a structural inconsistency.
    pub fn lookup(&mut self, name: &[u8]) -> Result<Option<InodeNo>, Error> {
        assert!(self.is_dir(), "lookup on a non-directory inode");

        let size = self.size();
        let mut off = 0;
        let mut buf = [0_u8; DIRENT_SIZE];
        while off < size {
            let n = self.read(&mut buf, off)?;
            assert_eq!(n, DIRENT_SIZE, "short directory entry read at offset {off}");
            let entry: &DirEntry = buf.as_data_view().get(0);
            if let Some(ino) = entry.ino() {
                if entry.is_same_name(name) {
                    return Ok(Some(ino));
                }
            }
            off += u32::try_from(DIRENT_SIZE).unwrap();
        }
        Ok(None)
    }

    /// Adds a `name -> ino` entry to this directory, reusing a free slot if
    /// one exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NameExists`] if `name` is already present, or
    /// [`Error::NoFreeBlocks`] if appending a new dirent ran the underlying
    /// inode out of free blocks to allocate.
    ///
    /// # Panics
    ///
    /// Panics if this inode is not a directory, or on a short directory
    /// read — a directory whose size is not a multiple of the dirent size is
    /// a structural inconsistency.
    pub fn link(&mut self, name: &[u8], ino: InodeNo) -> Result<(), Error> {
        assert!(self.is_dir(), "link on a non-directory inode");

        if self.lookup(name)?.is_some() {
            return Err(Error::NameExists);
        }

        let size = self.size();
        let mut off = 0;
        let mut buf = [0_u8; DIRENT_SIZE];
        let mut free_off = None;
        while off < size {
            let n = self.read(&mut buf, off)?;
            assert_eq!(n, DIRENT_SIZE, "short directory entry read at offset {off}");
            let entry: &DirEntry = buf.as_data_view().get(0);
            if entry.ino().is_none() {
                free_off = Some(off);
                break;
            }
            off += u32::try_from(DIRENT_SIZE).unwrap();
        }
        let off = free_off.unwrap_or(size);

        let mut buf = [0_u8; DIRENT_SIZE];
        let entry: &mut DirEntry = buf.as_data_view_mut().get_mut(0);
        entry.set_ino(Some(ino));
        entry.set_name(name);

        let n = self.write(&buf, off)?;
        if n != DIRENT_SIZE {
            // A short write here means `bmap`'s allocating path ran out of
            // free blocks while growing the directory, not corruption.
            return Err(Error::NoFreeBlocks);
        }
        Ok(())
    }

    /// Returns `true` if this directory contains only `.` and `..`.
    ///
    /// # Panics
    ///
    /// Panics if this inode is not a directory.
    pub fn is_empty_dir(&mut self) -> Result<bool, Error> {
        assert!(self.is_dir(), "is_empty_dir on a non-directory inode");

        let size = self.size();
        let mut off = u32::try_from(2 * DIRENT_SIZE).unwrap();
        let mut buf = [0_u8; DIRENT_SIZE];
        while off < size {
            let n = self.read(&mut buf, off)?;
            assert_eq!(n, DIRENT_SIZE, "short directory entry read at offset {off}");
            let entry: &DirEntry = buf.as_data_view().get(0);
            if entry.ino().is_some() {
                return Ok(false);
            }
            off += u32::try_from(DIRENT_SIZE).unwrap();
        }
        Ok(true)
    }

    /// Clears the directory entry for `name`, if present.
    ///
    /// # Panics
    ///
    /// Panics if this inode is not a directory, or on a short directory
    /// read/write.
    pub fn unlink_entry(&mut self, name: &[u8]) -> Result<bool, Error> {
        assert!(self.is_dir(), "unlink_entry on a non-directory inode");

        let size = self.size();
        let mut off = 0;
        let mut buf = [0_u8; DIRENT_SIZE];
        while off < size {
            let n = self.read(&mut buf, off)?;
            assert_eq!(n, DIRENT_SIZE, "short directory entry read at offset {off}");
            let entry: &DirEntry = buf.as_data_view().get(0);
            if entry.ino().is_some() && namecmp(entry.name(), name) {
                let cleared = [0_u8; DIRENT_SIZE];
                let n = self.write(&cleared, off)?;
                assert_eq!(n, DIRENT_SIZE, "short directory entry write at offset {off}");
                return Ok(true);
            }
            off += u32::try_from(DIRENT_SIZE).unwrap();
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use fs_types::T_DIR;

    use crate::{Error, device::MemBlockDevice, test_support::small_fs, FileSystem};

    #[test]
    fn link_then_lookup_round_trips() {
        let fs = small_fs();
        let dir = fs.ialloc(T_DIR).unwrap();
        let mut dp = dir.ilock().unwrap();
        dp.set_nlink(1);
        dp.link(b".", dir.inum()).unwrap();
        dp.link(b"..", dir.inum()).unwrap();

        let child = fs.ialloc(T_DIR).unwrap();
        dp.link(b"bb", child.inum()).unwrap();

        assert_eq!(dp.lookup(b"bb").unwrap(), Some(child.inum()));
        assert_eq!(dp.lookup(b"bbb").unwrap(), None);
    }

    #[test]
    fn link_rejects_duplicate_names() {
        let fs = small_fs();
        let dir = fs.ialloc(T_DIR).unwrap();
        let mut dp = dir.ilock().unwrap();
        dp.set_nlink(1);
        let child = fs.ialloc(T_DIR).unwrap();
        dp.link(b"a", child.inum()).unwrap();
        let err = dp.link(b"a", child.inum()).unwrap_err();
        assert!(matches!(err, Error::NameExists));
    }

    #[test]
    fn link_reuses_a_vacated_slot() {
        let fs = small_fs();
        let dir = fs.ialloc(T_DIR).unwrap();
        let mut dp = dir.ilock().unwrap();
        dp.set_nlink(1);
        let a = fs.ialloc(T_DIR).unwrap();
        let b = fs.ialloc(T_DIR).unwrap();
        dp.link(b"a", a.inum()).unwrap();
        let size_before = dp.size();
        assert!(dp.unlink_entry(b"a").unwrap());
        dp.link(b"b", b.inum()).unwrap();
        assert_eq!(dp.size(), size_before, "reused the vacated dirent slot");
    }

    #[test]
    fn is_empty_dir_ignores_dot_entries() {
        let fs = small_fs();
        let dir = fs.ialloc(T_DIR).unwrap();
        let mut dp = dir.ilock().unwrap();
        dp.set_nlink(1);
        dp.link(b".", dir.inum()).unwrap();
        dp.link(b"..", dir.inum()).unwrap();
        assert!(dp.is_empty_dir().unwrap());

        let child = fs.ialloc(T_DIR).unwrap();
        dp.link(b"x", child.inum()).unwrap();
        assert!(!dp.is_empty_dir().unwrap());
    }

    #[test]
    fn link_reports_no_free_blocks_once_the_device_is_full() {
        let device = MemBlockDevice::new(8);
        let fs = FileSystem::format(device, 8, 16).unwrap();
        let dir = fs.ialloc(T_DIR).unwrap();
        let mut dp = dir.ilock().unwrap();
        dp.set_nlink(1);
        dp.link(b".", dir.inum()).unwrap();
        dp.link(b"..", dir.inum()).unwrap();

        let mut exhausted = false;
        for i in 0..4096_u32 {
            let name = i.to_string();
            match dp.link(name.as_bytes(), dir.inum()) {
                Ok(()) => {}
                Err(Error::NoFreeBlocks) => {
                    exhausted = true;
                    break;
                }
                Err(err) => panic!("unexpected error growing the directory: {err}"),
            }
        }
        assert!(exhausted, "expected the tiny device to run out of free blocks");
    }
}
