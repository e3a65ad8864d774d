//! Concrete [`block_io::BlockDevice`] backings.
//!
//! The file system core is generic over the device; these two
//! implementations are the ones actually shipped: a file-backed device for
//! `mkfs`/`statutil` and anything pointed at a real disk image, and an
//! in-memory device for tests that would rather not touch the filesystem.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::Mutex,
};

use block_io::BlockDevice;

use crate::BLOCK_SIZE;

/// A block device backed by a regular file, addressed in `BLOCK_SIZE` units.
pub struct FileBlockDevice {
    file: Mutex<File>,
}

impl FileBlockDevice {
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }
}

impl BlockDevice<BLOCK_SIZE> for FileBlockDevice {
    type Error = io::Error;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))?;
        file.read_exact(data)
    }

    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        let mut file = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        file.seek(SeekFrom::Start((index * BLOCK_SIZE) as u64))?;
        file.write_all(data)
    }
}

/// A block device backed by an in-memory buffer, for tests.
pub struct MemBlockDevice {
    blocks: Mutex<Vec<[u8; BLOCK_SIZE]>>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: Mutex::new(vec![[0; BLOCK_SIZE]; num_blocks]),
        }
    }
}

impl BlockDevice<BLOCK_SIZE> for MemBlockDevice {
    type Error = io::Error;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        let blocks = self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let block = blocks
            .get(index)
            .ok_or_else(|| io::Error::other("block index out of range"))?;
        data.copy_from_slice(block);
        Ok(())
    }

    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let block = blocks
            .get_mut(index)
            .ok_or_else(|| io::Error::other("block index out of range"))?;
        block.copy_from_slice(data);
        Ok(())
    }
}
