//! Error categories for the file system layer.
//!
//! The taxonomy follows how the original design treats failure: validation
//! problems are reported to the caller, resource exhaustion is either
//! reported (blocks) or fatal (inodes), integrity violations are reported,
//! and structural inconsistencies halt the process because they mean the
//! on-disk state can no longer be trusted.

use fs_types::BlockNo;

/// Errors a file system operation can report to its caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A caller-supplied argument was out of range (bad offset, name too
    /// long for the operation, and similar).
    #[error("invalid argument")]
    InvalidArgument,

    /// `balloc` found no free block to hand out.
    #[error("file system out of free blocks")]
    NoFreeBlocks,

    /// A directory entry with this name already exists.
    #[error("name already exists in directory")]
    NameExists,

    /// A block's Adler-32 checksum did not match what its inode recorded.
    #[error("checksum mismatch, block {0}")]
    ChecksumMismatch(BlockNo),

    /// The underlying block device reported an I/O failure.
    #[error("device I/O error: {0}")]
    Device(#[from] std::io::Error),
}
