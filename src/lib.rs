mod bitmap; // inode/block allocator
mod blk_dev; // disk image access
mod codec;
pub mod common;
pub mod config;
mod dir;
pub mod disk; // inode and block records
pub mod engine;
pub mod error;
pub mod fs; // superblock and per-partition handle
mod inode;
pub mod journal;
pub mod mount;
pub mod partition;
pub mod path;
pub mod perm;
pub mod tree;
pub mod users;
mod vfs;

#[cfg(test)]
mod testutil;

pub use blk_dev::{DiskDevice, DiskFile};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{FsError, Result};

/// size of every data, folder and pointer block
pub const BLOCK_SZ: usize = 64;
/// size of an inode record
pub const INODE_SZ: usize = 88;
/// size of the superblock record
pub const SUPER_BLOCK_SZ: usize = 68;
/// stride of one journal slot
pub const JOURNAL_SZ: usize = 114;
/// size of the MBR record, partition table included
pub const MBR_SZ: usize = 153;
/// size of one MBR partition slot
pub const PARTITION_SZ: usize = 35;
/// bytes reserved in front of every logical partition for its EBR
pub const EBR_SZ: usize = 32;
/// # of direct blocks in inode
pub const NDIRECT: usize = 12;
/// pointers per pointer block
pub const NPTRS: usize = BLOCK_SZ / core::mem::size_of::<i32>();
/// width of a directory entry name
pub const DIRSIZ: usize = 12;
pub const FSMAGIC: i32 = 0xEF53;
