use super::*;
use blk_dev::DiskDevice;
use codec::DiskRecord;
use common::*;
use disk::{FileKind, FolderBlock, Inode};
use perm::Perm;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsType {
    Ext2 = 2,
    Ext3 = 3,
}

impl FsType {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            2 => Ok(FsType::Ext2),
            3 => Ok(FsType::Ext3),
            other => Err(FsError::UnsupportedFilesystemType(format!("type {}", other))),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "2fs" | "ext2" => Ok(FsType::Ext2),
            "3fs" | "ext3" => Ok(FsType::Ext3),
            other => Err(FsError::UnsupportedFilesystemType(other.to_string())),
        }
    }

    /// bytes consumed per inode: bitmap bits (1 + 3), the inode, three blocks, and a journal slot on ext3
    fn bytes_per_inode(self) -> u64 {
        let base = 4 + INODE_SZ + 3 * BLOCK_SZ;
        match self {
            FsType::Ext2 => base as u64,
            FsType::Ext3 => (base + JOURNAL_SZ) as u64,
        }
    }
}

#[repr(C)]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SuperBlock {
    /// 2 = ext2, 3 = ext3
    pub filesystem_type: i32,
    /// inodes in use
    pub inodes_count: i32,
    /// blocks in use
    pub blocks_count: i32,
    pub free_inodes_count: i32,
    pub free_blocks_count: i32,
    /// last mount time
    pub mtime: f32,
    /// last unmount time
    pub umtime: f32,
    pub mnt_count: i32,
    /// Must be FSMAGIC
    pub magic: i32,
    pub inode_size: i32,
    pub block_size: i32,
    /// byte offset of the next inode to hand out
    pub first_ino: i32,
    /// byte offset of the next block to hand out
    pub first_blo: i32,
    pub bm_inode_start: i32,
    pub bm_block_start: i32,
    pub inode_start: i32,
    pub block_start: i32,
}

impl DiskRecord for SuperBlock {
    const SIZE: usize = SUPER_BLOCK_SZ;
    const ENTITY: &'static str = "super block";
}

fn wire(pos: u64, what: &str) -> Result<i32> {
    i32::try_from(pos).map_err(|_| {
        FsError::InvalidArgument(format!("{} at {} does not fit a 32-bit offset", what, pos))
    })
}

fn next_index(entity: &'static str, next: i32, start: i32, stride: i32) -> Result<i32> {
    let delta = next - start;
    if stride <= 0 || delta < 0 || delta % stride != 0 {
        return Err(FsError::Malformed {
            entity,
            offset: next.max(0) as u64,
            reason: format!("next offset {} is not in the table at {}", next, start),
        });
    }
    Ok(delta / stride)
}

impl SuperBlock {
    /// Fresh superblock for a partition of `part_size` bytes at `part_start`.
    pub fn layout(part_start: u64, part_size: u64, fs_type: FsType) -> Result<Self> {
        let usable = part_size.saturating_sub(SUPER_BLOCK_SZ as u64);
        let n = usable / fs_type.bytes_per_inode();
        if n < 2 {
            return Err(FsError::NoFreeSpace(format!(
                "partition of {} bytes cannot hold a filesystem",
                part_size
            )));
        }
        let journal = match fs_type {
            FsType::Ext2 => 0,
            FsType::Ext3 => n * JOURNAL_SZ as u64,
        };
        let bm_inode_start = part_start + SUPER_BLOCK_SZ as u64 + journal;
        let bm_block_start = bm_inode_start + n;
        let inode_start = bm_block_start + 3 * n;
        let block_start = inode_start + n * INODE_SZ as u64;
        wire(block_start + 3 * n * BLOCK_SZ as u64, "block table end")?;

        let t = now();
        let n = wire(n, "inode count")?;
        Ok(Self {
            filesystem_type: fs_type as i32,
            inodes_count: 0,
            blocks_count: 0,
            free_inodes_count: n,
            free_blocks_count: BLOCKS_PER_INODE * n,
            mtime: t,
            umtime: t,
            mnt_count: 1,
            magic: FSMAGIC,
            inode_size: INODE_SZ as i32,
            block_size: BLOCK_SZ as i32,
            first_ino: wire(inode_start, "inode table")?,
            first_blo: wire(block_start, "block table")?,
            bm_inode_start: wire(bm_inode_start, "inode bitmap")?,
            bm_block_start: wire(bm_block_start, "block bitmap")?,
            inode_start: wire(inode_start, "inode table")?,
            block_start: wire(block_start, "block table")?,
        })
    }

    pub fn fs_type(&self) -> Result<FsType> {
        FsType::from_raw(self.filesystem_type)
    }

    /// N, derived from the region between the two bitmaps
    pub fn inode_capacity(&self) -> i32 {
        self.bm_block_start - self.bm_inode_start
    }

    pub fn block_capacity(&self) -> i32 {
        self.inode_start - self.bm_block_start
    }

    /// Index behind `first_ino`, which is stored as an absolute offset.
    pub fn next_inode(&self) -> Result<i32> {
        next_index("inode", self.first_ino, self.inode_start, self.inode_size)
    }

    pub fn next_block(&self) -> Result<i32> {
        next_index("block", self.first_blo, self.block_start, self.block_size)
    }

    pub fn inode_pos(&self, ino: i32) -> Result<u64> {
        if ino < 0 || ino >= self.inode_capacity() {
            return Err(FsError::Malformed {
                entity: "inode",
                offset: 0,
                reason: format!("index {} out of range", ino),
            });
        }
        codec::offset("inode", self.inode_start as i64 + ino as i64 * INODE_SZ as i64)
    }

    pub fn block_pos(&self, bno: i32) -> Result<u64> {
        if bno < 0 || bno >= self.block_capacity() {
            return Err(FsError::Malformed {
                entity: "block",
                offset: 0,
                reason: format!("index {} out of range", bno),
            });
        }
        codec::offset("block", self.block_start as i64 + bno as i64 * BLOCK_SZ as i64)
    }
}

/// One formatted partition of a disk image.
pub struct FileSystem {
    dev: Arc<dyn DiskDevice>,
    part_start: u64,
    part_size: u64,
    pub(crate) sb: SuperBlock,
    /// set while the journal is being replayed so replayed mutations are not logged twice
    pub(crate) replaying: bool,
    /// permission given to new files and directories
    pub(crate) default_perm: Perm,
}

impl FileSystem {
    pub fn open(dev: Arc<dyn DiskDevice>, part_start: u64, part_size: u64) -> Result<Self> {
        let sb = SuperBlock::read_from(&*dev, part_start)?;
        if sb.magic != FSMAGIC {
            return Err(FsError::NotFormatted(part_start));
        }
        sb.fs_type()?;
        log::debug!(
            "open fs at {}: {} inodes, {} blocks in use",
            part_start,
            sb.inodes_count,
            sb.blocks_count
        );
        Ok(Self {
            dev,
            part_start,
            part_size,
            sb,
            replaying: false,
            default_perm: Perm::DEFAULT,
        })
    }

    /// mkfs: superblock, bitmaps, root directory and users.txt. Ext3 also gets an
    /// empty journal whose first two slots describe `/` and `/users.txt`.
    pub fn format(
        dev: Arc<dyn DiskDevice>,
        part_start: u64,
        part_size: u64,
        fs_type: FsType,
        users: &str,
    ) -> Result<Self> {
        let mut fs = Self::build(dev, part_start, part_size, fs_type, users, true)?;
        if fs_type == FsType::Ext3 {
            fs.write_slot(0, journal::JournalOp::Mkdir, "/", "")?;
            fs.write_slot(1, journal::JournalOp::Mkfile, &format!("/{}", USERS_FILE), users)?;
        }
        log::info!(
            "formatted {:?} at {}: {} inodes, {} blocks",
            fs_type,
            part_start,
            fs.sb.inode_capacity(),
            fs.sb.block_capacity()
        );
        Ok(fs)
    }

    /// Lay out a fresh tree; the journal region is cleared only when `clear_journal`.
    pub(crate) fn build(
        dev: Arc<dyn DiskDevice>,
        part_start: u64,
        part_size: u64,
        fs_type: FsType,
        users: &str,
        clear_journal: bool,
    ) -> Result<Self> {
        let sb = SuperBlock::layout(part_start, part_size, fs_type)?;
        let mut fs = Self {
            dev,
            part_start,
            part_size,
            sb,
            replaying: false,
            default_perm: Perm::DEFAULT,
        };
        fs.flush_sb()?;
        if clear_journal && fs_type == FsType::Ext3 {
            fs.zero(fs.journal_start(), fs.journal_len())?;
        }
        fs.create_bitmaps()?;
        fs.init_tree(users)?;
        Ok(fs)
    }

    /// Root directory at inode 0 / block 0, users.txt at inode 1 / block 1.
    fn init_tree(&mut self, users: &str) -> Result<()> {
        let root = self.alloc_inode()?;
        let page = self.alloc_block()?;
        let mut inode = Inode::new(FileKind::Directory, 1, 1, Perm::DIR_ROOT);
        inode.block[0] = page;
        self.write_block(page, &FolderBlock::first(root, root))?;
        self.write_inode(root, &inode)?;

        let ino = self.create_child(root, USERS_FILE, FileKind::File, 1, 1, Perm::DIR_ROOT)?;
        let mut file = self.read_inode(ino)?;
        self.write_content(ino, &mut file, users.as_bytes())?;
        debug_assert_eq!(root, ROOT_INO);
        debug_assert_eq!(ino, USERS_INO);
        Ok(())
    }

    pub fn with_default_perm(mut self, perm: Perm) -> Self {
        self.default_perm = perm;
        self
    }

    pub fn dev(&self) -> &dyn DiskDevice {
        &*self.dev
    }

    pub fn part_start(&self) -> u64 {
        self.part_start
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn fs_type(&self) -> Result<FsType> {
        self.sb.fs_type()
    }

    pub fn flush_sb(&self) -> Result<()> {
        self.sb.write_to(self.dev(), self.part_start)
    }

    pub fn read_inode(&self, ino: i32) -> Result<Inode> {
        Inode::read_from(self.dev(), self.sb.inode_pos(ino)?)
    }

    pub fn write_inode(&self, ino: i32, inode: &Inode) -> Result<()> {
        inode.write_to(self.dev(), self.sb.inode_pos(ino)?)
    }

    pub fn read_block<T: DiskRecord>(&self, bno: i32) -> Result<T> {
        T::read_from(self.dev(), self.sb.block_pos(bno)?)
    }

    pub fn write_block<T: DiskRecord>(&self, bno: i32, blk: &T) -> Result<()> {
        blk.write_to(self.dev(), self.sb.block_pos(bno)?)
    }

    /// Zero `len` bytes at absolute offset `from`.
    pub(crate) fn zero(&self, from: u64, len: u64) -> Result<()> {
        const CHUNK: u64 = 64 * 1024;
        let zeros = vec![0u8; CHUNK as usize];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(CHUNK);
            self.dev
                .write_at(from + done, &zeros[..n as usize])
                .map_err(|e| FsError::io("zero fill", from + done, e))?;
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScratchDisk;
    use blk_dev::DiskFile;

    const USERS: &str = "1,G,root\n1,U,root,root,123\n";

    fn image(size: u64) -> (ScratchDisk, Arc<dyn DiskDevice>) {
        let scratch = ScratchDisk::new();
        let dev = DiskFile::create(scratch.path(), size).unwrap();
        (scratch, Arc::new(dev))
    }

    #[test]
    fn layout_ext2() {
        let sb = SuperBlock::layout(1000, 68 + 284 * 10 + 100, FsType::Ext2).unwrap();
        assert_eq!(sb.inode_capacity(), 10);
        assert_eq!(sb.block_capacity(), 30);
        assert_eq!(sb.bm_inode_start, 1068);
        assert_eq!(sb.bm_block_start, 1078);
        assert_eq!(sb.inode_start, 1108);
        assert_eq!(sb.block_start, 1108 + 880);
        assert_eq!(sb.free_blocks_count, 30);
        assert_eq!(sb.to_bytes().unwrap().len(), 68);
    }

    #[test]
    fn layout_ext3_reserves_journal() {
        let sb = SuperBlock::layout(0, 68 + 398 * 4, FsType::Ext3).unwrap();
        assert_eq!(sb.inode_capacity(), 4);
        assert_eq!(sb.bm_inode_start, 68 + 4 * 114);
        assert!(SuperBlock::layout(0, 500, FsType::Ext3).is_err());
    }

    #[test]
    fn format_creates_root_and_users() {
        let (_scratch, dev) = image(64 * 1024);
        let fs = FileSystem::format(dev.clone(), 0, 64 * 1024, FsType::Ext2, USERS).unwrap();
        let sb = fs.super_block();
        assert_eq!(sb.inodes_count, 2);
        assert_eq!(sb.blocks_count, 2);
        assert_eq!(sb.free_inodes_count + sb.inodes_count, sb.inode_capacity());
        assert_eq!(sb.free_blocks_count + sb.blocks_count, sb.block_capacity());

        let root = fs.read_inode(ROOT_INO).unwrap();
        assert!(root.is_dir());
        assert_eq!(&root.perm, b"777");
        let users = fs.read_inode(USERS_INO).unwrap();
        assert_eq!(users.block[0], 1);
        assert_eq!(fs.read_content(&users).unwrap(), USERS.as_bytes());

        let again = FileSystem::open(dev, 0, 64 * 1024).unwrap();
        assert_eq!(again.super_block(), fs.super_block());
    }

    #[test]
    fn open_rejects_unformatted() {
        let (_scratch, dev) = image(4096);
        assert!(matches!(
            FileSystem::open(dev, 0, 4096),
            Err(FsError::NotFormatted(0))
        ));
    }
}
