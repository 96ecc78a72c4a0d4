use super::*;
use blk_dev::DiskDevice;
use common::*;
use fs::{FileSystem, SuperBlock};

/// One ASCII bitmap: a byte per inode or block.
pub struct BitMap {
    start: u64,
    len: i32,
    free: u8,
    used: u8,
    entity: &'static str,
}

impl BitMap {
    pub fn inodes(sb: &SuperBlock) -> Self {
        Self {
            start: sb.bm_inode_start as u64,
            len: sb.inode_capacity(),
            free: INODE_FREE,
            used: INODE_USED,
            entity: "inode bitmap",
        }
    }

    pub fn blocks(sb: &SuperBlock) -> Self {
        Self {
            start: sb.bm_block_start as u64,
            len: sb.block_capacity(),
            free: BLOCK_FREE,
            used: BLOCK_USED,
            entity: "block bitmap",
        }
    }

    fn pos(&self, idx: i32) -> Result<u64> {
        if idx < 0 || idx >= self.len {
            return Err(FsError::Malformed {
                entity: self.entity,
                offset: self.start,
                reason: format!("index {} out of range 0..{}", idx, self.len),
            });
        }
        Ok(self.start + idx as u64)
    }

    pub fn clear(&self, dev: &dyn DiskDevice) -> Result<()> {
        let buf = vec![self.free; self.len as usize];
        dev.write_at(self.start, &buf)
            .map_err(|e| FsError::io(self.entity, self.start, e))
    }

    pub fn load(&self, dev: &dyn DiskDevice) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.len as usize];
        dev.read_at(self.start, &mut buf)
            .map_err(|e| FsError::io(self.entity, self.start, e))?;
        Ok(buf)
    }

    pub fn is_used(&self, dev: &dyn DiskDevice, idx: i32) -> Result<bool> {
        let at = self.pos(idx)?;
        let mut b = [0u8; 1];
        dev.read_at(at, &mut b)
            .map_err(|e| FsError::io(self.entity, at, e))?;
        Ok(b[0] == self.used)
    }

    /// Flip one entry, returning whether it changed.
    pub fn set(&self, dev: &dyn DiskDevice, idx: i32, used: bool) -> Result<bool> {
        if self.is_used(dev, idx)? == used {
            return Ok(false);
        }
        let at = self.pos(idx)?;
        let b = if used { self.used } else { self.free };
        dev.write_at(at, &[b])
            .map_err(|e| FsError::io(self.entity, at, e))?;
        Ok(true)
    }
}

impl FileSystem {
    pub(crate) fn create_bitmaps(&self) -> Result<()> {
        BitMap::inodes(&self.sb).clear(self.dev())?;
        BitMap::blocks(&self.sb).clear(self.dev())
    }

    pub fn inode_bitmap(&self) -> Result<Vec<u8>> {
        BitMap::inodes(&self.sb).load(self.dev())
    }

    pub fn block_bitmap(&self) -> Result<Vec<u8>> {
        BitMap::blocks(&self.sb).load(self.dev())
    }

    /// Hand out the next inode index. Indices only grow: a freed index is never re-issued.
    pub(crate) fn alloc_inode(&mut self) -> Result<i32> {
        let ino = self.sb.next_inode()?;
        if ino >= self.sb.inode_capacity() {
            return Err(FsError::NoFreeSpace("no inodes left".to_string()));
        }
        BitMap::inodes(&self.sb).set(self.dev(), ino, true)?;
        self.sb.first_ino += self.sb.inode_size;
        self.sb.inodes_count += 1;
        self.sb.free_inodes_count -= 1;
        self.flush_sb()?;
        log::debug!("alloc inode {}", ino);
        Ok(ino)
    }

    pub(crate) fn alloc_block(&mut self) -> Result<i32> {
        let bno = self.sb.next_block()?;
        if bno >= self.sb.block_capacity() {
            return Err(FsError::NoFreeSpace("no blocks left".to_string()));
        }
        BitMap::blocks(&self.sb).set(self.dev(), bno, true)?;
        self.sb.first_blo += self.sb.block_size;
        self.sb.blocks_count += 1;
        self.sb.free_blocks_count -= 1;
        self.flush_sb()?;
        log::debug!("alloc block {}", bno);
        Ok(bno)
    }

    pub(crate) fn free_inode(&mut self, ino: i32) -> Result<()> {
        if BitMap::inodes(&self.sb).set(self.dev(), ino, false)? {
            self.sb.inodes_count -= 1;
            self.sb.free_inodes_count += 1;
            self.flush_sb()?;
            log::debug!("free inode {}", ino);
        }
        Ok(())
    }

    pub(crate) fn free_block(&mut self, bno: i32) -> Result<()> {
        if BitMap::blocks(&self.sb).set(self.dev(), bno, false)? {
            self.sb.blocks_count -= 1;
            self.sb.free_blocks_count += 1;
            self.flush_sb()?;
            log::debug!("free block {}", bno);
        }
        Ok(())
    }
}
