//! Logical to physical block mapping.
//!
//! block[0..12] are direct, block[12] points at a single indirect page,
//! block[13] at a double and block[14] at a triple indirect tree. Each
//! pointer page holds NPTRS entries, `-1` for an empty slot.

use super::*;
use common::*;
use disk::{FileBlock, Inode, PointerBlock};
use fs::FileSystem;

/// logical blocks addressable through each indirect slot
const SPANS: [usize; 3] = [NPTRS, NPTRS * NPTRS, NPTRS * NPTRS * NPTRS];

/// largest logical block count an inode can address
pub const MAX_BLOCKS: usize = NDIRECT + SPANS[0] + SPANS[1] + SPANS[2];

/// (inode slot, indirection depth, index inside that slot's tree)
fn locate(lbn: usize) -> Result<(usize, u32, usize)> {
    if lbn < NDIRECT {
        return Ok((lbn, 0, 0));
    }
    let mut rest = lbn - NDIRECT;
    for (level, span) in SPANS.iter().enumerate() {
        if rest < *span {
            return Ok((NDIRECT + level, level as u32 + 1, rest));
        }
        rest -= span;
    }
    Err(FsError::IndirectionUnsupported(format!(
        "logical block {} is past the triple indirect range",
        lbn
    )))
}

impl FileSystem {
    /// Physical block backing `lbn`, if mapped.
    pub(crate) fn lookup_block(&self, inode: &Inode, lbn: usize) -> Result<Option<i32>> {
        let (slot, depth, mut idx) = locate(lbn)?;
        let mut bno = match ptr(inode.block[slot]) {
            Some(b) => b,
            None => return Ok(None),
        };
        for level in (0..depth).rev() {
            let span = NPTRS.pow(level);
            let page: PointerBlock = self.read_block(bno)?;
            bno = match ptr(page.pointers[idx / span]) {
                Some(b) => b,
                None => return Ok(None),
            };
            idx %= span;
        }
        Ok(Some(bno))
    }

    /// Like `lookup_block` but allocates missing pointer pages and the data
    /// block itself. The caller persists `inode` and fills the data block.
    pub(crate) fn map_block(&mut self, inode: &mut Inode, lbn: usize) -> Result<i32> {
        let (slot, depth, mut idx) = locate(lbn)?;
        let mut bno = match ptr(inode.block[slot]) {
            Some(b) => b,
            None => {
                let b = self.alloc_block()?;
                if depth > 0 {
                    self.write_block(b, &PointerBlock::empty())?;
                }
                inode.block[slot] = b;
                b
            }
        };
        for level in (0..depth).rev() {
            let span = NPTRS.pow(level);
            let mut page: PointerBlock = self.read_block(bno)?;
            let i = idx / span;
            bno = match ptr(page.pointers[i]) {
                Some(b) => b,
                None => {
                    let b = self.alloc_block()?;
                    if level > 0 {
                        self.write_block(b, &PointerBlock::empty())?;
                    }
                    page.pointers[i] = b;
                    self.write_block(bno, &page)?;
                    b
                }
            };
            idx %= span;
        }
        Ok(bno)
    }

    /// Every mapped data block in logical order, stopping at the first hole.
    pub(crate) fn data_blocks(&self, inode: &Inode) -> Result<Vec<i32>> {
        let mut out = Vec::new();
        for lbn in 0..MAX_BLOCKS {
            match self.lookup_block(inode, lbn)? {
                Some(b) => out.push(b),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn read_content(&self, inode: &Inode) -> Result<Vec<u8>> {
        let size = inode.size.max(0) as usize;
        let mut out = Vec::with_capacity(size);
        let nblocks = (size + BLOCK_SZ - 1) / BLOCK_SZ;
        for lbn in 0..nblocks {
            let bno = self.lookup_block(inode, lbn)?.ok_or_else(|| FsError::Malformed {
                entity: "inode",
                offset: 0,
                reason: format!("size {} but logical block {} unmapped", size, lbn),
            })?;
            let blk: FileBlock = self.read_block(bno)?;
            out.extend_from_slice(&blk.content);
        }
        out.truncate(size);
        Ok(out)
    }

    /// Replace the content of file `ino`, growing or shrinking its block set.
    pub(crate) fn write_content(&mut self, ino: i32, inode: &mut Inode, data: &[u8]) -> Result<()> {
        let needed = (data.len() + BLOCK_SZ - 1) / BLOCK_SZ;
        if needed > MAX_BLOCKS {
            return Err(FsError::IndirectionUnsupported(format!(
                "{} bytes need {} blocks, at most {} addressable",
                data.len(),
                needed,
                MAX_BLOCKS
            )));
        }
        for (lbn, chunk) in data.chunks(BLOCK_SZ).enumerate() {
            let bno = self.map_block(inode, lbn)?;
            self.write_block(bno, &FileBlock::from_chunk(chunk))?;
        }
        self.truncate_blocks(inode, needed)?;
        inode.size = data.len() as i32;
        inode.touch();
        self.write_inode(ino, inode)
    }

    /// Release every logical block at index `keep` and above, pointer pages included.
    pub(crate) fn truncate_blocks(&mut self, inode: &mut Inode, keep: usize) -> Result<()> {
        for slot in keep.min(NDIRECT)..NDIRECT {
            if let Some(b) = ptr(inode.block[slot]) {
                self.free_block(b)?;
                inode.block[slot] = NONE;
            }
        }
        let mut base = NDIRECT;
        for (level, span) in SPANS.iter().enumerate() {
            let slot = NDIRECT + level;
            if let Some(root) = ptr(inode.block[slot]) {
                let k = keep.saturating_sub(base);
                if k < *span && self.prune(root, level as u32 + 1, k)? {
                    inode.block[slot] = NONE;
                }
            }
            base += span;
        }
        Ok(())
    }

    /// Drop leaves at index >= `keep` under pointer page `bno`; true if `bno` itself was freed.
    fn prune(&mut self, bno: i32, depth: u32, keep: usize) -> Result<bool> {
        if keep == 0 {
            self.release_tree(bno, depth)?;
            return Ok(true);
        }
        let span = NPTRS.pow(depth - 1);
        let mut page: PointerBlock = self.read_block(bno)?;
        let mut dirty = false;
        for i in 0..NPTRS {
            let child = match ptr(page.pointers[i]) {
                Some(c) => c,
                None => continue,
            };
            let lo = i * span;
            if lo + span <= keep {
                continue;
            }
            let freed = if depth == 1 {
                self.free_block(child)?;
                true
            } else {
                self.prune(child, depth - 1, keep.saturating_sub(lo))?
            };
            if freed {
                page.pointers[i] = NONE;
                dirty = true;
            }
        }
        if dirty {
            self.write_block(bno, &page)?;
        }
        Ok(false)
    }

    /// Free a pointer tree of `depth` levels rooted at `bno`, leaves included.
    fn release_tree(&mut self, bno: i32, depth: u32) -> Result<()> {
        let mut stack = vec![(bno, depth)];
        while let Some((b, d)) = stack.pop() {
            if d > 0 {
                let page: PointerBlock = self.read_block(b)?;
                stack.extend(page.pointers.iter().filter_map(|&p| ptr(p)).map(|p| (p, d - 1)));
            }
            self.free_block(b)?;
        }
        Ok(())
    }

    /// Free every block of `inode`; the inode itself is left to the caller.
    pub(crate) fn release_blocks(&mut self, inode: &mut Inode) -> Result<()> {
        self.truncate_blocks(inode, 0)?;
        inode.size = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScratchDisk;
    use blk_dev::DiskFile;
    use disk::FileKind;
    use fs::FsType;
    use perm::Perm;
    use std::sync::Arc;

    fn mkfs(scratch: &ScratchDisk, size: u64) -> FileSystem {
        let dev = Arc::new(DiskFile::create(scratch.path(), size).unwrap());
        FileSystem::format(dev, 0, size, FsType::Ext2, "1,G,root\n").unwrap()
    }

    fn new_file(fs: &mut FileSystem) -> (i32, Inode) {
        let ino = fs.alloc_inode().unwrap();
        let inode = Inode::new(FileKind::File, 1, 1, Perm::parse("664").unwrap());
        fs.write_inode(ino, &inode).unwrap();
        (ino, inode)
    }

    #[test]
    fn locate_slots() {
        assert_eq!(locate(0).unwrap(), (0, 0, 0));
        assert_eq!(locate(11).unwrap(), (11, 0, 0));
        assert_eq!(locate(12).unwrap(), (12, 1, 0));
        assert_eq!(locate(27).unwrap(), (12, 1, 15));
        assert_eq!(locate(28).unwrap(), (13, 2, 0));
        assert_eq!(locate(28 + 256).unwrap(), (14, 3, 0));
        assert_eq!(locate(MAX_BLOCKS - 1).unwrap(), (14, 3, 4095));
        assert!(matches!(
            locate(MAX_BLOCKS),
            Err(FsError::IndirectionUnsupported(_))
        ));
    }

    #[test]
    fn small_content_uses_direct_blocks() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch, 64 * 1024);
        let (ino, mut inode) = new_file(&mut fs);
        let data = digit_content(130);
        fs.write_content(ino, &mut inode, data.as_bytes()).unwrap();
        assert_eq!(inode.block[..4], [2, 3, 4, NONE]);
        let back = fs.read_inode(ino).unwrap();
        assert_eq!(back.size, 130);
        assert_eq!(fs.read_content(&back).unwrap(), data.as_bytes());
    }

    #[test]
    fn content_spills_into_double_indirect() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch, 256 * 1024);
        let (ino, mut inode) = new_file(&mut fs);
        // 12 direct + 16 single + 3 through the double tree
        let data = digit_content(BLOCK_SZ * 31);
        fs.write_content(ino, &mut inode, data.as_bytes()).unwrap();
        assert!(inode.block[12] >= 0);
        assert!(inode.block[13] >= 0);
        assert_eq!(inode.block[14], NONE);
        assert_eq!(fs.data_blocks(&inode).unwrap().len(), 31);
        assert_eq!(fs.read_content(&inode).unwrap(), data.as_bytes());

        let before = fs.super_block().blocks_count;
        fs.write_content(ino, &mut inode, b"short").unwrap();
        assert_eq!(inode.block[12], NONE);
        assert_eq!(inode.block[13], NONE);
        // 30 data blocks, the single page, the double root and one second-level page
        assert_eq!(fs.super_block().blocks_count, before - 33);
        assert_eq!(fs.read_content(&inode).unwrap(), b"short");
    }

    #[test]
    fn release_frees_everything() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch, 64 * 1024);
        let (ino, mut inode) = new_file(&mut fs);
        let used = fs.super_block().blocks_count;
        fs.write_content(ino, &mut inode, digit_content(64 * 14).as_bytes()).unwrap();
        assert_eq!(fs.super_block().blocks_count, used + 15);
        fs.release_blocks(&mut inode).unwrap();
        assert_eq!(fs.super_block().blocks_count, used);
        assert!(inode.block.iter().all(|&b| b == NONE));
    }
}
