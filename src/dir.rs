//! Directory pages. Every page keeps `.` and `..` in slots 0 and 1, so two
//! entries fit per page; slots with inode `-1` are free.

use super::*;
use common::*;
use disk::{FileKind, FolderBlock, FolderContent, Inode};
use fs::FileSystem;
use path::FsPath;
use perm::Perm;

/// first usable slot of a directory page
const FIRST_SLOT: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: i32,
}

struct Slot {
    page: i32,
    idx: usize,
    ino: i32,
}

fn same_name(stored: &str, wanted: &str, exact: bool) -> bool {
    if exact {
        stored == wanted
    } else {
        stored.eq_ignore_ascii_case(wanted)
    }
}

impl FileSystem {
    pub fn entries(&self, dir: &Inode) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for bno in self.data_blocks(dir)? {
            let page: FolderBlock = self.read_block(bno)?;
            for c in page.content[FIRST_SLOT..].iter().filter(|c| !c.is_free()) {
                out.push(DirEntry {
                    name: c.name(),
                    ino: c.inode,
                });
            }
        }
        Ok(out)
    }

    fn find_slot(&self, dir: &Inode, name: &str, exact: bool) -> Result<Option<Slot>> {
        for bno in self.data_blocks(dir)? {
            let page: FolderBlock = self.read_block(bno)?;
            for (idx, c) in page.content.iter().enumerate().skip(FIRST_SLOT) {
                if !c.is_free() && same_name(&c.name(), name, exact) {
                    return Ok(Some(Slot {
                        page: bno,
                        idx,
                        ino: c.inode,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Child inode named `name`; `exact` off means ASCII case-insensitive.
    pub fn lookup(&self, dir: &Inode, name: &str, exact: bool) -> Result<Option<i32>> {
        Ok(self.find_slot(dir, name, exact)?.map(|s| s.ino))
    }

    pub(crate) fn insert_entry(&mut self, dir_ino: i32, name: &str, child: i32) -> Result<()> {
        let mut dir = self.read_inode(dir_ino)?;
        let pages = self.data_blocks(&dir)?;
        for &bno in &pages {
            let mut page: FolderBlock = self.read_block(bno)?;
            if let Some(c) = page.content[FIRST_SLOT..].iter_mut().find(|c| c.is_free()) {
                *c = FolderContent::new(name, child);
                self.write_block(bno, &page)?;
                dir.touch();
                return self.write_inode(dir_ino, &dir);
            }
        }

        let parent = match pages.first() {
            Some(&first) => self.read_block::<FolderBlock>(first)?.content[1].inode,
            None => dir_ino,
        };
        let bno = self.map_block(&mut dir, pages.len())?;
        let mut page = FolderBlock::first(dir_ino, parent);
        page.content[FIRST_SLOT] = FolderContent::new(name, child);
        self.write_block(bno, &page)?;
        log::debug!("directory {} grew to {} pages", dir_ino, pages.len() + 1);
        dir.touch();
        self.write_inode(dir_ino, &dir)
    }

    /// Clear the slot named `name` (exact match) and return the inode it held.
    pub(crate) fn remove_entry(&mut self, dir_ino: i32, name: &str) -> Result<i32> {
        let mut dir = self.read_inode(dir_ino)?;
        let slot = self
            .find_slot(&dir, name, true)?
            .ok_or_else(|| FsError::PathSegmentMissing(name.to_string()))?;
        let mut page: FolderBlock = self.read_block(slot.page)?;
        page.content[slot.idx] = FolderContent::free();
        self.write_block(slot.page, &page)?;
        dir.touch();
        self.write_inode(dir_ino, &dir)?;
        Ok(slot.ino)
    }

    pub(crate) fn rename_entry(&mut self, dir_ino: i32, old: &str, new: &str) -> Result<()> {
        let dir = self.read_inode(dir_ino)?;
        if self.lookup(&dir, new, true)?.is_some() {
            return Err(FsError::AlreadyExists(new.to_string()));
        }
        let slot = self
            .find_slot(&dir, old, true)?
            .ok_or_else(|| FsError::PathSegmentMissing(old.to_string()))?;
        let mut page: FolderBlock = self.read_block(slot.page)?;
        page.content[slot.idx] = FolderContent::new(new, slot.ino);
        self.write_block(slot.page, &page)
    }

    /// Allocate an inode for `name` under `parent` and link it in. Directories get
    /// their first page right away; files stay empty until written.
    pub(crate) fn create_child(
        &mut self,
        parent: i32,
        name: &str,
        kind: FileKind,
        uid: i32,
        gid: i32,
        perm: Perm,
    ) -> Result<i32> {
        path::check_name(name)?;
        let ino = self.alloc_inode()?;
        let mut inode = Inode::new(kind, uid, gid, perm);
        if let Err(e) = self.link_child(parent, name, ino, &mut inode) {
            // nothing links to the new inode, hand its bits back
            if let Some(bno) = ptr(inode.block[0]) {
                self.free_block(bno)?;
            }
            self.free_inode(ino)?;
            return Err(e);
        }
        log::debug!("created {:?} {} as inode {} under {}", kind, name, ino, parent);
        Ok(ino)
    }

    fn link_child(&mut self, parent: i32, name: &str, ino: i32, inode: &mut Inode) -> Result<()> {
        if inode.is_dir() {
            let bno = self.alloc_block()?;
            inode.block[0] = bno;
            self.write_block(bno, &FolderBlock::first(ino, parent))?;
        }
        self.write_inode(ino, inode)?;
        self.insert_entry(parent, name, ino)
    }

    /// Walk `path` from the root. Intermediate components match ignoring case,
    /// the final one must match exactly.
    pub fn resolve(&self, path: &FsPath) -> Result<i32> {
        let mut cur = ROOT_INO;
        let last = path.len();
        for (i, part) in path.parts().iter().enumerate() {
            let inode = self.read_inode(cur)?;
            if !inode.is_dir() {
                return Err(FsError::NotADirectory(path.prefix(i).to_string()));
            }
            cur = self
                .lookup(&inode, part, i + 1 == last)?
                .ok_or_else(|| FsError::PathSegmentMissing(path.prefix(i + 1).to_string()))?;
        }
        Ok(cur)
    }

    pub(crate) fn resolve_dir(&self, path: &FsPath) -> Result<(i32, Inode)> {
        let ino = self.resolve(path)?;
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        Ok((ino, inode))
    }

    pub(crate) fn resolve_file(&self, path: &FsPath) -> Result<(i32, Inode)> {
        let ino = self.resolve(path)?;
        let inode = self.read_inode(ino)?;
        if !inode.is_file() {
            return Err(FsError::NotAFile(path.to_string()));
        }
        Ok((ino, inode))
    }
}
