//! Partition layout after format:
//! [ super block | journal (ext3 only, N slots) | inode bitmap (N) | block bitmap (3N) | inodes (N) | blocks (3N) ]
//! every `_start` in the super block is an absolute offset into the disk image

use super::*;
use codec::{fixed_bytes, DiskRecord};
use common::*;
use perm::Perm;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
}

impl FileKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FileKind::Directory => KIND_DIR,
            FileKind::File => KIND_FILE,
        }
    }
}

/// inode on disk
#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Inode {
    /// owner user id
    pub uid: i32,
    /// owner group id
    pub gid: i32,
    /// Size of file (bytes), 0 for directories
    pub size: i32,
    /// last access
    pub atime: f32,
    /// creation
    pub ctime: f32,
    /// last modification
    pub mtime: f32,
    /// 0..12 direct, 12 single, 13 double, 14 triple indirect
    pub block: [i32; NDIRECT + 3],
    /// '0' directory, '1' file
    pub kind: u8,
    /// ugo digits as ASCII, e.g. b"664"
    pub perm: [u8; 3],
}

impl DiskRecord for Inode {
    const SIZE: usize = INODE_SZ;
    const ENTITY: &'static str = "inode";
}

impl Inode {
    pub fn new(kind: FileKind, uid: i32, gid: i32, perm: Perm) -> Self {
        let t = now();
        Self {
            uid,
            gid,
            size: 0,
            atime: t,
            ctime: t,
            mtime: t,
            block: [NONE; NDIRECT + 3],
            kind: kind.as_byte(),
            perm: perm.to_bytes(),
        }
    }

    pub fn kind(&self) -> Option<FileKind> {
        match self.kind {
            KIND_DIR => Some(FileKind::Directory),
            KIND_FILE => Some(FileKind::File),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == KIND_DIR
    }

    pub fn is_file(&self) -> bool {
        self.kind == KIND_FILE
    }

    pub fn perm(&self) -> Perm {
        Perm::from_bytes(self.perm)
    }

    pub fn touch(&mut self) {
        let t = now();
        self.atime = t;
        self.mtime = t;
    }
}

/// one directory entry
#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FolderContent {
    pub name: [u8; DIRSIZ],
    /// `-1` marks a free slot
    pub inode: i32,
}

impl FolderContent {
    pub fn free() -> Self {
        Self {
            name: encode_name(FREE_NAME),
            inode: NONE,
        }
    }

    pub fn new(name: &str, ino: i32) -> Self {
        Self {
            name: encode_name(name),
            inode: ino,
        }
    }

    pub fn is_free(&self) -> bool {
        self.inode == NONE
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }
}

/// 4 entries per page, slots 0 and 1 of a directory's first page hold `.` and `..`
#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FolderBlock {
    pub content: [FolderContent; 4],
}

impl DiskRecord for FolderBlock {
    const SIZE: usize = BLOCK_SZ;
    const ENTITY: &'static str = "folder block";
}

impl FolderBlock {
    pub fn empty() -> Self {
        Self {
            content: [
                FolderContent::free(),
                FolderContent::free(),
                FolderContent::free(),
                FolderContent::free(),
            ],
        }
    }

    /// First page of a new directory.
    pub fn first(this: i32, parent: i32) -> Self {
        let mut blk = Self::empty();
        blk.content[0] = FolderContent::new(".", this);
        blk.content[1] = FolderContent::new("..", parent);
        blk
    }
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileBlock {
    #[serde(with = "fixed_bytes")]
    pub content: [u8; BLOCK_SZ],
}

impl DiskRecord for FileBlock {
    const SIZE: usize = BLOCK_SZ;
    const ENTITY: &'static str = "file block";
}

impl FileBlock {
    /// NUL padded copy of at most one block of `chunk`.
    pub fn from_chunk(chunk: &[u8]) -> Self {
        let mut content = [0u8; BLOCK_SZ];
        let len = chunk.len().min(BLOCK_SZ);
        content[..len].copy_from_slice(&chunk[..len]);
        Self { content }
    }
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PointerBlock {
    pub pointers: [i32; NPTRS],
}

impl DiskRecord for PointerBlock {
    const SIZE: usize = BLOCK_SZ;
    const ENTITY: &'static str = "pointer block";
}

impl PointerBlock {
    pub fn empty() -> Self {
        Self {
            pointers: [NONE; NPTRS],
        }
    }
}
