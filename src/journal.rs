//! Ext3 journal: fixed 114 byte slots right after the superblock.
//!
//! Slot `i` lives at `part_start + 68 + 114 * i` and stores `count = i + 1`;
//! a zero count ends the log. Slots 0 and 1 are written by mkfs and describe
//! `/` and `/users.txt`, user mutations start at slot 2.

use super::*;
use blk_dev::DiskDevice;
use codec::{fixed_bytes, DiskRecord};
use common::*;
use fs::{FileSystem, FsType, SuperBlock};
use path::FsPath;
use perm::{Perm, Session};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// width of the path field of a slot
pub const PATH_WIDTH: usize = 32;
/// width of the content field of a slot
pub const CONTENT_WIDTH: usize = 64;

/// the mutation carried by a journal slot
#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Information {
    pub operation: [u8; 10],
    pub path: [u8; PATH_WIDTH],
    #[serde(with = "fixed_bytes")]
    pub content: [u8; CONTENT_WIDTH],
    pub date: f32,
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Journal {
    /// slot index + 1, 0 for an unused slot
    pub count: i32,
    pub content: Information,
}

impl DiskRecord for Journal {
    const SIZE: usize = JOURNAL_SZ;
    const ENTITY: &'static str = "journal";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalOp {
    Mkdir,
    /// file with explicit content, logged verbatim
    Mkfile,
    /// file of `0123456789...`, logged as its length
    MkfileSize,
    Edit,
    Remove,
    Rename,
    Copy,
    Chmod,
    Chown,
}

impl JournalOp {
    pub fn as_str(self) -> &'static str {
        match self {
            JournalOp::Mkdir => "mkdir",
            JournalOp::Mkfile => "mkfile",
            JournalOp::MkfileSize => "mkfilesize",
            JournalOp::Edit => "edit",
            JournalOp::Remove => "remove",
            JournalOp::Rename => "rename",
            JournalOp::Copy => "copy",
            JournalOp::Chmod => "chmod",
            JournalOp::Chown => "chown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mkdir" => JournalOp::Mkdir,
            "mkfile" => JournalOp::Mkfile,
            "mkfilesize" => JournalOp::MkfileSize,
            "edit" => JournalOp::Edit,
            "remove" => JournalOp::Remove,
            "rename" => JournalOp::Rename,
            "copy" => JournalOp::Copy,
            "chmod" => JournalOp::Chmod,
            "chown" => JournalOp::Chown,
            _ => return None,
        })
    }
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn malformed(what: &str, raw: &str) -> FsError {
    FsError::Malformed {
        entity: "journal",
        offset: 0,
        reason: format!("bad {} record {:?}", what, raw),
    }
}

/// Content of a chmod entry: `664` or `664,r`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PermRecord {
    pub perm: Perm,
    pub recursive: bool,
}

impl fmt::Display for PermRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.perm)?;
        if self.recursive {
            f.write_str(",r")?;
        }
        Ok(())
    }
}

impl FromStr for PermRecord {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        let (perm, recursive) = match s.split_once(',') {
            Some((perm, "r")) => (perm, true),
            Some(_) => return Err(malformed("chmod", s)),
            None => (s, false),
        };
        Ok(Self {
            perm: Perm::parse(perm)?,
            recursive,
        })
    }
}

/// Content of a chown entry: `name,uid,gid` with a trailing `,r` when recursive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRecord {
    pub owner: String,
    pub uid: i32,
    pub gid: i32,
    pub recursive: bool,
}

impl fmt::Display for OwnerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.owner, self.uid, self.gid)?;
        if self.recursive {
            f.write_str(",r")?;
        }
        Ok(())
    }
}

impl FromStr for OwnerRecord {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split(',').collect();
        let recursive = match fields.len() {
            3 => false,
            4 if fields[3] == "r" => true,
            _ => return Err(malformed("chown", s)),
        };
        let id = |raw: &str| raw.parse::<i32>().map_err(|_| malformed("chown", s));
        Ok(Self {
            owner: fields[0].to_string(),
            uid: id(fields[1])?,
            gid: id(fields[2])?,
            recursive,
        })
    }
}

/// Decoded slot as shown by `journaling`.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct JournalEntry {
    pub count: i32,
    pub operation: String,
    pub path: String,
    pub content: String,
    pub date: String,
}

impl Journal {
    fn new(slot: i32, op: JournalOp, path: &str, content: &str) -> Self {
        if path.len() > PATH_WIDTH || content.len() > CONTENT_WIDTH {
            log::warn!("journal entry for {} truncated", path);
        }
        Self {
            count: slot + 1,
            content: Information {
                operation: encode_name(op.as_str()),
                path: encode_name(path),
                content: encode_name(content),
                date: now(),
            },
        }
    }

    pub fn operation(&self) -> String {
        decode_name(&self.content.operation)
    }

    pub fn path(&self) -> String {
        decode_name(&self.content.path)
    }

    pub fn text(&self) -> String {
        let raw = &self.content.content;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    pub fn entry(&self) -> JournalEntry {
        JournalEntry {
            count: self.count,
            operation: self.operation(),
            path: self.path(),
            content: self.text(),
            date: format_time(self.content.date),
        }
    }
}

fn journal_start(part_start: u64) -> u64 {
    part_start + SUPER_BLOCK_SZ as u64
}

fn read_slot_at(dev: &dyn DiskDevice, part_start: u64, slot: i32) -> Result<Journal> {
    Journal::read_from(dev, journal_start(part_start) + slot as u64 * JOURNAL_SZ as u64)
}

impl FileSystem {
    pub(crate) fn journal_start(&self) -> u64 {
        journal_start(self.part_start())
    }

    pub(crate) fn journal_len(&self) -> u64 {
        (self.sb.bm_inode_start as u64).saturating_sub(self.journal_start())
    }

    pub fn journal_slots(&self) -> i32 {
        (self.journal_len() / JOURNAL_SZ as u64) as i32
    }

    fn require_ext3(&self, what: &str) -> Result<()> {
        match self.fs_type()? {
            FsType::Ext3 => Ok(()),
            FsType::Ext2 => Err(FsError::UnsupportedFilesystemType(format!(
                "{} needs ext3",
                what
            ))),
        }
    }

    pub(crate) fn read_slot(&self, slot: i32) -> Result<Journal> {
        read_slot_at(self.dev(), self.part_start(), slot)
    }

    pub(crate) fn write_slot(&self, slot: i32, op: JournalOp, path: &str, content: &str) -> Result<()> {
        if slot < 0 || slot >= self.journal_slots() {
            return Err(FsError::NoFreeSpace(format!("journal slot {} out of range", slot)));
        }
        let at = self.journal_start() + slot as u64 * JOURNAL_SZ as u64;
        Journal::new(slot, op, path, content).write_to(self.dev(), at)
    }

    fn journaling_active(&self) -> Result<bool> {
        Ok(!self.replaying && self.fs_type()? == FsType::Ext3)
    }

    /// Refuse a mutation whose record would not fit its slot, before anything changes.
    pub(crate) fn check_journal(&self, path: &FsPath, content: &str) -> Result<()> {
        if !self.journaling_active()? {
            return Ok(());
        }
        let path = path.to_string();
        if path.len() > PATH_WIDTH {
            return Err(FsError::InvalidArgument(format!(
                "path {} is longer than the {} bytes an ext3 journal entry holds",
                path, PATH_WIDTH
            )));
        }
        if content.len() > CONTENT_WIDTH {
            return Err(FsError::InvalidArgument(format!(
                "content for {} is longer than the {} bytes an ext3 journal entry holds",
                path, CONTENT_WIDTH
            )));
        }
        Ok(())
    }

    /// Append a mutation record. A no-op on ext2 and while replaying.
    pub(crate) fn journal(&self, op: JournalOp, path: &str, content: &str) -> Result<()> {
        if !self.journaling_active()? {
            return Ok(());
        }
        for slot in JOURNAL_BASE_SLOT as i32..self.journal_slots() {
            if self.read_slot(slot)?.count == 0 {
                log::debug!("journal {} {} in slot {}", op, path, slot);
                return self.write_slot(slot, op, path, content);
            }
        }
        Err(FsError::NoFreeSpace("journal is full".to_string()))
    }

    /// Entries logged since format, oldest first.
    pub fn journal_entries(&self) -> Result<Vec<JournalEntry>> {
        self.require_ext3("journaling")?;
        let mut out = Vec::new();
        for slot in JOURNAL_BASE_SLOT as i32..self.journal_slots() {
            let j = self.read_slot(slot)?;
            if j.count == 0 {
                break;
            }
            out.push(j.entry());
        }
        Ok(out)
    }

    /// Zero the superblock, both bitmaps, the inode table and the block table.
    /// The journal survives.
    pub fn loss(&mut self) -> Result<()> {
        self.require_ext3("loss")?;
        let sb = self.sb.clone();
        let tables_end = sb.block_start as u64 + sb.block_capacity() as u64 * BLOCK_SZ as u64;
        self.zero(self.part_start(), SUPER_BLOCK_SZ as u64)?;
        self.zero(sb.bm_inode_start as u64, tables_end - sb.bm_inode_start as u64)?;
        self.sb = SuperBlock::default();
        log::info!("simulated loss at {}", self.part_start());
        Ok(())
    }

    /// Re-apply one logged mutation as root.
    fn replay(&mut self, who: &Session, j: &Journal) -> Result<()> {
        let raw_path = j.path();
        let op = match JournalOp::parse(&j.operation()) {
            Some(op) => op,
            None => {
                log::warn!("unknown journal operation {:?} at {}", j.operation(), raw_path);
                return Ok(());
            }
        };
        let path = FsPath::parse(&raw_path)?;
        let text = j.text();
        log::debug!("replay {} {} {:?}", op, raw_path, text);
        match op {
            JournalOp::Mkdir => self.mkdir(who, &path, true),
            JournalOp::Mkfile => self.mkfile(who, &path, true, None, Some(&text)),
            JournalOp::MkfileSize => {
                let n = text.parse::<usize>().map_err(|_| malformed("mkfile size", &text))?;
                self.mkfile(who, &path, true, Some(n), None)
            }
            JournalOp::Edit => self.edit(who, &path, &text),
            JournalOp::Remove => self.remove(who, &path),
            JournalOp::Rename => self.rename(who, &path, &text),
            JournalOp::Copy => self.copy(who, &path, &FsPath::parse(&text)?),
            JournalOp::Chmod => {
                let rec: PermRecord = text.parse()?;
                self.chmod(who, &path, rec.recursive, rec.perm)
            }
            JournalOp::Chown => {
                let rec: OwnerRecord = text.parse()?;
                self.chown(who, &path, rec.recursive, &rec.owner, rec.uid, rec.gid)
            }
        }
    }
}

/// Rebuild an ext3 partition from its journal: fresh geometry, a fresh root and
/// users table, then every logged mutation from slot 2 on, owned by 0/0.
pub fn recover(
    dev: Arc<dyn DiskDevice>,
    part_start: u64,
    part_size: u64,
    mount_id: &str,
    users: &str,
) -> Result<FileSystem> {
    let sb = SuperBlock::read_from(&*dev, part_start)?;
    if sb.magic == FSMAGIC && sb.filesystem_type != FsType::Ext3 as i32 {
        return Err(FsError::UnsupportedFilesystemType(
            "recovery needs ext3".to_string(),
        ));
    }
    let head = read_slot_at(&*dev, part_start, 0)?;
    if head.count != 1 || head.operation() != JournalOp::Mkdir.as_str() {
        return Err(FsError::UnsupportedFilesystemType(format!(
            "no ext3 journal at {}",
            part_start
        )));
    }

    let mut fs = FileSystem::build(dev, part_start, part_size, FsType::Ext3, users, false)?;
    let who = Session::replay(mount_id);
    fs.replaying = true;
    let mut replayed = 0;
    let mut result = Ok(());
    for slot in JOURNAL_BASE_SLOT as i32..fs.journal_slots() {
        let j = match fs.read_slot(slot) {
            Ok(j) => j,
            Err(e) => {
                result = Err(e);
                break;
            }
        };
        if j.count == 0 {
            break;
        }
        if let Err(e) = fs.replay(&who, &j) {
            result = Err(e);
            break;
        }
        replayed += 1;
    }
    fs.replaying = false;
    result?;
    log::info!("recovered {} from {} journal entries", mount_id, replayed);
    Ok(fs)
}
