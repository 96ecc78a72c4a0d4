//! Disk layout:
//! [ MBR (153 bytes) | primary/extended partitions placed in the free gaps ]
//! an extended partition starts with an EBR; each EBR is followed by its
//! logical partition's data and links to the next EBR through `next`.

use super::*;
use blk_dev::{DiskDevice, DiskFile};
use codec::DiskRecord;
use common::*;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// MBR slot and EBR status byte of a free entry
pub const FREE: u8 = b'N';
pub const CREATED: u8 = b'0';
pub const MOUNTED: u8 = b'1';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fit {
    First,
    Best,
    Worst,
}

impl Fit {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "F" | "FF" => Ok(Fit::First),
            "B" | "BF" => Ok(Fit::Best),
            "W" | "WF" => Ok(Fit::Worst),
            other => Err(FsError::InvalidArgument(format!("unknown fit {}", other))),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Fit::First => b'F',
            Fit::Best => b'B',
            Fit::Worst => b'W',
        }
    }

    /// Start of the gap this strategy picks for `size` bytes.
    pub fn choose(self, gaps: &[(u64, u64)], size: u64) -> Option<u64> {
        let mut fitting = gaps.iter().filter(|(_, len)| *len >= size);
        let gap = match self {
            Fit::First => fitting.next(),
            Fit::Best => fitting.min_by_key(|(_, len)| *len),
            Fit::Worst => fitting.max_by_key(|(_, len)| *len),
        };
        gap.map(|(start, _)| *start)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeUnit {
    Bytes,
    Kilo,
    Mega,
}

impl SizeUnit {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "B" => Ok(SizeUnit::Bytes),
            "K" => Ok(SizeUnit::Kilo),
            "M" => Ok(SizeUnit::Mega),
            other => Err(FsError::InvalidArgument(format!("unknown unit {}", other))),
        }
    }

    pub fn bytes(self, n: u64) -> u64 {
        match self {
            SizeUnit::Bytes => n,
            SizeUnit::Kilo => n * 1024,
            SizeUnit::Mega => n * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartKind {
    Primary,
    Extended,
    Logical,
}

impl PartKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "P" => Ok(PartKind::Primary),
            "E" => Ok(PartKind::Extended),
            "L" => Ok(PartKind::Logical),
            other => Err(FsError::InvalidArgument(format!("unknown partition type {}", other))),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            PartKind::Primary => b'P',
            PartKind::Extended => b'E',
            PartKind::Logical => b'L',
        }
    }
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Partition {
    /// 'N' free, '0' created, '1' mounted
    pub status: u8,
    /// 'P' or 'E'
    pub kind: u8,
    pub fit: u8,
    /// absolute offset, `-1` when free
    pub start: i32,
    pub size: i32,
    pub name: [u8; 16],
    /// 1-based slot number once mounted
    pub correlative: i32,
    /// mount id
    pub id: [u8; 4],
}

impl Partition {
    pub fn free() -> Self {
        Self {
            status: FREE,
            kind: FREE,
            fit: FREE,
            start: NONE,
            size: NONE,
            name: encode_name("N"),
            correlative: NONE,
            id: encode_name("N"),
        }
    }

    pub fn is_free(&self) -> bool {
        self.start == NONE
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }

    pub fn end(&self) -> u64 {
        self.start.max(0) as u64 + self.size.max(0) as u64
    }
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Mbr {
    pub size: i32,
    pub creation_date: f32,
    pub disk_signature: i32,
    pub disk_fit: u8,
    pub partitions: [Partition; 4],
}

impl DiskRecord for Mbr {
    const SIZE: usize = MBR_SZ;
    const ENTITY: &'static str = "mbr";
}

#[repr(C)]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Ebr {
    /// 'N' unused head, '0' created, '1' mounted
    pub mount: u8,
    pub fit: u8,
    /// offset of this EBR; the logical data follows it
    pub start: i32,
    /// data size, `-1` for an unused head
    pub size: i32,
    /// offset of the next EBR, `-1` at the end of the chain
    pub next: i32,
    pub name: [u8; 16],
}

impl DiskRecord for Ebr {
    // EBR_SZ bytes are reserved on disk, the record itself is shorter
    const SIZE: usize = 30;
    const ENTITY: &'static str = "ebr";
}

impl Ebr {
    fn head(start: u64, fit: Fit) -> Self {
        Self {
            mount: FREE,
            fit: fit.as_byte(),
            start: start as i32,
            size: NONE,
            next: NONE,
            name: [0; 16],
        }
    }

    pub fn is_used(&self) -> bool {
        self.size != NONE
    }

    pub fn name(&self) -> String {
        decode_name(&self.name)
    }

    pub fn data_start(&self) -> u64 {
        self.start as u64 + EBR_SZ as u64
    }

    pub fn end(&self) -> u64 {
        self.data_start() + self.size.max(0) as u64
    }
}

/// A partition found by name, ready to be mounted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Located {
    pub name: String,
    pub kind: PartKind,
    /// 1..=4 for MBR slots, 5 and up for logical partitions in chain order
    pub index: usize,
    /// first byte of the partition's data
    pub start: u64,
    pub size: u64,
}

fn fits_i32(n: u64, what: &str) -> Result<i32> {
    i32::try_from(n).map_err(|_| FsError::InvalidArgument(format!("{} {} exceeds 2 GiB", what, n)))
}

/// Create a zero-filled image with a fresh MBR.
pub fn mkdisk(path: &Path, size: u64, fit: Fit) -> Result<Mbr> {
    let wire_size = fits_i32(size, "disk size")?;
    if size <= MBR_SZ as u64 {
        return Err(FsError::InvalidArgument(format!(
            "disk of {} bytes cannot hold an MBR",
            size
        )));
    }
    let dev = DiskFile::create(path, size).map_err(|e| FsError::io("disk image", 0, e))?;
    let mbr = Mbr {
        size: wire_size,
        creation_date: now(),
        disk_signature: rand::thread_rng().gen_range(0..i32::MAX),
        disk_fit: fit.as_byte(),
        partitions: [
            Partition::free(),
            Partition::free(),
            Partition::free(),
            Partition::free(),
        ],
    };
    mbr.write_to(&dev, 0)?;
    log::info!("created disk {} ({} bytes)", path.display(), size);
    Ok(mbr)
}

pub fn rmdisk(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(FsError::NotFound(format!("disk {}", path.display())));
    }
    std::fs::remove_file(path).map_err(|e| FsError::io("disk image", 0, e))?;
    log::info!("removed disk {}", path.display());
    Ok(())
}

impl Mbr {
    pub fn load(dev: &dyn DiskDevice) -> Result<Self> {
        Self::read_from(dev, 0)
    }

    pub fn store(&self, dev: &dyn DiskDevice) -> Result<()> {
        self.write_to(dev, 0)
    }

    /// Disk size minus the header and every allocated primary/extended partition.
    pub fn free_space(&self) -> u64 {
        let used: u64 = self
            .partitions
            .iter()
            .filter(|p| !p.is_free())
            .map(|p| p.size.max(0) as u64)
            .sum();
        (self.size.max(0) as u64).saturating_sub(MBR_SZ as u64 + used)
    }

    /// Free (start, len) regions after the header, in disk order.
    pub fn gaps(&self) -> Vec<(u64, u64)> {
        let mut taken: Vec<(u64, u64)> = self
            .partitions
            .iter()
            .filter(|p| !p.is_free())
            .map(|p| (p.start as u64, p.end()))
            .collect();
        taken.sort_unstable();
        let mut gaps = Vec::new();
        let mut cursor = MBR_SZ as u64;
        for (start, end) in taken {
            if start > cursor {
                gaps.push((cursor, start - cursor));
            }
            cursor = cursor.max(end);
        }
        let disk_end = self.size.max(0) as u64;
        if disk_end > cursor {
            gaps.push((cursor, disk_end - cursor));
        }
        gaps
    }

    pub fn extended(&self) -> Option<&Partition> {
        self.partitions
            .iter()
            .find(|p| !p.is_free() && p.kind == PartKind::Extended.as_byte())
    }

    fn name_taken(&self, dev: &dyn DiskDevice, name: &str) -> Result<bool> {
        if self.partitions.iter().any(|p| !p.is_free() && p.name() == name) {
            return Ok(true);
        }
        Ok(self.logicals(dev)?.iter().any(|e| e.name() == name))
    }

    /// Used EBRs of the extended partition in chain order.
    pub fn logicals(&self, dev: &dyn DiskDevice) -> Result<Vec<Ebr>> {
        Ok(self.ebr_chain(dev)?.into_iter().filter(Ebr::is_used).collect())
    }

    /// Every EBR including an unused head; empty without an extended partition.
    fn ebr_chain(&self, dev: &dyn DiskDevice) -> Result<Vec<Ebr>> {
        let ext = match self.extended() {
            Some(ext) => ext,
            None => return Ok(Vec::new()),
        };
        let mut chain = Vec::new();
        let mut at = ext.start;
        while at != NONE {
            if at < ext.start || at as u64 >= ext.end() || chain.iter().any(|e: &Ebr| e.start == at) {
                return Err(FsError::Malformed {
                    entity: Ebr::ENTITY,
                    offset: at.max(0) as u64,
                    reason: "EBR chain leaves the extended partition or loops".to_string(),
                });
            }
            let ebr = Ebr::read_from(dev, at as u64)?;
            at = ebr.next;
            chain.push(ebr);
        }
        Ok(chain)
    }

    pub fn create_partition(
        &mut self,
        dev: &dyn DiskDevice,
        name: &str,
        size: u64,
        kind: PartKind,
        fit: Fit,
    ) -> Result<Located> {
        if name.is_empty() || name.len() > 16 {
            return Err(FsError::InvalidArgument(format!(
                "partition name {:?} must be 1 to 16 bytes",
                name
            )));
        }
        if size == 0 {
            return Err(FsError::InvalidArgument("partition size must be positive".to_string()));
        }
        if self.name_taken(dev, name)? {
            return Err(FsError::AlreadyExists(format!("partition {}", name)));
        }
        match kind {
            PartKind::Logical => self.create_logical(dev, name, size, fit),
            PartKind::Primary | PartKind::Extended => self.create_primary(dev, name, size, kind, fit),
        }
    }

    fn create_primary(
        &mut self,
        dev: &dyn DiskDevice,
        name: &str,
        size: u64,
        kind: PartKind,
        fit: Fit,
    ) -> Result<Located> {
        if kind == PartKind::Extended && self.extended().is_some() {
            return Err(FsError::AlreadyExists("extended partition".to_string()));
        }
        if size > self.free_space() {
            return Err(FsError::NoFreeSpace(format!(
                "{} bytes requested, {} free",
                size,
                self.free_space()
            )));
        }
        let slot = self
            .partitions
            .iter()
            .position(Partition::is_free)
            .ok_or_else(|| FsError::NoFreeSpace("all four partition slots are used".to_string()))?;
        let start = fit.choose(&self.gaps(), size).ok_or_else(|| {
            FsError::NoFreeSpace(format!("no contiguous gap of {} bytes", size))
        })?;

        self.partitions[slot] = Partition {
            status: CREATED,
            kind: kind.as_byte(),
            fit: fit.as_byte(),
            start: fits_i32(start, "partition start")?,
            size: fits_i32(size, "partition size")?,
            name: encode_name(name),
            correlative: NONE,
            id: [0; 4],
        };
        if kind == PartKind::Extended {
            Ebr::head(start, fit).write_to(dev, start)?;
        }
        self.store(dev)?;
        log::info!("partition {} ({:?}) at {} size {}", name, kind, start, size);
        Ok(Located {
            name: name.to_string(),
            kind,
            index: slot + 1,
            start,
            size,
        })
    }

    /// Logical partitions are appended to the EBR chain; fit does not apply.
    fn create_logical(&mut self, dev: &dyn DiskDevice, name: &str, size: u64, fit: Fit) -> Result<Located> {
        let ext = self
            .extended()
            .cloned()
            .ok_or_else(|| FsError::PartitionNotFound("extended partition".to_string()))?;
        let chain = self.ebr_chain(dev)?;
        let wire_size = fits_i32(size, "partition size")?;
        let (ebr, position) = match chain.last() {
            Some(head) if chain.len() == 1 && !head.is_used() => {
                let ebr = Ebr {
                    mount: CREATED,
                    fit: fit.as_byte(),
                    start: head.start,
                    size: wire_size,
                    next: NONE,
                    name: encode_name(name),
                };
                (ebr, 0)
            }
            Some(last) => {
                let start = last.end();
                let ebr = Ebr {
                    mount: CREATED,
                    fit: fit.as_byte(),
                    start: fits_i32(start, "EBR offset")?,
                    size: wire_size,
                    next: NONE,
                    name: encode_name(name),
                };
                (ebr, chain.len())
            }
            None => {
                return Err(FsError::Malformed {
                    entity: Ebr::ENTITY,
                    offset: ext.start as u64,
                    reason: "extended partition has no EBR".to_string(),
                })
            }
        };
        if ebr.end() > ext.end() {
            return Err(FsError::NoFreeSpace(format!(
                "{} bytes do not fit in extended partition {}",
                size,
                ext.name()
            )));
        }
        ebr.write_to(dev, ebr.start as u64)?;
        if position > 0 {
            let mut last = chain[chain.len() - 1].clone();
            last.next = ebr.start;
            last.write_to(dev, last.start as u64)?;
        }
        log::info!("logical partition {} at {} size {}", name, ebr.data_start(), size);
        Ok(Located {
            name: name.to_string(),
            kind: PartKind::Logical,
            index: 5 + position,
            start: ebr.data_start(),
            size,
        })
    }

    /// Free a partition by name. Deleting the extended partition drops its logicals.
    pub fn delete_partition(&mut self, dev: &dyn DiskDevice, name: &str) -> Result<PartKind> {
        if let Some(slot) = self
            .partitions
            .iter()
            .position(|p| !p.is_free() && p.name() == name)
        {
            let kind = if self.partitions[slot].kind == PartKind::Extended.as_byte() {
                PartKind::Extended
            } else {
                PartKind::Primary
            };
            self.partitions[slot] = Partition::free();
            self.store(dev)?;
            log::info!("deleted partition {}", name);
            return Ok(kind);
        }

        let chain = self.ebr_chain(dev)?;
        let pos = chain
            .iter()
            .position(|e| e.is_used() && e.name() == name)
            .ok_or_else(|| FsError::PartitionNotFound(name.to_string()))?;
        if pos == 0 {
            let mut head = chain[0].clone();
            head.mount = FREE;
            head.size = NONE;
            head.name = [0; 16];
            head.write_to(dev, head.start as u64)?;
        } else {
            let mut prev = chain[pos - 1].clone();
            prev.next = chain[pos].next;
            prev.write_to(dev, prev.start as u64)?;
        }
        log::info!("deleted logical partition {}", name);
        Ok(PartKind::Logical)
    }

    pub fn find(&self, dev: &dyn DiskDevice, name: &str) -> Result<Located> {
        for (i, p) in self.partitions.iter().enumerate() {
            if !p.is_free() && p.name() == name {
                let kind = if p.kind == PartKind::Extended.as_byte() {
                    PartKind::Extended
                } else {
                    PartKind::Primary
                };
                return Ok(Located {
                    name: p.name(),
                    kind,
                    index: i + 1,
                    start: p.start as u64,
                    size: p.size.max(0) as u64,
                });
            }
        }
        for (pos, e) in self.ebr_chain(dev)?.iter().enumerate() {
            if e.is_used() && e.name() == name {
                return Ok(Located {
                    name: e.name(),
                    kind: PartKind::Logical,
                    index: 5 + pos,
                    start: e.data_start(),
                    size: e.size as u64,
                });
            }
        }
        Err(FsError::PartitionNotFound(name.to_string()))
    }

    /// Record the mount state of `name`; `id` of `None` marks it unmounted.
    pub fn set_mounted(&mut self, dev: &dyn DiskDevice, name: &str, index: usize, id: Option<&str>) -> Result<()> {
        if let Some(p) = self
            .partitions
            .iter_mut()
            .find(|p| !p.is_free() && p.name() == name)
        {
            match id {
                Some(id) => {
                    p.status = MOUNTED;
                    p.correlative = index as i32;
                    p.id = encode_name(id);
                }
                None => {
                    p.status = CREATED;
                    p.id = [0; 4];
                }
            }
            return self.store(dev);
        }
        let mut ebr = self
            .ebr_chain(dev)?
            .into_iter()
            .find(|e| e.is_used() && e.name() == name)
            .ok_or_else(|| FsError::PartitionNotFound(name.to_string()))?;
        ebr.mount = if id.is_some() { MOUNTED } else { CREATED };
        ebr.write_to(dev, ebr.start as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScratchDisk;

    const DISK: u64 = 64 * 1024;

    fn disk(scratch: &ScratchDisk) -> (DiskFile, Mbr) {
        let mbr = mkdisk(scratch.path(), DISK, Fit::First).unwrap();
        (DiskFile::open(scratch.path()).unwrap(), mbr)
    }

    #[test]
    fn record_sizes() {
        let p = Partition::free();
        assert_eq!(bincode::serialize(&p).unwrap().len(), 35);
        let e = Ebr::head(0, Fit::First);
        assert_eq!(e.to_bytes().unwrap().len(), 30);
        assert!(Ebr::SIZE <= EBR_SZ);
    }

    #[test]
    fn fresh_disk() {
        let scratch = ScratchDisk::new();
        let (dev, mbr) = disk(&scratch);
        assert!(mbr.disk_signature >= 0);
        assert_eq!(mbr.free_space(), DISK - 153);
        let back = Mbr::load(&dev).unwrap();
        assert_eq!(back, mbr);
        assert!(back.partitions.iter().all(|p| p.status == b'N' && p.start == -1));
    }

    #[test]
    fn primary_reduces_free_space() {
        let scratch = ScratchDisk::new();
        let (dev, mut mbr) = disk(&scratch);
        let before = mbr.free_space();
        let at = mbr
            .create_partition(&dev, "part1", 10_000, PartKind::Primary, Fit::First)
            .unwrap();
        assert_eq!(at.start, 153);
        assert_eq!(at.index, 1);
        assert_eq!(mbr.free_space(), before - 10_000);
        assert_eq!(Mbr::load(&dev).unwrap(), mbr);
    }

    #[test]
    fn oversized_primary_leaves_mbr_alone() {
        let scratch = ScratchDisk::new();
        let (dev, mut mbr) = disk(&scratch);
        let snapshot = Mbr::load(&dev).unwrap();
        assert!(matches!(
            mbr.create_partition(&dev, "big", DISK, PartKind::Primary, Fit::First),
            Err(FsError::NoFreeSpace(_))
        ));
        assert_eq!(Mbr::load(&dev).unwrap(), snapshot);
    }

    #[test]
    fn fits_pick_different_gaps() {
        let scratch = ScratchDisk::new();
        let (dev, mut mbr) = disk(&scratch);
        mbr.create_partition(&dev, "a", 1000, PartKind::Primary, Fit::First).unwrap();
        mbr.create_partition(&dev, "b", 5000, PartKind::Primary, Fit::First).unwrap();
        mbr.create_partition(&dev, "c", 2000, PartKind::Primary, Fit::First).unwrap();
        mbr.delete_partition(&dev, "a").unwrap();
        mbr.delete_partition(&dev, "c").unwrap();
        // gaps: [153, 1153) of 1000 bytes and everything after b
        let best = mbr
            .create_partition(&dev, "best", 500, PartKind::Primary, Fit::Best)
            .unwrap();
        assert_eq!(best.start, 153);
        let worst = mbr
            .create_partition(&dev, "worst", 400, PartKind::Primary, Fit::Worst)
            .unwrap();
        assert_eq!(worst.start, 1153 + 5000);
        let first = mbr
            .create_partition(&dev, "first", 300, PartKind::Primary, Fit::First)
            .unwrap();
        assert_eq!(first.start, 653);
    }

    #[test]
    fn single_extended_and_logical_chain() {
        let scratch = ScratchDisk::new();
        let (dev, mut mbr) = disk(&scratch);
        assert!(matches!(
            mbr.create_partition(&dev, "l0", 100, PartKind::Logical, Fit::First),
            Err(FsError::PartitionNotFound(_))
        ));
        let ext = mbr
            .create_partition(&dev, "ext", 4000, PartKind::Extended, Fit::First)
            .unwrap();
        assert!(matches!(
            mbr.create_partition(&dev, "ext2", 100, PartKind::Extended, Fit::First),
            Err(FsError::AlreadyExists(_))
        ));
        let l1 = mbr
            .create_partition(&dev, "l1", 1000, PartKind::Logical, Fit::First)
            .unwrap();
        assert_eq!(l1.start, ext.start + 32);
        assert_eq!(l1.index, 5);
        let l2 = mbr
            .create_partition(&dev, "l2", 1000, PartKind::Logical, Fit::Best)
            .unwrap();
        assert_eq!(l2.start, ext.start + 32 + 1000 + 32);
        assert_eq!(l2.index, 6);
        assert!(matches!(
            mbr.create_partition(&dev, "l3", 3000, PartKind::Logical, Fit::First),
            Err(FsError::NoFreeSpace(_))
        ));
        assert!(matches!(
            mbr.create_partition(&dev, "l1", 10, PartKind::Logical, Fit::First),
            Err(FsError::AlreadyExists(_))
        ));
        let names: Vec<String> = mbr.logicals(&dev).unwrap().iter().map(Ebr::name).collect();
        assert_eq!(names, ["l1", "l2"]);
        assert_eq!(mbr.find(&dev, "l2").unwrap(), l2);

        mbr.delete_partition(&dev, "l1").unwrap();
        let names: Vec<String> = mbr.logicals(&dev).unwrap().iter().map(Ebr::name).collect();
        assert_eq!(names, ["l2"]);
    }

    #[test]
    fn mount_state_is_persisted() {
        let scratch = ScratchDisk::new();
        let (dev, mut mbr) = disk(&scratch);
        mbr.create_partition(&dev, "p", 1000, PartKind::Primary, Fit::First).unwrap();
        mbr.set_mounted(&dev, "p", 1, Some("501A")).unwrap();
        let back = Mbr::load(&dev).unwrap();
        assert_eq!(back.partitions[0].status, MOUNTED);
        assert_eq!(&back.partitions[0].id, b"501A");
        assert_eq!(back.partitions[0].correlative, 1);
        mbr.set_mounted(&dev, "p", 1, None).unwrap();
        assert_eq!(Mbr::load(&dev).unwrap().partitions[0].status, CREATED);
        assert!(mbr.set_mounted(&dev, "zz", 1, None).is_err());
    }
}
