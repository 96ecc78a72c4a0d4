//! Mounted partitions, owned by the engine rather than kept in process globals.

use super::*;
use common::*;
use partition::PartKind;

use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mounted {
    pub id: String,
    pub disk: PathBuf,
    pub name: String,
    pub kind: PartKind,
    pub index: usize,
    /// first byte of the filesystem
    pub start: u64,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct MountRegistry {
    prefix: String,
    /// letter handed to each disk path, in order of first mount
    letters: Vec<(PathBuf, u8)>,
    mounted: Vec<Mounted>,
}

impl MountRegistry {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..Self::default()
        }
    }

    fn letter_for(&mut self, disk: &Path) -> Result<u8> {
        if let Some((_, l)) = self.letters.iter().find(|(p, _)| p == disk) {
            return Ok(*l);
        }
        let l = *MOUNT_LETTERS
            .get(self.letters.len())
            .ok_or_else(|| FsError::MountLettersExhausted(disk.display().to_string()))?;
        self.letters.push((disk.to_path_buf(), l));
        Ok(l)
    }

    /// `<prefix><index><letter>`, e.g. `501A`.
    pub fn next_id(&mut self, disk: &Path, index: usize) -> Result<String> {
        let letter = self.letter_for(disk)?;
        Ok(format!("{}{}{}", self.prefix, index, letter as char))
    }

    pub fn insert(&mut self, m: Mounted) -> Result<()> {
        if self.mounted.iter().any(|x| x.id == m.id) {
            return Err(FsError::AlreadyExists(format!("mount {}", m.id)));
        }
        log::info!("mounted {} from {} as {}", m.name, m.disk.display(), m.id);
        self.mounted.push(m);
        Ok(())
    }

    pub fn is_mounted(&self, disk: &Path, name: &str) -> bool {
        self.mounted.iter().any(|m| m.disk == disk && m.name == name)
    }

    pub fn get(&self, id: &str) -> Result<&Mounted> {
        self.mounted
            .iter()
            .find(|m| m.id == id)
            .ok_or_else(|| FsError::NotMounted(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> Result<Mounted> {
        let pos = self
            .mounted
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| FsError::NotMounted(id.to_string()))?;
        let m = self.mounted.remove(pos);
        log::info!("unmounted {}", id);
        Ok(m)
    }

    /// Forget every mount of a deleted disk.
    pub fn drop_disk(&mut self, disk: &Path) -> Vec<Mounted> {
        let (gone, kept): (Vec<Mounted>, Vec<Mounted>) = self.mounted.drain(..).partition(|m| m.disk == disk);
        self.mounted = kept;
        gone
    }

    pub fn list(&self) -> &[Mounted] {
        &self.mounted
    }
}
