//! The operation surface: disks, partitions, mounts, sessions and every
//! filesystem command, each returning a payload or an `FsError`.

use super::*;
use blk_dev::{DiskDevice, DiskFile};
use config::EngineConfig;
use fs::{FileSystem, FsType};
use journal::JournalEntry;
use mount::{MountRegistry, Mounted};
use partition::{Fit, Located, Mbr, PartKind, SizeUnit};
use path::FsPath;
use perm::{Perm, Session};
use tree::TreeNode;
use users::{UserDirectory, UserTable};

use std::path::Path;
use std::sync::Arc;

fn device(path: &Path) -> Result<Arc<dyn DiskDevice>> {
    let dev = DiskFile::open(path)
        .map_err(|_| FsError::NotFound(format!("disk {}", path.display())))?;
    Ok(Arc::new(dev))
}

pub struct Engine {
    config: EngineConfig,
    mounts: MountRegistry,
    session: Option<Session>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            mounts: MountRegistry::new(&config.id_prefix),
            config,
            session: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn mounted(&self) -> &[Mounted] {
        self.mounts.list()
    }

    pub fn mkdisk(&mut self, path: &Path, size: u64, unit: SizeUnit, fit: Fit) -> Result<()> {
        partition::mkdisk(path, unit.bytes(size), fit)?;
        Ok(())
    }

    pub fn rmdisk(&mut self, path: &Path) -> Result<()> {
        partition::rmdisk(path)?;
        for m in self.mounts.drop_disk(path) {
            if self.session.as_ref().map(|s| s.mount_id == m.id) == Some(true) {
                self.session = None;
            }
        }
        Ok(())
    }

    pub fn fdisk(
        &mut self,
        path: &Path,
        name: &str,
        size: u64,
        unit: SizeUnit,
        kind: PartKind,
        fit: Fit,
    ) -> Result<Located> {
        let dev = device(path)?;
        let mut mbr = Mbr::load(&*dev)?;
        mbr.create_partition(&*dev, name, unit.bytes(size), kind, fit)
    }

    pub fn fdisk_delete(&mut self, path: &Path, name: &str) -> Result<PartKind> {
        if self.mounts.is_mounted(path, name) {
            return Err(FsError::InvalidArgument(format!(
                "partition {} is mounted, unmount it first",
                name
            )));
        }
        let dev = device(path)?;
        let mut mbr = Mbr::load(&*dev)?;
        mbr.delete_partition(&*dev, name)
    }

    pub fn mount(&mut self, path: &Path, name: &str) -> Result<String> {
        let dev = device(path)?;
        let mut mbr = Mbr::load(&*dev)?;
        let at = mbr.find(&*dev, name)?;
        if at.kind == PartKind::Extended {
            return Err(FsError::InvalidArgument(format!(
                "extended partition {} cannot be mounted",
                name
            )));
        }
        if self.mounts.is_mounted(path, name) {
            return Err(FsError::AlreadyExists(format!("mount of {}", name)));
        }
        let id = self.mounts.next_id(path, at.index)?;
        mbr.set_mounted(&*dev, name, at.index, Some(&id))?;
        self.mounts.insert(Mounted {
            id: id.clone(),
            disk: path.to_path_buf(),
            name: at.name,
            kind: at.kind,
            index: at.index,
            start: at.start,
            size: at.size,
        })?;
        Ok(id)
    }

    pub fn unmount(&mut self, id: &str) -> Result<()> {
        let m = self.mounts.remove(id)?;
        if self.session.as_ref().map(|s| s.mount_id == id) == Some(true) {
            log::info!("session on {} closed by unmount", id);
            self.session = None;
        }
        let dev = device(&m.disk)?;
        let mut mbr = Mbr::load(&*dev)?;
        mbr.set_mounted(&*dev, &m.name, m.index, None)
    }

    fn open(&self, id: &str) -> Result<FileSystem> {
        let m = self.mounts.get(id)?;
        let fs = FileSystem::open(device(&m.disk)?, m.start, m.size)?;
        Ok(fs.with_default_perm(self.config.default_perm))
    }

    fn users_text(&self) -> String {
        UserTable::initial(&self.config.root_password).to_string()
    }

    pub fn mkfs(&mut self, id: &str, fs_type: FsType) -> Result<()> {
        let m = self.mounts.get(id)?;
        FileSystem::format(device(&m.disk)?, m.start, m.size, fs_type, &self.users_text())?;
        Ok(())
    }

    pub fn login(&mut self, user: &str, password: &str, id: &str) -> Result<()> {
        if let Some(s) = &self.session {
            return Err(FsError::SessionActive(s.user.clone()));
        }
        let mut fs = self.open(id)?;
        let (uid, gid) = UserDirectory::new(&mut fs).login(user, password)?;
        log::info!("{} logged in on {}", user, id);
        self.session = Some(Session {
            user: user.to_string(),
            uid,
            gid,
            mount_id: id.to_string(),
        });
        Ok(())
    }

    pub fn logout(&mut self) -> Result<String> {
        let s = self.session.take().ok_or(FsError::NoSession)?;
        log::info!("{} logged out", s.user);
        Ok(s.user)
    }

    /// Session and filesystem of the logged-in user.
    fn active(&self) -> Result<(Session, FileSystem)> {
        let s = self.session.clone().ok_or(FsError::NoSession)?;
        let fs = self.open(&s.mount_id)?;
        Ok((s, fs))
    }

    pub fn mkdir(&mut self, path: &FsPath, parents: bool) -> Result<()> {
        let (who, mut fs) = self.active()?;
        fs.mkdir(&who, path, parents)
    }

    pub fn mkfile(
        &mut self,
        path: &FsPath,
        parents: bool,
        size: Option<usize>,
        content: Option<&str>,
    ) -> Result<()> {
        let (who, mut fs) = self.active()?;
        fs.mkfile(&who, path, parents, size, content)
    }

    /// Contents of each file, joined by newlines.
    pub fn cat(&self, paths: &[FsPath]) -> Result<String> {
        let (who, fs) = self.active()?;
        let mut out = Vec::with_capacity(paths.len());
        for p in paths {
            out.push(fs.cat(&who, p)?);
        }
        Ok(out.join("\n"))
    }

    pub fn edit(&mut self, path: &FsPath, content: &str) -> Result<()> {
        let (who, mut fs) = self.active()?;
        fs.edit(&who, path, content)
    }

    pub fn remove(&mut self, path: &FsPath) -> Result<()> {
        let (who, mut fs) = self.active()?;
        fs.remove(&who, path)
    }

    pub fn rename(&mut self, path: &FsPath, name: &str) -> Result<()> {
        let (who, mut fs) = self.active()?;
        fs.rename(&who, path, name)
    }

    pub fn copy(&mut self, src: &FsPath, dest: &FsPath) -> Result<()> {
        let (who, mut fs) = self.active()?;
        fs.copy(&who, src, dest)
    }

    pub fn find(&self, start: &FsPath, pattern: &str) -> Result<Vec<String>> {
        let (who, fs) = self.active()?;
        fs.find(&who, start, pattern)
    }

    pub fn chown(&mut self, path: &FsPath, recursive: bool, user: &str) -> Result<()> {
        let (who, mut fs) = self.active()?;
        let (uid, gid) = UserDirectory::new(&mut fs).owner(user)?;
        fs.chown(&who, path, recursive, user, uid, gid)
    }

    pub fn chmod(&mut self, path: &FsPath, recursive: bool, perm: Perm) -> Result<()> {
        let (who, mut fs) = self.active()?;
        fs.chmod(&who, path, recursive, perm)
    }

    // Group and user administration. Callers restrict these to a root session.

    pub fn mkgrp(&mut self, name: &str) -> Result<i32> {
        let (_, mut fs) = self.active()?;
        UserDirectory::new(&mut fs).mkgrp(name)
    }

    pub fn rmgrp(&mut self, name: &str) -> Result<()> {
        let (_, mut fs) = self.active()?;
        UserDirectory::new(&mut fs).rmgrp(name)
    }

    pub fn mkusr(&mut self, name: &str, password: &str, group: &str) -> Result<i32> {
        let (_, mut fs) = self.active()?;
        UserDirectory::new(&mut fs).mkusr(name, password, group)
    }

    pub fn rmusr(&mut self, name: &str) -> Result<()> {
        let (_, mut fs) = self.active()?;
        UserDirectory::new(&mut fs).rmusr(name)
    }

    pub fn chgrp(&mut self, name: &str, group: &str) -> Result<()> {
        let (_, mut fs) = self.active()?;
        UserDirectory::new(&mut fs).chgrp(name, group)
    }

    pub fn journaling(&self, id: &str) -> Result<Vec<JournalEntry>> {
        self.open(id)?.journal_entries()
    }

    pub fn loss(&mut self, id: &str) -> Result<()> {
        self.open(id)?.loss()
    }

    pub fn recovery(&mut self, id: &str) -> Result<()> {
        let m = self.mounts.get(id)?;
        journal::recover(device(&m.disk)?, m.start, m.size, id, &self.users_text())?;
        Ok(())
    }

    pub fn tree(&self, id: &str) -> Result<TreeNode> {
        self.open(id)?.tree()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScratchDisk;
    use error::CredentialError;

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    /// 1 MiB disk with one 200 KiB primary mounted, formatted, root logged in.
    fn ready(scratch: &ScratchDisk, fs_type: FsType) -> (Engine, String) {
        let mut e = Engine::new(EngineConfig::default()).unwrap();
        e.mkdisk(scratch.path(), 1, SizeUnit::Mega, Fit::First).unwrap();
        e.fdisk(scratch.path(), "part1", 200, SizeUnit::Kilo, PartKind::Primary, Fit::First)
            .unwrap();
        let id = e.mount(scratch.path(), "part1").unwrap();
        e.mkfs(&id, fs_type).unwrap();
        e.login("root", "123", &id).unwrap();
        (e, id)
    }

    #[test]
    fn mount_ids_and_double_unmount() {
        let scratch = ScratchDisk::new();
        let (mut e, id) = ready(&scratch, FsType::Ext2);
        assert_eq!(id, "501A");
        assert!(matches!(
            e.mount(scratch.path(), "part1"),
            Err(FsError::AlreadyExists(_))
        ));
        e.unmount(&id).unwrap();
        assert!(e.session().is_none());
        assert!(matches!(e.unmount(&id), Err(FsError::NotMounted(_))));
        assert!(e.mounted().is_empty());
    }

    #[test]
    fn sessions() {
        let scratch = ScratchDisk::new();
        let (mut e, id) = ready(&scratch, FsType::Ext2);
        assert!(matches!(
            e.login("root", "123", &id),
            Err(FsError::SessionActive(_))
        ));
        e.mkgrp("devs").unwrap();
        e.mkusr("ana", "pw", "devs").unwrap();
        e.logout().unwrap();
        assert!(matches!(e.logout(), Err(FsError::NoSession)));
        assert!(matches!(e.mkdir(&p("/x"), false), Err(FsError::NoSession)));
        assert!(matches!(
            e.login("ana", "bad", &id),
            Err(FsError::InvalidCredentials(CredentialError::WrongPassword))
        ));
        e.login("ana", "pw", &id).unwrap();
        assert_eq!(e.session().unwrap().gid, 2);
        e.logout().unwrap();

        e.login("root", "123", &id).unwrap();
        e.rmusr("ana").unwrap();
        e.logout().unwrap();
        assert!(matches!(
            e.login("ana", "pw", &id),
            Err(FsError::InvalidCredentials(CredentialError::UnknownUser))
        ));
    }

    #[test]
    fn mkdir_then_find() {
        let scratch = ScratchDisk::new();
        let (mut e, _) = ready(&scratch, FsType::Ext2);
        e.mkdir(&p("/a/b/c"), true).unwrap();
        assert_eq!(e.find(&p("/a"), "c").unwrap(), ["/a/b/c"]);
        e.mkfile(&p("/a/x.txt"), false, Some(4), None).unwrap();
        e.mkfile(&p("/a/y.txt"), false, None, Some("yy")).unwrap();
        assert_eq!(e.cat(&[p("/a/x.txt"), p("/a/y.txt")]).unwrap(), "0123\nyy");
        assert_eq!(e.find(&p("/"), "*.txt").unwrap(), ["/users.txt", "/a/x.txt", "/a/y.txt"]);
    }

    #[test]
    fn chown_uses_users_table() {
        let scratch = ScratchDisk::new();
        let (mut e, id) = ready(&scratch, FsType::Ext2);
        e.mkgrp("devs").unwrap();
        e.mkusr("ana", "pw", "devs").unwrap();
        e.mkfile(&p("/f"), false, None, Some("x")).unwrap();
        e.chown(&p("/f"), false, "ana").unwrap();
        assert!(matches!(e.chown(&p("/f"), false, "ghost"), Err(FsError::NotFound(_))));
        let tree = e.tree(&id).unwrap();
        let f = tree.children.iter().find(|c| c.name == "f").unwrap();
        assert_eq!((f.uid, f.gid), (2, 2));
    }

    #[test]
    fn loss_and_recovery_scenario() {
        let scratch = ScratchDisk::new();
        let (mut e, id) = ready(&scratch, FsType::Ext3);
        e.mkfile(&p("/x.txt"), false, Some(10), None).unwrap();
        assert_eq!(e.journaling(&id).unwrap().len(), 1);
        e.loss(&id).unwrap();
        assert!(matches!(e.cat(&[p("/x.txt")]), Err(FsError::NotFormatted(_))));
        e.recovery(&id).unwrap();
        assert_eq!(e.cat(&[p("/x.txt")]).unwrap(), "0123456789");
        let entries = e.journaling(&id).unwrap();
        assert_eq!(entries[0].operation, "mkfilesize");
        assert_eq!(entries[0].path, "/x.txt");
    }

    #[test]
    fn journaling_needs_ext3() {
        let scratch = ScratchDisk::new();
        let (mut e, id) = ready(&scratch, FsType::Ext2);
        assert!(matches!(
            e.journaling(&id),
            Err(FsError::UnsupportedFilesystemType(_))
        ));
        assert!(matches!(
            e.recovery(&id),
            Err(FsError::UnsupportedFilesystemType(_))
        ));
    }

    #[test]
    fn logical_partitions_mount() {
        let scratch = ScratchDisk::new();
        let mut e = Engine::new(EngineConfig::default()).unwrap();
        e.mkdisk(scratch.path(), 1, SizeUnit::Mega, Fit::Worst).unwrap();
        e.fdisk(scratch.path(), "ext", 600, SizeUnit::Kilo, PartKind::Extended, Fit::First)
            .unwrap();
        e.fdisk(scratch.path(), "log1", 100, SizeUnit::Kilo, PartKind::Logical, Fit::First)
            .unwrap();
        e.fdisk(scratch.path(), "log2", 100, SizeUnit::Kilo, PartKind::Logical, Fit::First)
            .unwrap();
        assert!(e.mount(scratch.path(), "ext").is_err());
        let id = e.mount(scratch.path(), "log2").unwrap();
        assert_eq!(id, "506A");
        e.mkfs(&id, FsType::Ext2).unwrap();
        e.login("root", "123", &id).unwrap();
        e.mkfile(&p("/in-logical"), false, None, Some("ok")).unwrap();
        assert_eq!(e.cat(&[p("/in-logical")]).unwrap(), "ok");
        assert!(matches!(
            e.fdisk_delete(scratch.path(), "log2"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rmdisk_drops_mounts() {
        let scratch = ScratchDisk::new();
        let (mut e, id) = ready(&scratch, FsType::Ext2);
        e.rmdisk(scratch.path()).unwrap();
        assert!(e.session().is_none());
        assert!(matches!(e.tree(&id), Err(FsError::NotMounted(_))));
        assert!(matches!(e.rmdisk(scratch.path()), Err(FsError::NotFound(_))));
    }
}
