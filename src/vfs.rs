//! Tree operations over a mounted filesystem, acting as a session user.
//! Every successful mutation is journaled on ext3.

use super::*;
use common::*;
use disk::{FileKind, Inode};
use fs::FileSystem;
use journal::{JournalOp, OwnerRecord, PermRecord};
use path::FsPath;
use perm::{Access, Perm, Session};

use std::collections::{HashSet, VecDeque};

/// `*` matches any run of characters, `?` exactly one.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

impl FileSystem {
    pub fn inode_at(&self, path: &FsPath) -> Result<Inode> {
        self.read_inode(self.resolve(path)?)
    }

    /// Directory that will hold `path`, creating missing ancestors when `parents`.
    fn ensure_parent(&mut self, who: &Session, path: &FsPath, parents: bool) -> Result<i32> {
        let mut cur = ROOT_INO;
        for (i, part) in path.parents().iter().enumerate() {
            let inode = self.read_inode(cur)?;
            if !inode.is_dir() {
                return Err(FsError::NotADirectory(path.prefix(i).to_string()));
            }
            let here = path.prefix(i + 1);
            cur = match self.lookup(&inode, part, false)? {
                Some(child) => child,
                None if parents => {
                    who.require(&inode, Access::Write, &path.prefix(i).to_string())?;
                    let child = self.create_child(
                        cur,
                        part,
                        FileKind::Directory,
                        who.uid,
                        who.gid,
                        self.default_perm,
                    )?;
                    self.journal(JournalOp::Mkdir, &here.to_string(), "")?;
                    child
                }
                None => return Err(FsError::PathSegmentMissing(here.to_string())),
            };
        }
        let inode = self.read_inode(cur)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(path.parent().to_string()));
        }
        Ok(cur)
    }

    /// Link a new entry for `path` under its parent, after the existence and
    /// permission checks shared by mkdir and mkfile.
    fn create_at(&mut self, who: &Session, path: &FsPath, parents: bool, kind: FileKind) -> Result<i32> {
        let name = path
            .name()
            .ok_or_else(|| FsError::AlreadyExists("/".to_string()))?;
        let parent = self.ensure_parent(who, path, parents)?;
        let dir = self.read_inode(parent)?;
        if self.lookup(&dir, name, true)?.is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        who.require(&dir, Access::Write, &path.parent().to_string())?;
        self.create_child(parent, name, kind, who.uid, who.gid, self.default_perm)
    }

    pub fn mkdir(&mut self, who: &Session, path: &FsPath, parents: bool) -> Result<()> {
        self.check_journal(path, "")?;
        self.create_at(who, path, parents, FileKind::Directory)?;
        self.journal(JournalOp::Mkdir, &path.to_string(), "")?;
        log::info!("mkdir {}", path);
        Ok(())
    }

    /// Explicit `content` wins; otherwise `size` bytes of `0123456789...`.
    pub fn mkfile(
        &mut self,
        who: &Session,
        path: &FsPath,
        parents: bool,
        size: Option<usize>,
        content: Option<&str>,
    ) -> Result<()> {
        let (data, op, logged) = match (content, size) {
            (Some(text), _) => (text.to_string(), JournalOp::Mkfile, text.to_string()),
            (None, Some(n)) => (digit_content(n), JournalOp::MkfileSize, n.to_string()),
            (None, None) => (String::new(), JournalOp::Mkfile, String::new()),
        };
        self.check_journal(path, &logged)?;
        let ino = self.create_at(who, path, parents, FileKind::File)?;
        let mut inode = self.read_inode(ino)?;
        self.write_content(ino, &mut inode, data.as_bytes())?;
        self.journal(op, &path.to_string(), &logged)?;
        log::info!("mkfile {} ({} bytes)", path, data.len());
        Ok(())
    }

    pub fn cat(&self, who: &Session, path: &FsPath) -> Result<String> {
        let (_, inode) = self.resolve_file(path)?;
        who.require(&inode, Access::Read, &path.to_string())?;
        let data = self.read_content(&inode)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub fn edit(&mut self, who: &Session, path: &FsPath, content: &str) -> Result<()> {
        let (ino, mut inode) = self.resolve_file(path)?;
        who.require(&inode, Access::Write, &path.to_string())?;
        self.check_journal(path, content)?;
        self.write_content(ino, &mut inode, content.as_bytes())?;
        self.journal(JournalOp::Edit, &path.to_string(), content)?;
        log::info!("edit {} ({} bytes)", path, content.len());
        Ok(())
    }

    /// Inodes of the subtree rooted at `ino`, parents before children.
    fn subtree(&self, ino: i32) -> Result<Vec<(i32, Inode)>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![ino];
        while let Some(cur) = stack.pop() {
            if !seen.insert(cur) {
                continue;
            }
            let inode = self.read_inode(cur)?;
            if inode.is_dir() {
                stack.extend(self.entries(&inode)?.into_iter().map(|e| e.ino));
            }
            out.push((cur, inode));
        }
        Ok(out)
    }

    /// Unlink `path` and reclaim the blocks and inodes of everything below it.
    pub fn remove(&mut self, who: &Session, path: &FsPath) -> Result<()> {
        let name = path
            .name()
            .ok_or_else(|| FsError::InvalidArgument("cannot remove /".to_string()))?;
        let (parent, dir) = self.resolve_dir(&path.parent())?;
        let ino = self
            .lookup(&dir, name, true)?
            .ok_or_else(|| FsError::PathSegmentMissing(path.to_string()))?;
        if ino == USERS_INO {
            return Err(FsError::PermissionDenied(format!("{} is protected", path)));
        }
        who.require(&dir, Access::Write, &path.parent().to_string())?;
        self.check_journal(path, "")?;
        let doomed = self.subtree(ino)?;
        for (_, inode) in &doomed {
            who.require(inode, Access::Write, &path.to_string())?;
        }

        self.remove_entry(parent, name)?;
        for (i, mut inode) in doomed {
            self.release_blocks(&mut inode)?;
            self.free_inode(i)?;
        }
        self.journal(JournalOp::Remove, &path.to_string(), "")?;
        log::info!("remove {}", path);
        Ok(())
    }

    pub fn rename(&mut self, who: &Session, path: &FsPath, new_name: &str) -> Result<()> {
        path::check_name(new_name)?;
        let name = path
            .name()
            .ok_or_else(|| FsError::InvalidArgument("cannot rename /".to_string()))?;
        let (parent, dir) = self.resolve_dir(&path.parent())?;
        let ino = self
            .lookup(&dir, name, true)?
            .ok_or_else(|| FsError::PathSegmentMissing(path.to_string()))?;
        if ino == USERS_INO {
            return Err(FsError::PermissionDenied(format!("{} is protected", path)));
        }
        who.require(&dir, Access::Write, &path.parent().to_string())?;
        self.check_journal(path, new_name)?;
        self.rename_entry(parent, name, new_name)?;
        self.journal(JournalOp::Rename, &path.to_string(), new_name)?;
        log::info!("rename {} -> {}", path, new_name);
        Ok(())
    }

    /// Deep copy of `src` into the existing directory `dest`.
    pub fn copy(&mut self, who: &Session, src: &FsPath, dest: &FsPath) -> Result<()> {
        let name = src
            .name()
            .ok_or_else(|| FsError::InvalidArgument("cannot copy /".to_string()))?
            .to_string();
        let src_ino = self.resolve(src)?;
        let (dest_ino, dest_dir) = self.resolve_dir(dest)?;
        if self.lookup(&dest_dir, &name, true)?.is_some() {
            return Err(FsError::AlreadyExists(dest.join(&name)?.to_string()));
        }
        let mut walk = vec![ROOT_INO];
        for prefix in dest.prefixes() {
            walk.push(self.resolve(&prefix)?);
        }
        if walk.contains(&src_ino) {
            return Err(FsError::InvalidArgument(format!(
                "cannot copy {} into itself",
                src
            )));
        }
        who.require(&dest_dir, Access::Write, &dest.to_string())?;
        let logged = dest.to_string();
        self.check_journal(src, &logged)?;
        for (_, inode) in self.subtree(src_ino)? {
            who.require(&inode, Access::Read, &src.to_string())?;
        }

        let mut stack = vec![(src_ino, dest_ino, name)];
        let mut copied = 0;
        while let Some((from, into, name)) = stack.pop() {
            let inode = self.read_inode(from)?;
            let kind = inode.kind().ok_or_else(|| FsError::Malformed {
                entity: "inode",
                offset: 0,
                reason: format!("inode {} has kind {}", from, inode.kind),
            })?;
            let to = self.create_child(into, &name, kind, who.uid, who.gid, inode.perm())?;
            match kind {
                FileKind::File => {
                    let data = self.read_content(&inode)?;
                    let mut fresh = self.read_inode(to)?;
                    self.write_content(to, &mut fresh, &data)?;
                }
                FileKind::Directory => {
                    for e in self.entries(&inode)? {
                        stack.push((e.ino, to, e.name));
                    }
                }
            }
            copied += 1;
        }
        self.journal(JournalOp::Copy, &src.to_string(), &logged)?;
        log::info!("copy {} -> {} ({} entries)", src, dest, copied);
        Ok(())
    }

    /// Full paths under `start` whose final name matches `pattern`, breadth first.
    pub fn find(&self, who: &Session, start: &FsPath, pattern: &str) -> Result<Vec<String>> {
        let (ino, dir) = self.resolve_dir(start)?;
        who.require(&dir, Access::Read, &start.to_string())?;
        let mut found = Vec::new();
        let mut seen = HashSet::from([ino]);
        let mut queue = VecDeque::from([(dir, start.clone())]);
        while let Some((dir, at)) = queue.pop_front() {
            for e in self.entries(&dir)? {
                let child = at.join(&e.name)?;
                if glob_match(pattern, &e.name) {
                    found.push(child.to_string());
                }
                if seen.insert(e.ino) {
                    let inode = self.read_inode(e.ino)?;
                    if inode.is_dir() {
                        queue.push_back((inode, child));
                    }
                }
            }
        }
        Ok(found)
    }

    /// `path` alone, or every prefix of it ending with `path` when `recursive`.
    /// All targets must exist before anything changes.
    fn targets(&self, path: &FsPath, recursive: bool) -> Result<Vec<(FsPath, i32, Inode)>> {
        let paths: Vec<FsPath> = if recursive {
            path.prefixes().collect()
        } else {
            vec![path.clone()]
        };
        let mut out = Vec::with_capacity(paths.len());
        for p in paths {
            let ino = self.resolve(&p)?;
            let inode = self.read_inode(ino)?;
            out.push((p, ino, inode));
        }
        Ok(out)
    }

    pub fn chmod(&mut self, who: &Session, path: &FsPath, recursive: bool, perm: Perm) -> Result<()> {
        let logged = PermRecord { perm, recursive }.to_string();
        self.check_journal(path, &logged)?;
        let targets = self.targets(path, recursive)?;
        for (p, _, inode) in &targets {
            who.require_owner(inode, &p.to_string())?;
        }
        for (_, ino, mut inode) in targets {
            inode.perm = perm.to_bytes();
            self.write_inode(ino, &inode)?;
        }
        self.journal(JournalOp::Chmod, &path.to_string(), &logged)?;
        log::info!("chmod {} {}", path, perm);
        Ok(())
    }

    pub fn chown(
        &mut self,
        who: &Session,
        path: &FsPath,
        recursive: bool,
        owner: &str,
        uid: i32,
        gid: i32,
    ) -> Result<()> {
        let logged = OwnerRecord {
            owner: owner.to_string(),
            uid,
            gid,
            recursive,
        }
        .to_string();
        self.check_journal(path, &logged)?;
        let targets = self.targets(path, recursive)?;
        for (p, _, inode) in &targets {
            who.require_owner(inode, &p.to_string())?;
        }
        for (_, ino, mut inode) in targets {
            inode.uid = uid;
            inode.gid = gid;
            self.write_inode(ino, &inode)?;
        }
        self.journal(JournalOp::Chown, &path.to_string(), &logged)?;
        log::info!("chown {} {}", path, owner);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScratchDisk;
    use blk_dev::DiskFile;
    use fs::FsType;
    use std::sync::Arc;

    const SIZE: u64 = 256 * 1024;

    fn mkfs(scratch: &ScratchDisk) -> FileSystem {
        let dev = Arc::new(DiskFile::create(scratch.path(), SIZE).unwrap());
        FileSystem::format(dev, 0, SIZE, FsType::Ext2, "1,G,root\n1,U,root,root,123\n").unwrap()
    }

    fn session(user: &str, uid: i32, gid: i32) -> Session {
        Session {
            user: user.to_string(),
            uid,
            gid,
            mount_id: "501A".to_string(),
        }
    }

    fn root() -> Session {
        session("root", 1, 1)
    }

    fn p(s: &str) -> FsPath {
        FsPath::parse(s).unwrap()
    }

    #[test]
    fn glob() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*.txt", "a.txt"));
        assert!(!glob_match("*.txt", "a.txt.bak"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("c", "c"));
        assert!(glob_match("*b*", "abc"));
    }

    #[test]
    fn mkdir_requires_parents_unless_p() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        assert!(matches!(
            fs.mkdir(&root(), &p("/a/b/c"), false),
            Err(FsError::PathSegmentMissing(s)) if s == "/a"
        ));
        assert_eq!(fs.super_block().inodes_count, 2);
        fs.mkdir(&root(), &p("/a/b/c"), true).unwrap();
        for each in ["/a", "/a/b", "/a/b/c"] {
            assert!(fs.inode_at(&p(each)).unwrap().is_dir());
        }
        assert!(matches!(
            fs.mkdir(&root(), &p("/a/b"), false),
            Err(FsError::AlreadyExists(_))
        ));
        assert_eq!(
            fs.find(&root(), &p("/a"), "c").unwrap(),
            vec!["/a/b/c".to_string()]
        );
    }

    #[test]
    fn mkfile_content_and_cat() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        fs.mkfile(&root(), &p("/n.txt"), false, Some(12), None).unwrap();
        fs.mkfile(&root(), &p("/d/t.txt"), true, Some(3), Some("hello"))
            .unwrap();
        assert_eq!(fs.cat(&root(), &p("/n.txt")).unwrap(), "012345678901");
        assert_eq!(fs.cat(&root(), &p("/d/t.txt")).unwrap(), "hello");
        assert!(matches!(
            fs.cat(&root(), &p("/d")),
            Err(FsError::NotAFile(_))
        ));
        let inode = fs.inode_at(&p("/n.txt")).unwrap();
        assert_eq!(&inode.perm, b"664");
        assert_eq!((inode.uid, inode.gid), (1, 1));
    }

    #[test]
    fn edit_grows_and_shrinks() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        fs.mkfile(&root(), &p("/f"), false, Some(10), None).unwrap();
        let long = "x".repeat(BLOCK_SZ * 14 + 3);
        fs.edit(&root(), &p("/f"), &long).unwrap();
        assert_eq!(fs.cat(&root(), &p("/f")).unwrap(), long);
        fs.edit(&root(), &p("/f"), "tiny").unwrap();
        assert_eq!(fs.cat(&root(), &p("/f")).unwrap(), "tiny");
        assert_eq!(fs.inode_at(&p("/f")).unwrap().block[12], NONE);
    }

    #[test]
    fn remove_reclaims_subtree() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        let (inodes, blocks) = (fs.super_block().inodes_count, fs.super_block().blocks_count);
        fs.mkdir(&root(), &p("/a/b"), true).unwrap();
        fs.mkfile(&root(), &p("/a/b/f"), false, Some(200), None).unwrap();
        fs.remove(&root(), &p("/a")).unwrap();
        let sb = fs.super_block();
        assert_eq!(sb.inodes_count, inodes);
        assert_eq!(sb.blocks_count, blocks);
        assert_eq!(sb.inodes_count + sb.free_inodes_count, sb.inode_capacity());
        assert!(fs.resolve(&p("/a")).is_err());
        assert!(matches!(
            fs.remove(&root(), &p("/users.txt")),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(fs.remove(&root(), &p("/")).is_err());
    }

    #[test]
    fn rename_keeps_inode() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        fs.mkfile(&root(), &p("/a.txt"), false, None, Some("x")).unwrap();
        let before = fs.resolve(&p("/a.txt")).unwrap();
        fs.rename(&root(), &p("/a.txt"), "b.txt").unwrap();
        assert_eq!(fs.resolve(&p("/b.txt")).unwrap(), before);
        assert!(fs.rename(&root(), &p("/b.txt"), "way-too-long-name").is_err());
    }

    #[test]
    fn copy_is_deep() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        fs.mkfile(&root(), &p("/src/in/f"), true, None, Some("data")).unwrap();
        fs.mkdir(&root(), &p("/dst"), false).unwrap();
        fs.copy(&root(), &p("/src"), &p("/dst")).unwrap();
        assert_eq!(fs.cat(&root(), &p("/dst/src/in/f")).unwrap(), "data");
        assert_ne!(
            fs.resolve(&p("/dst/src/in/f")).unwrap(),
            fs.resolve(&p("/src/in/f")).unwrap()
        );
        assert!(matches!(
            fs.copy(&root(), &p("/src"), &p("/dst")),
            Err(FsError::AlreadyExists(_))
        ));
        assert!(matches!(
            fs.copy(&root(), &p("/src"), &p("/src/in")),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.copy(&root(), &p("/src"), &p("/src/in/f")),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn chmod_recursive_touches_prefixes() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        fs.mkfile(&root(), &p("/a/b/c.txt"), true, None, Some("c")).unwrap();
        fs.chmod(&root(), &p("/a/b/c.txt"), true, Perm::parse("700").unwrap())
            .unwrap();
        for each in ["/a", "/a/b", "/a/b/c.txt"] {
            assert_eq!(&fs.inode_at(&p(each)).unwrap().perm, b"700");
        }
        assert_eq!(&fs.inode_at(&p("/")).unwrap().perm, b"777");
    }

    #[test]
    fn chmod_recursive_missing_prefix_changes_nothing() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        fs.mkdir(&root(), &p("/a"), false).unwrap();
        assert!(matches!(
            fs.chmod(&root(), &p("/a/b/c.txt"), true, Perm::parse("700").unwrap()),
            Err(FsError::PathSegmentMissing(s)) if s == "/a/b"
        ));
        assert_eq!(&fs.inode_at(&p("/a")).unwrap().perm, b"664");
    }

    #[test]
    fn permissions_for_plain_users() {
        let scratch = ScratchDisk::new();
        let mut fs = mkfs(&scratch);
        let ana = session("ana", 2, 2);
        let eve = session("eve", 3, 3);
        fs.mkdir(&root(), &p("/pub"), false).unwrap();
        fs.chmod(&root(), &p("/pub"), false, Perm::parse("777").unwrap()).unwrap();
        fs.mkfile(&ana, &p("/pub/mine"), false, None, Some("secret")).unwrap();
        fs.chmod(&ana, &p("/pub/mine"), false, Perm::parse("600").unwrap()).unwrap();

        assert!(matches!(
            fs.cat(&eve, &p("/pub/mine")),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(fs.edit(&eve, &p("/pub/mine"), "x").is_err());
        assert!(fs.chmod(&eve, &p("/pub/mine"), false, Perm::DIR_ROOT).is_err());
        assert!(fs.mkdir(&eve, &p("/locked"), false).is_ok());
        fs.chmod(&root(), &p("/"), false, Perm::parse("755").unwrap()).unwrap();
        assert!(matches!(
            fs.mkdir(&eve, &p("/nope"), false),
            Err(FsError::PermissionDenied(_))
        ));
        assert_eq!(fs.cat(&ana, &p("/pub/mine")).unwrap(), "secret");
        fs.chown(&root(), &p("/pub/mine"), false, "eve", 3, 3).unwrap();
        assert_eq!(fs.cat(&eve, &p("/pub/mine")).unwrap(), "secret");
    }
}
