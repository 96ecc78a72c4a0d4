//! users.txt: one row per line, `<id>,G,<group>` or `<id>,U,<group>,<user>,<password>`.
//! Rows are never deleted; removal rewrites the id to `0` and such rows are
//! invisible to every lookup.

use super::*;
use common::*;
use error::CredentialError;
use fs::FileSystem;
use perm::ROOT_USER;

use std::fmt;

/// longest user, group or password accepted
pub const MAX_FIELD: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Row {
    Group {
        id: i32,
        name: String,
    },
    User {
        id: i32,
        group: String,
        name: String,
        password: String,
    },
}

impl Row {
    pub fn id(&self) -> i32 {
        match self {
            Row::Group { id, .. } | Row::User { id, .. } => *id,
        }
    }

    pub fn is_live(&self) -> bool {
        self.id() != 0
    }

    fn kill(&mut self) {
        match self {
            Row::Group { id, .. } | Row::User { id, .. } => *id = 0,
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Row::Group { id, name } => write!(f, "{},G,{}", id, name),
            Row::User {
                id,
                group,
                name,
                password,
            } => write!(f, "{},U,{},{},{}", id, group, name, password),
        }
    }
}

fn check_field(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_FIELD || value.contains([',', '\n', '\r']) {
        return Err(FsError::InvalidArgument(format!(
            "{} {:?} must be 1 to {} bytes without commas",
            what, value, MAX_FIELD
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserTable {
    rows: Vec<Row>,
}

impl UserTable {
    /// Table written by mkfs: the root group and the root user.
    pub fn initial(root_password: &str) -> Self {
        Self {
            rows: vec![
                Row::Group {
                    id: 1,
                    name: ROOT_USER.to_string(),
                },
                Row::User {
                    id: 1,
                    group: ROOT_USER.to_string(),
                    name: ROOT_USER.to_string(),
                    password: root_password.to_string(),
                },
            ],
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut rows = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let bad = || FsError::Malformed {
                entity: "users table",
                offset: 0,
                reason: format!("bad row {:?}", line),
            };
            let id = fields[0].parse::<i32>().map_err(|_| bad())?;
            let row = match (fields.get(1).copied(), fields.len()) {
                (Some("G"), 3) => Row::Group {
                    id,
                    name: fields[2].to_string(),
                },
                (Some("U"), 5) => Row::User {
                    id,
                    group: fields[2].to_string(),
                    name: fields[3].to_string(),
                    password: fields[4].to_string(),
                },
                _ => return Err(bad()),
            };
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    fn live_group(&self, wanted: &str) -> Option<i32> {
        self.rows.iter().find_map(|r| match r {
            Row::Group { id, name } if *id != 0 && name == wanted => Some(*id),
            _ => None,
        })
    }

    fn live_user_mut(&mut self, wanted: &str) -> Option<&mut Row> {
        self.rows
            .iter_mut()
            .find(|r| matches!(r, Row::User { id, name, .. } if *id != 0 && name == wanted))
    }

    fn next_id(&self, groups: bool) -> i32 {
        let n = self
            .rows
            .iter()
            .filter(|r| matches!(r, Row::Group { .. }) == groups)
            .count();
        n as i32 + 1
    }

    /// (uid, gid) of a live user; the group must be live too.
    pub fn owner(&self, user: &str) -> Result<(i32, i32)> {
        let (uid, group) = self
            .rows
            .iter()
            .find_map(|r| match r {
                Row::User {
                    id, group, name, ..
                } if *id != 0 && name == user => Some((*id, group)),
                _ => None,
            })
            .ok_or_else(|| FsError::NotFound(format!("user {}", user)))?;
        let gid = self
            .live_group(group)
            .ok_or_else(|| FsError::NotFound(format!("group {}", group)))?;
        Ok((uid, gid))
    }

    pub fn login(&self, user: &str, password: &str) -> Result<(i32, i32)> {
        let row = self
            .rows
            .iter()
            .find(|r| matches!(r, Row::User { id, name, .. } if *id != 0 && name == user))
            .ok_or(FsError::InvalidCredentials(CredentialError::UnknownUser))?;
        if let Row::User { password: p, .. } = row {
            if p != password {
                return Err(FsError::InvalidCredentials(CredentialError::WrongPassword));
            }
        }
        self.owner(user).map_err(|e| match e {
            FsError::NotFound(_) => FsError::InvalidCredentials(CredentialError::GroupRemoved),
            other => other,
        })
    }

    pub fn add_group(&mut self, name: &str) -> Result<i32> {
        check_field("group", name)?;
        if self.live_group(name).is_some() {
            return Err(FsError::AlreadyExists(format!("group {}", name)));
        }
        let id = self.next_id(true);
        self.rows.push(Row::Group {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    pub fn remove_group(&mut self, name: &str) -> Result<()> {
        if name == ROOT_USER {
            return Err(FsError::PermissionDenied("the root group cannot be removed".to_string()));
        }
        let row = self
            .rows
            .iter_mut()
            .find(|r| matches!(r, Row::Group { id, name: n } if *id != 0 && n == name))
            .ok_or_else(|| FsError::NotFound(format!("group {}", name)))?;
        row.kill();
        Ok(())
    }

    pub fn add_user(&mut self, name: &str, password: &str, group: &str) -> Result<i32> {
        check_field("user", name)?;
        check_field("password", password)?;
        check_field("group", group)?;
        if self.live_group(group).is_none() {
            return Err(FsError::NotFound(format!("group {}", group)));
        }
        if self.live_user_mut(name).is_some() {
            return Err(FsError::AlreadyExists(format!("user {}", name)));
        }
        let id = self.next_id(false);
        self.rows.push(Row::User {
            id,
            group: group.to_string(),
            name: name.to_string(),
            password: password.to_string(),
        });
        Ok(id)
    }

    pub fn remove_user(&mut self, name: &str) -> Result<()> {
        if name == ROOT_USER {
            return Err(FsError::PermissionDenied("the root user cannot be removed".to_string()));
        }
        self.live_user_mut(name)
            .ok_or_else(|| FsError::NotFound(format!("user {}", name)))?
            .kill();
        Ok(())
    }

    pub fn change_group(&mut self, name: &str, new_group: &str) -> Result<()> {
        if self.live_group(new_group).is_none() {
            return Err(FsError::NotFound(format!("group {}", new_group)));
        }
        match self.live_user_mut(name) {
            Some(Row::User { group, .. }) => {
                *group = new_group.to_string();
                Ok(())
            }
            _ => Err(FsError::NotFound(format!("user {}", name))),
        }
    }
}

impl fmt::Display for UserTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in &self.rows {
            writeln!(f, "{}", row)?;
        }
        Ok(())
    }
}

/// The users table of one mounted filesystem, stored as the content of inode 1.
pub struct UserDirectory<'a> {
    fs: &'a mut FileSystem,
}

impl<'a> UserDirectory<'a> {
    pub fn new(fs: &'a mut FileSystem) -> Self {
        Self { fs }
    }

    pub fn load(&self) -> Result<UserTable> {
        let inode = self.fs.read_inode(USERS_INO)?;
        let text = self.fs.read_content(&inode)?;
        UserTable::parse(&String::from_utf8_lossy(&text))
    }

    fn store(&mut self, table: &UserTable) -> Result<()> {
        let mut inode = self.fs.read_inode(USERS_INO)?;
        self.fs
            .write_content(USERS_INO, &mut inode, table.to_string().as_bytes())
    }

    fn update<T>(&mut self, f: impl FnOnce(&mut UserTable) -> Result<T>) -> Result<T> {
        let mut table = self.load()?;
        let out = f(&mut table)?;
        self.store(&table)?;
        Ok(out)
    }

    pub fn login(&self, user: &str, password: &str) -> Result<(i32, i32)> {
        self.load()?.login(user, password)
    }

    pub fn owner(&self, user: &str) -> Result<(i32, i32)> {
        self.load()?.owner(user)
    }

    pub fn mkgrp(&mut self, name: &str) -> Result<i32> {
        let id = self.update(|t| t.add_group(name))?;
        log::info!("group {} created with id {}", name, id);
        Ok(id)
    }

    pub fn rmgrp(&mut self, name: &str) -> Result<()> {
        self.update(|t| t.remove_group(name))?;
        log::info!("group {} removed", name);
        Ok(())
    }

    pub fn mkusr(&mut self, name: &str, password: &str, group: &str) -> Result<i32> {
        let id = self.update(|t| t.add_user(name, password, group))?;
        log::info!("user {} created with id {}", name, id);
        Ok(id)
    }

    pub fn rmusr(&mut self, name: &str) -> Result<()> {
        self.update(|t| t.remove_user(name))?;
        log::info!("user {} removed", name);
        Ok(())
    }

    pub fn chgrp(&mut self, name: &str, group: &str) -> Result<()> {
        self.update(|t| t.change_group(name, group))?;
        log::info!("user {} moved to group {}", name, group);
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

    #[test]
    fn initial_table_text() {
        assert_eq!(
            UserTable::initial("123").to_string(),
            "1,G,root\n1,U,root,root,123\n"
        );
    }

    #[test]
    fn parse_and_render() {
        let text = "1,G,root\n1,U,root,root,123\n2,G,devs\n0,U,devs,ana,pw\n";
        let table = UserTable::parse(text).unwrap();
        assert_eq!(table.rows().len(), 4);
        assert!(!table.rows()[3].is_live());
        assert_eq!(table.to_string(), text);
        assert!(UserTable::parse("1,X,root\n").is_err());
        assert!(UserTable::parse("a,G,root\n").is_err());
    }

    #[test]
    fn login_errors_are_distinct() {
        let mut t = UserTable::initial("123");
        t.add_group("devs").unwrap();
        t.add_user("ana", "pw", "devs").unwrap();
        assert_eq!(t.login("ana", "pw").unwrap(), (2, 2));
        assert!(matches!(
            t.login("ana", "nope"),
            Err(FsError::InvalidCredentials(CredentialError::WrongPassword))
        ));
        assert!(matches!(
            t.login("bob", "pw"),
            Err(FsError::InvalidCredentials(CredentialError::UnknownUser))
        ));
        t.remove_user("ana").unwrap();
        assert!(matches!(
            t.login("ana", "pw"),
            Err(FsError::InvalidCredentials(_))
        ));
    }

    #[test]
    fn login_into_removed_group() {
        let mut t = UserTable::initial("123");
        t.add_group("devs").unwrap();
        t.add_user("ana", "pw", "devs").unwrap();
        t.remove_group("devs").unwrap();
        assert!(matches!(
            t.login("ana", "pw"),
            Err(FsError::InvalidCredentials(CredentialError::GroupRemoved))
        ));
        assert!(matches!(t.owner("ana"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn soft_delete_keeps_rows_and_ids() {
        let mut t = UserTable::initial("123");
        assert_eq!(t.add_group("a").unwrap(), 2);
        t.remove_group("a").unwrap();
        assert_eq!(t.add_group("b").unwrap(), 3);
        assert_eq!(t.add_group("a").unwrap(), 4);
        assert!(t.to_string().contains("0,G,a\n"));
        assert!(matches!(t.add_user("x", "y", "nogroup"), Err(FsError::NotFound(_))));
        t.remove_group("b").unwrap();
        assert!(matches!(t.add_user("x", "y", "b"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn guards() {
        let mut t = UserTable::initial("123");
        assert!(matches!(t.remove_user("root"), Err(FsError::PermissionDenied(_))));
        assert!(matches!(t.remove_group("root"), Err(FsError::PermissionDenied(_))));
        assert!(t.add_group("elevenchars").is_err());
        assert!(t.add_group("a,b").is_err());
        assert!(matches!(t.add_group("root"), Err(FsError::AlreadyExists(_))));
        t.add_user("ana", "pw", "root").unwrap();
        assert!(matches!(t.add_user("ana", "pw", "root"), Err(FsError::AlreadyExists(_))));
        t.add_group("devs").unwrap();
        t.change_group("ana", "devs").unwrap();
        assert_eq!(t.owner("ana").unwrap(), (2, 2));
        assert!(t.change_group("ana", "ghosts").is_err());
    }

    #[test]
    fn directory_persists_through_inode_one() {
        let scratch = ScratchDisk::new();
        let size = 64 * 1024;
        let dev = Arc::new(DiskFile::create(scratch.path(), size).unwrap());
        let users = UserTable::initial("123").to_string();
        let mut fs = FileSystem::format(dev, 0, size, FsType::Ext2, &users).unwrap();
        let mut dir = UserDirectory::new(&mut fs);
        dir.mkgrp("devs").unwrap();
        for i in 0..4 {
            dir.mkusr(&format!("user{}", i), "secret", "devs").unwrap();
        }
        assert_eq!(dir.login("user3", "secret").unwrap(), (5, 2));
        dir.rmusr("user1").unwrap();
        let text = dir.load().unwrap().to_string();
        assert!(text.len() > BLOCK_SZ);
        assert!(text.contains("0,U,devs,user1,secret\n"));
        assert!(dir.login("user1", "secret").is_err());
    }
}
