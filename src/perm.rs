use super::*;
use disk::Inode;

use std::fmt;

pub const ROOT_USER: &str = "root";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read = 4,
    Write = 2,
    Exec = 1,
}

/// ugo permission triplet, each digit 0..=7
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Perm {
    pub owner: u8,
    pub group: u8,
    pub other: u8,
}

impl Perm {
    /// 664
    pub const DEFAULT: Perm = Perm {
        owner: 6,
        group: 6,
        other: 4,
    };

    pub const DIR_ROOT: Perm = Perm {
        owner: 7,
        group: 7,
        other: 7,
    };

    /// Parse a three digit octal string such as `664`.
    pub fn parse(s: &str) -> Result<Self> {
        let digits: Vec<u8> = s.bytes().collect();
        if digits.len() != 3 || digits.iter().any(|d| !(b'0'..=b'7').contains(d)) {
            return Err(FsError::InvalidArgument(format!(
                "permission {:?} must be three digits 0-7",
                s
            )));
        }
        Ok(Self {
            owner: digits[0] - b'0',
            group: digits[1] - b'0',
            other: digits[2] - b'0',
        })
    }

    /// Lenient decode of the on-disk field; garbage reads as no access.
    pub fn from_bytes(raw: [u8; 3]) -> Self {
        let digit = |b: u8| if (b'0'..=b'7').contains(&b) { b - b'0' } else { 0 };
        Self {
            owner: digit(raw[0]),
            group: digit(raw[1]),
            other: digit(raw[2]),
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [b'0' + self.owner, b'0' + self.group, b'0' + self.other]
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.owner, self.group, self.other)
    }
}

/// The logged-in user acting on one mounted partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub user: String,
    pub uid: i32,
    pub gid: i32,
    pub mount_id: String,
}

impl Session {
    /// Identity used by journal replay: root, owning everything as 0/0.
    pub fn replay(mount_id: &str) -> Self {
        Self {
            user: ROOT_USER.to_string(),
            uid: 0,
            gid: 0,
            mount_id: mount_id.to_string(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.user == ROOT_USER
    }

    pub fn can(&self, inode: &Inode, access: Access) -> bool {
        if self.is_root() {
            return true;
        }
        let perm = inode.perm();
        let digit = if inode.uid == self.uid {
            perm.owner
        } else if inode.gid == self.gid {
            perm.group
        } else {
            perm.other
        };
        digit & access as u8 != 0
    }

    pub fn require(&self, inode: &Inode, access: Access, what: &str) -> Result<()> {
        if self.can(inode, access) {
            Ok(())
        } else {
            Err(FsError::PermissionDenied(format!(
                "{} needs {:?} access for {}",
                what, access, self.user
            )))
        }
    }

    /// chmod and chown are reserved to the owner and root.
    pub fn require_owner(&self, inode: &Inode, what: &str) -> Result<()> {
        if self.is_root() || inode.uid == self.uid {
            Ok(())
        } else {
            Err(FsError::PermissionDenied(format!(
                "{} is not owned by {}",
                what, self.user
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use disk::FileKind;

    fn user(name: &str, uid: i32, gid: i32) -> Session {
        Session {
            user: name.to_string(),
            uid,
            gid,
            mount_id: "501A".to_string(),
        }
    }

    #[test]
    fn parse_perm() {
        let p = Perm::parse("640").unwrap();
        assert_eq!((p.owner, p.group, p.other), (6, 4, 0));
        assert_eq!(p.to_string(), "640");
        assert_eq!(p.to_bytes(), *b"640");
        assert!(Perm::parse("68").is_err());
        assert!(Perm::parse("800").is_err());
        assert_eq!(Perm::from_bytes(*b"7x5").group, 0);
    }

    #[test]
    fn ugo_selection() {
        let ino = Inode::new(FileKind::File, 2, 3, Perm::parse("640").unwrap());
        let owner = user("ana", 2, 9);
        let member = user("luis", 4, 3);
        let other = user("eve", 5, 5);
        assert!(owner.can(&ino, Access::Write));
        assert!(member.can(&ino, Access::Read));
        assert!(!member.can(&ino, Access::Write));
        assert!(!other.can(&ino, Access::Read));
        assert!(matches!(
            other.require(&ino, Access::Read, "/a.txt"),
            Err(FsError::PermissionDenied(_))
        ));
        assert!(user("root", 1, 1).can(&ino, Access::Exec));
    }

    #[test]
    fn only_owner_or_root_changes_metadata() {
        let ino = Inode::new(FileKind::Directory, 2, 2, Perm::DIR_ROOT);
        assert!(user("ana", 2, 2).require_owner(&ino, "/d").is_ok());
        assert!(user("luis", 3, 2).require_owner(&ino, "/d").is_err());
        assert!(Session::replay("501A").require_owner(&ino, "/d").is_ok());
    }
}
