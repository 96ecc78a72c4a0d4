use super::*;

use std::fmt;

/// An absolute path inside a mounted filesystem, split into components.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsPath {
    parts: Vec<String>,
}

impl FsPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// `/a/b/c`; repeated and trailing slashes are ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.starts_with('/') {
            return Err(FsError::InvalidArgument(format!(
                "path {:?} must be absolute",
                s
            )));
        }
        let mut parts = Vec::new();
        for part in s.split('/').filter(|p| !p.is_empty()) {
            check_name(part)?;
            parts.push(part.to_string());
        }
        Ok(Self { parts })
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Final component, `None` for `/`.
    pub fn name(&self) -> Option<&str> {
        self.parts.last().map(String::as_str)
    }

    /// Directories above the final component.
    pub fn parents(&self) -> &[String] {
        match self.parts.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    pub fn parent(&self) -> Self {
        Self {
            parts: self.parents().to_vec(),
        }
    }

    /// First `n` components.
    pub fn prefix(&self, n: usize) -> Self {
        Self {
            parts: self.parts[..n.min(self.parts.len())].to_vec(),
        }
    }

    /// `/a`, `/a/b`, ... ending with the path itself.
    pub fn prefixes(&self) -> impl Iterator<Item = FsPath> + '_ {
        (1..=self.parts.len()).map(move |n| self.prefix(n))
    }

    pub fn join(&self, name: &str) -> Result<Self> {
        check_name(name)?;
        let mut parts = self.parts.clone();
        parts.push(name.to_string());
        Ok(Self { parts })
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return write!(f, "/");
        }
        for part in &self.parts {
            write!(f, "/{}", part)?;
        }
        Ok(())
    }
}

/// A directory entry name: non-empty, at most DIRSIZ bytes, no `/`, not `.` or `..`.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidArgument(format!("bad entry name {:?}", name)));
    }
    if name.len() > DIRSIZ {
        return Err(FsError::InvalidArgument(format!(
            "name {:?} is longer than {} bytes",
            name, DIRSIZ
        )));
    }
    if name.contains('\0') {
        return Err(FsError::InvalidArgument(format!("name {:?} contains NUL", name)));
    }
    Ok(())
}
