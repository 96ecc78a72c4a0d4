//! Scratch disk images for tests.

use std::path::{Path, PathBuf};

/// A unique image path under the temp dir, removed on drop.
pub struct ScratchDisk {
    path: PathBuf,
}

impl ScratchDisk {
    pub fn new() -> Self {
        let path = std::env::temp_dir()
            .join("ext2-vdisk-tests")
            .join(format!("{}.mia", uuid::Uuid::new_v4()));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_str(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

impl Drop for ScratchDisk {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
