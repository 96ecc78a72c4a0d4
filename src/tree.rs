use super::*;
use common::*;
use disk::Inode;
use fs::FileSystem;

use serde::Serialize;
use std::collections::{HashSet, VecDeque};

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub inode: i32,
    /// "dir" or "file"
    pub kind: &'static str,
    pub perm: String,
    pub uid: i32,
    pub gid: i32,
    pub size: i32,
    pub mtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

struct Pending {
    node: TreeNode,
    children: Vec<usize>,
}

impl FileSystem {
    /// The whole tree from `/`. Each inode shows up once; an entry pointing at an
    /// inode already placed is left out.
    pub fn tree(&self) -> Result<TreeNode> {
        let mut arena: Vec<Pending> = Vec::new();
        let mut seen = HashSet::from([ROOT_INO]);
        let root = self.read_inode(ROOT_INO)?;
        arena.push(Pending {
            node: self.node("/", "/", ROOT_INO, &root)?,
            children: Vec::new(),
        });
        let mut queue = VecDeque::from([(0usize, root)]);
        while let Some((at, dir)) = queue.pop_front() {
            let base = arena[at].node.path.clone();
            for e in self.entries(&dir)? {
                if !seen.insert(e.ino) {
                    log::warn!("inode {} reached twice, skipping {}", e.ino, e.name);
                    continue;
                }
                let inode = self.read_inode(e.ino)?;
                let path = if base == "/" {
                    format!("/{}", e.name)
                } else {
                    format!("{}/{}", base, e.name)
                };
                let idx = arena.len();
                arena.push(Pending {
                    node: self.node(&e.name, &path, e.ino, &inode)?,
                    children: Vec::new(),
                });
                arena[at].children.push(idx);
                if inode.is_dir() {
                    queue.push_back((idx, inode));
                }
            }
        }

        // children always sit after their parent, so fold from the back
        let mut built: Vec<Option<TreeNode>> = vec![None; arena.len()];
        for (idx, pending) in arena.into_iter().enumerate().rev() {
            let mut node = pending.node;
            node.children = pending
                .children
                .iter()
                .filter_map(|&c| built[c].take())
                .collect();
            built[idx] = Some(node);
        }
        built
            .first_mut()
            .and_then(Option::take)
            .ok_or_else(|| FsError::NotFound("root directory".to_string()))
    }

    fn node(&self, name: &str, path: &str, ino: i32, inode: &Inode) -> Result<TreeNode> {
        let content = if inode.is_file() {
            Some(String::from_utf8_lossy(&self.read_content(inode)?).into_owned())
        } else {
            None
        };
        Ok(TreeNode {
            name: name.to_string(),
            path: path.to_string(),
            inode: ino,
            kind: if inode.is_dir() { "dir" } else { "file" },
            perm: inode.perm().to_string(),
            uid: inode.uid,
            gid: inode.gid,
            size: inode.size,
            mtime: format_time(inode.mtime),
            content,
            children: Vec::new(),
        })
    }
}
