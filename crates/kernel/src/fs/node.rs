//! A generic tree of named, refcounted nodes; the spine of both `dev:` and
//! `sys:`. Leaves delegate their file behaviour to a [`NodeBackend`].

use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::io::{FileKind, Stat};
use cairn_utils::path::PathBuf;

use crate::fs::{FileRef, Filesystem, FsError, FsResult, Volume};
use crate::utils::locks::RwLock;
use crate::utils::types::Name;

/// What a leaf node does when opened.
pub trait NodeBackend: Send + Sync {
    fn open(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<FileRef>;

    fn open2(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<(FileRef, FileRef)> {
        let _ = (volume, path);
        Err(FsError::AccessDenied)
    }

    fn kind(&self) -> FileKind {
        FileKind::Device
    }

    fn size(&self) -> usize {
        0
    }
}

pub struct Node {
    name: Name,
    children: RwLock<Vec<Arc<Node>>>,
    backend: Option<Arc<dyn NodeBackend>>,
}

impl Node {
    pub fn new_dir(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: Name::new_const(name),
            children: RwLock::new(Vec::new()),
            backend: None,
        })
    }

    pub fn new_leaf(name: &str, backend: Arc<dyn NodeBackend>) -> Arc<Self> {
        Arc::new(Self {
            name: Name::new_const(name),
            children: RwLock::new(Vec::new()),
            backend: Some(backend),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dir(&self) -> bool {
        self.backend.is_none()
    }

    fn child(&self, name: &str) -> Option<Arc<Node>> {
        self.children
            .read()
            .iter()
            .find(|child| &*child.name == name)
            .cloned()
    }

    /// Sibling names are unique.
    pub fn insert(self: &Arc<Self>, node: Arc<Node>) -> FsResult<Arc<Node>> {
        if !self.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut children = self.children.write();
        if children.iter().any(|child| child.name == node.name) {
            return Err(FsError::AlreadyExists);
        }
        children.push(node.clone());
        Ok(node)
    }

    /// Unlinks a child, making it unreachable; the node itself dies when
    /// its last reference (open files included) drops.
    pub fn hide(&self, name: &str) -> FsResult<()> {
        let mut children = self.children.write();
        let before = children.len();
        children.retain(|child| &*child.name != name);
        if children.len() == before {
            return Err(FsError::NotFound);
        }
        Ok(())
    }
}

/// A [`Filesystem`] over a node tree, shared by devfs and sysfs.
pub struct NodeFs {
    name: &'static str,
    root: Arc<Node>,
}

impl NodeFs {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            root: Node::new_dir(""),
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn resolve(&self, path: &PathBuf) -> FsResult<Arc<Node>> {
        let mut current = self.root.clone();
        for name in path.parts().iter() {
            if !current.is_dir() {
                return Err(FsError::NotADirectory);
            }
            current = current.child(name).ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }
}

impl Filesystem for NodeFs {
    fn name(&self) -> &'static str {
        self.name
    }

    fn open(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<FileRef> {
        let node = self.resolve(path)?;
        match &node.backend {
            None => Err(FsError::IsADirectory),
            Some(backend) => backend.open(volume, path),
        }
    }

    fn open2(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<(FileRef, FileRef)> {
        let node = self.resolve(path)?;
        match &node.backend {
            None => Err(FsError::IsADirectory),
            Some(backend) => backend.open2(volume, path),
        }
    }

    fn stat(&self, path: &PathBuf) -> FsResult<Stat> {
        let node = self.resolve(path)?;
        Ok(match &node.backend {
            None => Stat::new(0, FileKind::Directory),
            Some(backend) => Stat::new(backend.size() as u64, backend.kind()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;
    impl NodeBackend for Nothing {
        fn open(&self, _: &Arc<Volume>, _: &PathBuf) -> FsResult<FileRef> {
            Err(FsError::AccessDenied)
        }
    }

    #[test_case]
    fn sibling_names_are_unique() {
        let dir = Node::new_dir("d");
        dir.insert(Node::new_leaf("a", Arc::new(Nothing))).unwrap();
        assert_eq!(
            dir.insert(Node::new_leaf("a", Arc::new(Nothing))).unwrap_err(),
            FsError::AlreadyExists
        );
    }

    #[test_case]
    fn hide_unlinks_but_keeps_alive() {
        let dir = Node::new_dir("d");
        let node = dir.insert(Node::new_leaf("x", Arc::new(Nothing))).unwrap();
        dir.hide("x").unwrap();
        assert!(dir.child("x").is_none());
        // still referenced from here, so still alive
        assert_eq!(node.name(), "x");
        assert_eq!(dir.hide("x").unwrap_err(), FsError::NotFound);
    }
}
