//! The in-memory filesystem used for `ram:` (seeded from the boot ramdisk)
//! and `tmp:`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::io::{FileKind, PollEvents, Stat};
use cairn_utils::path::PathBuf;

use crate::fs::ustar::{TarArchiveIter, TarEntryKind};
use crate::fs::{File, FileOps, FileRef, Filesystem, FsError, FsResult, PollReady, Volume};
use crate::utils::locks::RwLock;
use crate::utils::types::Name;

struct RamNode {
    name: Name,
    kind: FileKind,
    children: RwLock<Vec<Arc<RamNode>>>,
    data: RwLock<Vec<u8>>,
}

impl RamNode {
    fn new(name: Name, kind: FileKind) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            children: RwLock::new(Vec::new()),
            data: RwLock::new(Vec::new()),
        })
    }

    fn child(&self, name: &str) -> Option<Arc<RamNode>> {
        self.children
            .read()
            .iter()
            .find(|child| &*child.name == name)
            .cloned()
    }

    fn insert(&self, node: Arc<RamNode>) -> FsResult<Arc<RamNode>> {
        if self.kind != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let mut children = self.children.write();
        if children.iter().any(|child| child.name == node.name) {
            return Err(FsError::AlreadyExists);
        }
        children.push(node.clone());
        Ok(node)
    }
}

pub struct RamFs {
    root: Arc<RamNode>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            root: RamNode::new(Name::new_const(""), FileKind::Directory),
        }
    }

    fn resolve<'a>(&self, names: impl Iterator<Item = &'a str>) -> FsResult<Arc<RamNode>> {
        let mut current = self.root.clone();
        for name in names {
            if current.kind != FileKind::Directory {
                return Err(FsError::NotADirectory);
            }
            current = current.child(name).ok_or(FsError::NotFound)?;
        }
        Ok(current)
    }

    /// Resolves the parent directory and the final name of a path.
    fn resolve_parent<'a>(
        &self,
        path: &'a PathBuf,
    ) -> FsResult<(Arc<RamNode>, &'a str)> {
        let (name, parent) = path.parts().split_into_name();
        let name = name.ok_or(FsError::Invalid)?;
        let parent = self.resolve(parent.iter())?;
        Ok((parent, name))
    }

    fn create_node(&self, path: &PathBuf, kind: FileKind) -> FsResult<Arc<RamNode>> {
        let (parent, name) = self.resolve_parent(path)?;
        parent.insert(RamNode::new(
            Name::try_from(name).map_err(|_| FsError::NameTooLong)?,
            kind,
        ))
    }

    /// Creates any missing directories along `names`, returning the last.
    fn ensure_dirs<'a>(&self, names: impl Iterator<Item = &'a str>) -> FsResult<Arc<RamNode>> {
        let mut current = self.root.clone();
        for name in names {
            current = match current.child(name) {
                Some(child) => child,
                None => current.insert(RamNode::new(
                    Name::try_from(name).map_err(|_| FsError::NameTooLong)?,
                    FileKind::Directory,
                ))?,
            };
        }
        Ok(current)
    }

    /// Populates the filesystem from a ustar archive. Archives without
    /// explicit directory entries unpack fine, parents appear on demand.
    pub fn unpack(&self, archive: &mut TarArchiveIter<'_>) -> FsResult<()> {
        while let Some(entry) = archive.next() {
            let path = PathBuf::parse(&alloc::format!("boot:/{}", entry.name()), None)
                .map_err(|_| FsError::BadPath)?;
            match entry.kind() {
                TarEntryKind::Directory => {
                    self.ensure_dirs(path.parts().iter())?;
                }
                TarEntryKind::Normal => {
                    let (name, parent) = path.parts().split_into_name();
                    let name = name.ok_or(FsError::BadPath)?;
                    let parent = self.ensure_dirs(parent.iter())?;
                    let node = parent.insert(RamNode::new(
                        Name::try_from(name).map_err(|_| FsError::NameTooLong)?,
                        FileKind::File,
                    ))?;
                    node.data.write().extend_from_slice(entry.data());
                }
                TarEntryKind::Other => {}
            }
        }
        Ok(())
    }
}

struct RamFileOps {
    node: Arc<RamNode>,
}

impl FileOps for RamFileOps {
    fn read(&self, file: &File, buf: &mut [u8]) -> FsResult<usize> {
        let position = file.position();
        let count = self.read_at(file, position, buf)?;
        file.set_position(position + count as u64);
        Ok(count)
    }

    fn write(&self, file: &File, buf: &[u8]) -> FsResult<usize> {
        let position = file.position();
        let count = self.write_at(file, position, buf)?;
        file.set_position(position + count as u64);
        Ok(count)
    }

    fn read_at(&self, _file: &File, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let data = self.node.data.read();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        Ok(count)
    }

    fn write_at(&self, _file: &File, offset: u64, buf: &[u8]) -> FsResult<usize> {
        let mut data = self.node.data.write();
        let offset = offset as usize;
        if offset + buf.len() > data.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn len(&self, _file: &File) -> FsResult<usize> {
        Ok(self.node.data.read().len())
    }

    fn poll(&self, _file: &File, _requested: PollEvents) -> FsResult<PollReady> {
        // regular files never block
        Ok(PollReady {
            ready: PollEvents::READ | PollEvents::WRITE,
            queue: None,
        })
    }
}

impl Filesystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn open(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<FileRef> {
        for flag in path.flags() {
            if !matches!(flag, "create" | "trunc") {
                return Err(FsError::BadFlag);
            }
        }

        let node = match self.resolve(path.parts().iter()) {
            Ok(node) => node,
            Err(FsError::NotFound) if path.has_flag("create") => {
                self.create_node(path, FileKind::File)?
            }
            Err(err) => return Err(err),
        };

        if node.kind == FileKind::Directory {
            return Err(FsError::IsADirectory);
        }
        if path.has_flag("trunc") {
            node.data.write().clear();
        }

        Ok(File::new(
            Some(volume.clone()),
            alloc::boxed::Box::new(RamFileOps { node }),
        ))
    }

    fn stat(&self, path: &PathBuf) -> FsResult<Stat> {
        let node = self.resolve(path.parts().iter())?;
        Ok(Stat::new(node.data.read().len() as u64, node.kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::VFS;
    use cairn_utils::make_path;

    #[test_case]
    fn create_write_read_back() {
        // `create` does not invent parent directories
        assert_eq!(
            VFS.open(&make_path!("tmp", "notes/file.txt?create")).unwrap_err(),
            FsError::NotFound
        );

        let fs = RamFs::new();
        fs.create_node(&make_path!("boot", "dir"), FileKind::Directory)
            .unwrap();
        let node = fs
            .create_node(&make_path!("boot", "dir/inner.txt"), FileKind::File)
            .unwrap();
        node.data.write().extend_from_slice(b"payload");

        let resolved = fs.resolve(["dir", "inner.txt"].into_iter()).unwrap();
        assert_eq!(&*resolved.data.read(), b"payload");
    }

    #[test_case]
    fn trunc_flag() {
        let file = VFS.open(&make_path!("tmp", "t?create")).unwrap();
        file.write(b"old content").unwrap();
        drop(file);

        let file = VFS.open(&make_path!("tmp", "t?trunc")).unwrap();
        assert_eq!(file.len().unwrap(), 0);
    }
}
