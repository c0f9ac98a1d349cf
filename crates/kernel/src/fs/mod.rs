//! The virtual filesystem: volumes addressed by label, refcounted files
//! with a method table, per-process fd tables and cwd.

pub mod devfs;
pub mod event_stream;
pub mod node;
pub mod pipe;
pub mod ramfs;
pub mod sysfs;
pub mod ustar;

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::collections::btree_map::{BTreeMap, Entry};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cairn_abi::errors::Errno;
use cairn_abi::io::{PollEvents, SeekWhence, Stat};
use cairn_abi::{CLOCKS_NEVER, Clocks};
use cairn_utils::path::PathBuf;
use lazy_static::lazy_static;
use thiserror::Error;

use crate::utils::locks::{Mutex, RwLock};
use crate::utils::types::LabelName;
use crate::wait::{self, WaitQueue, WaitResult};
use crate::{config, debug};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("permission denied")]
    AccessDenied,
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("no such volume label")]
    NoSuchLabel,
    #[error("malformed path")]
    BadPath,
    #[error("unknown flag")]
    BadFlag,
    #[error("unknown control code")]
    UnknownCtl,
    #[error("resource busy")]
    Busy,
    #[error("already exists")]
    AlreadyExists,
    #[error("illegal seek")]
    IllegalSeek,
    #[error("invalid argument")]
    Invalid,
    #[error("out of memory")]
    OutOfMemory,
    #[error("too many open files")]
    TooManyFiles,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("peer disconnected")]
    Disconnected,
    #[error("name too long")]
    NameTooLong,
}

impl From<FsError> for Errno {
    fn from(value: FsError) -> Self {
        match value {
            FsError::AccessDenied => Errno::EACCES,
            FsError::NotFound => Errno::ENOENT,
            FsError::NotADirectory => Errno::ENOTDIR,
            FsError::IsADirectory => Errno::EISDIR,
            FsError::NoSuchLabel => Errno::ENOLABEL,
            FsError::BadPath => Errno::EBADPATH,
            FsError::BadFlag => Errno::EBADFLAG,
            FsError::UnknownCtl => Errno::EUNKNOWNCTL,
            FsError::Busy => Errno::EBUSY,
            FsError::AlreadyExists => Errno::EEXIST,
            FsError::IllegalSeek => Errno::ESPIPE,
            FsError::Invalid => Errno::EINVAL,
            FsError::OutOfMemory => Errno::ENOMEM,
            FsError::TooManyFiles => Errno::EMFILE,
            FsError::BrokenPipe => Errno::EPIPE,
            FsError::Disconnected => Errno::EDISCONNECTED,
            FsError::NameTooLong => Errno::ENAMETOOLONG,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Readiness report of a file's `poll` op: what is ready right now, and a
/// queue to sleep on for changes.
pub struct PollReady {
    pub ready: PollEvents,
    pub queue: Option<WaitQueue>,
}

/// The method table of a [`File`]. Absent ops answer `AccessDenied`.
pub trait FileOps: Send + Sync {
    /// Reads at the file's shared position, advancing it.
    fn read(&self, file: &File, buf: &mut [u8]) -> FsResult<usize> {
        let _ = (file, buf);
        Err(FsError::AccessDenied)
    }

    /// Writes at the file's shared position, advancing it.
    fn write(&self, file: &File, buf: &[u8]) -> FsResult<usize> {
        let _ = (file, buf);
        Err(FsError::AccessDenied)
    }

    /// Positioned read; does not touch the shared position.
    fn read_at(&self, file: &File, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let _ = (file, offset, buf);
        Err(FsError::IllegalSeek)
    }

    /// Positioned write; does not touch the shared position.
    fn write_at(&self, file: &File, offset: u64, buf: &[u8]) -> FsResult<usize> {
        let _ = (file, offset, buf);
        Err(FsError::IllegalSeek)
    }

    fn seek(&self, file: &File, offset: i64, whence: SeekWhence) -> FsResult<u64> {
        let len = self.len(file)? as i64;
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::End => len,
            SeekWhence::Cur => file.position() as i64,
        };
        let position = base.checked_add(offset).filter(|p| *p >= 0).ok_or(FsError::Invalid)?;
        file.set_position(position as u64);
        Ok(position as u64)
    }

    fn ioctl(&self, file: &File, request: u64, arg: &mut [u8]) -> FsResult<usize> {
        let _ = (file, request, arg);
        Err(FsError::AccessDenied)
    }

    fn poll(&self, file: &File, requested: PollEvents) -> FsResult<PollReady> {
        let _ = (file, requested);
        Err(FsError::AccessDenied)
    }

    fn flush(&self, file: &File) -> FsResult<()> {
        let _ = file;
        Ok(())
    }

    fn len(&self, file: &File) -> FsResult<usize> {
        let _ = file;
        Err(FsError::AccessDenied)
    }

    /// Runs on the last deref, before the volume reference is released.
    fn cleanup(&self, file: &File) {
        let _ = file;
    }
}

/// An open file. Reference counted; two dup'd fds share one `File` and
/// therefore one position.
pub struct File {
    volume: Option<Arc<Volume>>,
    position: AtomicU64,
    ops: Box<dyn FileOps>,
}

pub type FileRef = Arc<File>;

impl File {
    pub fn new(volume: Option<Arc<Volume>>, ops: Box<dyn FileOps>) -> FileRef {
        Arc::new(Self {
            volume,
            position: AtomicU64::new(0),
            ops,
        })
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    pub fn volume(&self) -> Option<&Arc<Volume>> {
        self.volume.as_ref()
    }

    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        self.ops.read(self, buf)
    }

    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        self.ops.write(self, buf)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.ops.read_at(self, offset, buf)
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> FsResult<usize> {
        self.ops.write_at(self, offset, buf)
    }

    pub fn seek(&self, offset: i64, whence: SeekWhence) -> FsResult<u64> {
        self.ops.seek(self, offset, whence)
    }

    pub fn ioctl(&self, request: u64, arg: &mut [u8]) -> FsResult<usize> {
        self.ops.ioctl(self, request, arg)
    }

    pub fn poll(&self, requested: PollEvents) -> FsResult<PollReady> {
        self.ops.poll(self, requested)
    }

    pub fn flush(&self) -> FsResult<()> {
        self.ops.flush(self)
    }

    pub fn len(&self) -> FsResult<usize> {
        self.ops.len(self)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // cleanup runs under no lock; the volume reference drops afterwards
        self.ops.cleanup(self);
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("volume", &self.volume.as_ref().map(|volume| volume.label()))
            .field("position", &self.position())
            .finish()
    }
}

/// A mounted filesystem instance. `path` arrives canonical; `path.flags()`
/// carries the `?flag&flag` trailer for filesystems that honour one.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<FileRef>;

    /// Open a file that comes as a pair of endpoints (`dev:/pipe`).
    fn open2(&self, volume: &Arc<Volume>, path: &PathBuf) -> FsResult<(FileRef, FileRef)> {
        let _ = (volume, path);
        Err(FsError::AccessDenied)
    }

    fn stat(&self, path: &PathBuf) -> FsResult<Stat>;
}

pub struct Volume {
    label: LabelName,
    fs: Arc<dyn Filesystem>,
}

impl Volume {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fs(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }
}

pub struct Vfs {
    volumes: RwLock<BTreeMap<LabelName, Arc<Volume>>>,
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            volumes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn mount(&self, label: LabelName, fs: Arc<dyn Filesystem>) -> FsResult<()> {
        let mut volumes = self.volumes.write();
        match volumes.entry(label.clone()) {
            Entry::Vacant(entry) => {
                debug!(Vfs, "mounted {} as {}:", fs.name(), label);
                entry.insert(Arc::new(Volume { label, fs }));
                Ok(())
            }
            Entry::Occupied(_) => Err(FsError::AlreadyExists),
        }
    }

    /// Unmounting only succeeds once every file on the volume is closed.
    pub fn unmount(&self, label: &str) -> FsResult<()> {
        let mut volumes = self.volumes.write();
        let volume = volumes.get(label).ok_or(FsError::NoSuchLabel)?;
        if Arc::strong_count(volume) != 1 {
            return Err(FsError::Busy);
        }
        volumes.remove(label);
        Ok(())
    }

    fn volume(&self, label: &str) -> FsResult<Arc<Volume>> {
        self.volumes
            .read()
            .get(label)
            .cloned()
            .ok_or(FsError::NoSuchLabel)
    }

    pub fn open(&self, path: &PathBuf) -> FsResult<FileRef> {
        let volume = self.volume(path.label())?;
        volume.fs.clone().open(&volume, path)
    }

    pub fn open2(&self, path: &PathBuf) -> FsResult<(FileRef, FileRef)> {
        let volume = self.volume(path.label())?;
        volume.fs.clone().open2(&volume, path)
    }

    pub fn stat(&self, path: &PathBuf) -> FsResult<Stat> {
        let volume = self.volume(path.label())?;
        volume.fs.stat(path)
    }
}

lazy_static! {
    pub static ref VFS: Vfs = Vfs::new();
}

/// Mounts the boot volumes: the ramdisk as `ram:`, an empty `tmp:`, the
/// device tree as `dev:` and the kernel objects as `sys:`.
pub fn init() {
    let ram = ramfs::RamFs::new();
    if let Some(mut archive) = crate::limine::ramdisk() {
        ram.unpack(&mut archive).expect("damaged ramdisk archive");
    }
    VFS.mount(LabelName::new_const("ram"), Arc::new(ram)).unwrap();
    VFS.mount(LabelName::new_const("tmp"), Arc::new(ramfs::RamFs::new()))
        .unwrap();
    VFS.mount(LabelName::new_const("dev"), Arc::new(devfs::create()))
        .unwrap();
    VFS.mount(LabelName::new_const("sys"), Arc::new(sysfs::create()))
        .unwrap();
}

/// Creates a named filesystem instance for the `bind` syscall.
pub fn create_fs(name: &str) -> FsResult<Arc<dyn Filesystem>> {
    match name {
        "ramfs" => Ok(Arc::new(ramfs::RamFs::new())),
        _ => Err(FsError::NotFound),
    }
}

/// The per-process fd table; open addressing into a fixed slot array.
pub struct FdTable {
    slots: Vec<Option<FileRef>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: alloc::vec![None; config::MAX_FD],
        }
    }

    pub fn insert(&mut self, file: FileRef) -> FsResult<usize> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyFiles)?;
        self.slots[slot] = Some(file);
        Ok(slot)
    }

    pub fn get(&self, fd: usize) -> Option<FileRef> {
        self.slots.get(fd)?.clone()
    }

    pub fn remove(&mut self, fd: usize) -> Option<FileRef> {
        self.slots.get_mut(fd)?.take()
    }

    pub fn dup(&mut self, fd: usize) -> FsResult<usize> {
        let file = self.get(fd).ok_or(FsError::Invalid)?;
        self.insert(file)
    }

    pub fn dup2(&mut self, fd: usize, target: usize) -> FsResult<usize> {
        let file = self.get(fd).ok_or(FsError::Invalid)?;
        if target >= self.slots.len() {
            return Err(FsError::Invalid);
        }
        self.slots[target] = Some(file);
        Ok(target)
    }
}

/// A process's view of the VFS: its cwd and its fd table.
pub struct VfsContext {
    cwd: Mutex<PathBuf>,
    pub files: Mutex<FdTable>,
}

impl VfsContext {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd: Mutex::new(cwd),
            files: Mutex::new(FdTable::new()),
        }
    }

    /// A child context: same cwd, empty fd table.
    pub fn fork(&self) -> Self {
        Self::new(self.cwd.lock().clone())
    }

    pub fn cwd(&self) -> PathBuf {
        self.cwd.lock().clone()
    }

    /// Parses and canonicalises `raw` against this context's cwd.
    pub fn resolve(&self, raw: &str) -> FsResult<PathBuf> {
        let cwd = self.cwd.lock();
        PathBuf::parse(raw, Some(&cwd)).map_err(|_| FsError::BadPath)
    }

    pub fn chdir(&self, raw: &str) -> FsResult<()> {
        let path = self.resolve(raw)?;
        // the target must exist and be a directory
        let stat = VFS.stat(&path)?;
        if stat.kind != cairn_abi::io::FileKind::Directory as u8 {
            return Err(FsError::NotADirectory);
        }
        *self.cwd.lock() = path;
        Ok(())
    }

    pub fn realpath(&self, raw: &str) -> FsResult<String> {
        use alloc::string::ToString;
        Ok(self.resolve(raw)?.to_string())
    }
}

/// Polls `files` until at least one is ready or the timeout passes; fills
/// `occurred` and returns the number of ready files.
///
/// Readiness is rechecked before every sleep and after every wake.
pub fn poll(
    files: &[(FileRef, PollEvents)],
    occurred: &mut [PollEvents],
    timeout: Clocks,
) -> FsResult<usize> {
    debug_assert_eq!(files.len(), occurred.len());

    let deadline = if timeout == CLOCKS_NEVER {
        CLOCKS_NEVER
    } else {
        crate::time::uptime() + timeout
    };

    loop {
        let mut queues: Vec<WaitQueue> = Vec::with_capacity(files.len());
        let mut ready = 0;

        for ((file, requested), slot) in files.iter().zip(occurred.iter_mut()) {
            let report = match file.poll(*requested) {
                Ok(report) => report,
                Err(_) => PollReady {
                    ready: PollEvents::NVAL,
                    queue: None,
                },
            };
            *slot = report.ready & (*requested | PollEvents::ALWAYS);
            if !slot.is_empty() {
                ready += 1;
            } else if let Some(queue) = report.queue {
                queues.push(queue);
            }
        }

        if ready != 0 {
            return Ok(ready);
        }

        let now = crate::time::uptime();
        if deadline <= now {
            return Ok(0);
        }
        let remaining = if deadline == CLOCKS_NEVER {
            CLOCKS_NEVER
        } else {
            deadline - now
        };

        if queues.is_empty() {
            // nothing will ever signal these files
            wait::sleep(remaining.min(crate::time::NS_PER_SEC));
            continue;
        }

        let queue_refs: Vec<&WaitQueue> = queues.iter().collect();
        match wait::block_many(&queue_refs, remaining) {
            WaitResult::Timeout => return Ok(0),
            WaitResult::Dead => return Err(FsError::Busy),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_utils::make_path;

    #[test_case]
    fn mount_and_stat() {
        let path = make_path!("sys", "stat/cpu");
        let stat = VFS.stat(&path).unwrap();
        assert_eq!(stat.kind, cairn_abi::io::FileKind::File as u8);

        assert_eq!(
            VFS.stat(&make_path!("nosuch", "x")).unwrap_err(),
            FsError::NoSuchLabel
        );
    }

    #[test_case]
    fn unmount_busy() {
        VFS.mount(
            crate::utils::types::LabelName::new_const("scratch"),
            Arc::new(ramfs::RamFs::new()),
        )
        .unwrap();

        let file = VFS.open(&make_path!("scratch", "held?create")).unwrap();
        assert_eq!(VFS.unmount("scratch"), Err(FsError::Busy));

        drop(file);
        VFS.unmount("scratch").unwrap();
    }

    #[test_case]
    fn dup_shares_position() {
        let path = make_path!("tmp", "shared-pos?create");
        let file = VFS.open(&path).unwrap();
        file.write(b"0123456789").unwrap();
        file.set_position(0);

        let dup = file.clone();

        let mut buf = [0u8; 4];
        file.read(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");

        dup.read(&mut buf).unwrap();
        assert_eq!(&buf, b"4567");
    }
}
