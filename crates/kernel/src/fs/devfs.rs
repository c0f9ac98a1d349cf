//! `dev:`, the device files. Drivers register backends on the node tree;
//! the built-ins are `null`, `zero`, `pipe` and the keyboard event stream.

use alloc::boxed::Box;
use alloc::sync::Arc;

use cairn_abi::io::PollEvents;
use cairn_utils::path::PathBuf;
use lazy_static::lazy_static;

use crate::fs::event_stream::EventStream;
use crate::fs::node::{Node, NodeBackend, NodeFs};
use crate::fs::{File, FileOps, FileRef, FsError, FsResult, PollReady, Volume, pipe};

lazy_static! {
    /// Fed by the PS/2 IRQ handler when a keyboard driver is present.
    pub static ref KEYBOARD_EVENTS: Arc<EventStream> = EventStream::new();
}

struct NullOps;

impl FileOps for NullOps {
    fn read(&self, _file: &File, _buf: &mut [u8]) -> FsResult<usize> {
        Ok(0)
    }

    fn write(&self, _file: &File, buf: &[u8]) -> FsResult<usize> {
        Ok(buf.len())
    }

    fn poll(&self, _file: &File, _requested: PollEvents) -> FsResult<PollReady> {
        Ok(PollReady {
            ready: PollEvents::READ | PollEvents::WRITE,
            queue: None,
        })
    }
}

struct ZeroOps;

impl FileOps for ZeroOps {
    fn read(&self, _file: &File, buf: &mut [u8]) -> FsResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write(&self, _file: &File, buf: &[u8]) -> FsResult<usize> {
        Ok(buf.len())
    }

    fn poll(&self, _file: &File, _requested: PollEvents) -> FsResult<PollReady> {
        Ok(PollReady {
            ready: PollEvents::READ | PollEvents::WRITE,
            queue: None,
        })
    }
}

/// Backend for simple always-ready character devices.
struct CharBackend {
    make: fn() -> Box<dyn FileOps>,
}

impl NodeBackend for CharBackend {
    fn open(&self, volume: &Arc<Volume>, _path: &PathBuf) -> FsResult<FileRef> {
        Ok(File::new(Some(volume.clone()), (self.make)()))
    }
}

/// `dev:/pipe` only makes sense as a pair of ends.
struct PipeBackend;

impl NodeBackend for PipeBackend {
    fn open(&self, _volume: &Arc<Volume>, _path: &PathBuf) -> FsResult<FileRef> {
        Err(FsError::Invalid)
    }

    fn open2(&self, volume: &Arc<Volume>, _path: &PathBuf) -> FsResult<(FileRef, FileRef)> {
        Ok(pipe::create(Some(volume.clone())))
    }
}

struct KeyboardBackend;

impl NodeBackend for KeyboardBackend {
    fn open(&self, volume: &Arc<Volume>, _path: &PathBuf) -> FsResult<FileRef> {
        Ok(KEYBOARD_EVENTS.open(Some(volume.clone())))
    }
}

pub fn create() -> NodeFs {
    let fs = NodeFs::new("devfs");
    let root = fs.root().clone();

    root.insert(Node::new_leaf(
        "null",
        Arc::new(CharBackend {
            make: || Box::new(NullOps),
        }),
    ))
    .unwrap();
    root.insert(Node::new_leaf(
        "zero",
        Arc::new(CharBackend {
            make: || Box::new(ZeroOps),
        }),
    ))
    .unwrap();
    root.insert(Node::new_leaf("pipe", Arc::new(PipeBackend))).unwrap();

    let kbd = root.insert(Node::new_dir("kbd")).unwrap();
    kbd.insert(Node::new_leaf("ps2", Arc::new(KeyboardBackend)))
        .unwrap();

    fs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::VFS;
    use cairn_utils::make_path;

    #[test_case]
    fn null_and_zero() {
        let null = VFS.open(&make_path!("dev", "null")).unwrap();
        let mut buf = [0xAAu8; 4];
        assert_eq!(null.read(&mut buf).unwrap(), 0);
        assert_eq!(null.write(&buf).unwrap(), 4);

        let zero = VFS.open(&make_path!("dev", "zero")).unwrap();
        assert_eq!(zero.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0; 4]);
    }

    #[test_case]
    fn pipe_needs_open2() {
        let path = make_path!("dev", "pipe");
        assert_eq!(VFS.open(&path).unwrap_err(), FsError::Invalid);

        let (read_end, write_end) = VFS.open2(&path).unwrap();
        write_end.write(b"ABCD").unwrap();
        let mut buf = [0u8; 4];
        read_end.read(&mut buf).unwrap();
        assert_eq!(&buf, b"ABCD");
    }

    #[test_case]
    fn keyboard_poll_times_out() {
        let kbd = VFS.open(&make_path!("dev", "kbd/ps2")).unwrap();
        let files = [(kbd, cairn_abi::io::PollEvents::READ)];
        let mut occurred = [cairn_abi::io::PollEvents::empty()];

        let timeout = 100_000_000; // 100 ms
        let before = crate::time::uptime();
        let ready = crate::fs::poll(&files, &mut occurred, timeout).unwrap();
        let elapsed = crate::time::uptime() - before;

        assert_eq!(ready, 0);
        assert!(occurred[0].is_empty());
        assert!(elapsed >= timeout);
        assert!(elapsed <= 2 * timeout);
    }
}
