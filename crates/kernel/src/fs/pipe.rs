//! Bounded FIFO pipe files: one page of buffer, split read/write ends,
//! blocking through the wait subsystem.

use alloc::boxed::Box;
use alloc::sync::Arc;

use cairn_abi::io::PollEvents;

use crate::fs::{File, FileOps, FileRef, FsError, FsResult, PollReady, Volume};
use crate::memory::paging::PAGE_SIZE;
use crate::utils::locks::IrqMutex;
use crate::wait::{WaitQueue, WaitResult};
use crate::wait_until_locked;

const PIPE_CAPACITY: usize = PAGE_SIZE;

struct PipeBuf {
    data: Box<[u8]>,
    read_index: usize,
    len: usize,
    read_closed: bool,
    write_closed: bool,
}

impl PipeBuf {
    fn pop(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        for slot in out.iter_mut().take(count) {
            *slot = self.data[self.read_index];
            self.read_index = (self.read_index + 1) % PIPE_CAPACITY;
            self.len -= 1;
        }
        count
    }

    fn push(&mut self, input: &[u8]) -> usize {
        let count = input.len().min(PIPE_CAPACITY - self.len);
        for byte in input.iter().take(count) {
            let write_index = (self.read_index + self.len) % PIPE_CAPACITY;
            self.data[write_index] = *byte;
            self.len += 1;
        }
        count
    }
}

struct PipeShared {
    buf: IrqMutex<PipeBuf>,
    /// readers and writers both sleep here; every state change wakes all
    queue: WaitQueue,
}

struct PipeReadOps {
    shared: Arc<PipeShared>,
}

impl FileOps for PipeReadOps {
    fn read(&self, _file: &File, out: &mut [u8]) -> FsResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut guard = self.shared.buf.lock();
        let result = wait_until_locked!(
            &self.shared.queue,
            guard,
            guard.len > 0 || guard.write_closed
        );
        if result != WaitResult::Norm && guard.len == 0 && !guard.write_closed {
            drop(guard);
            return Ok(0);
        }

        let count = guard.pop(out);
        drop(guard);

        if count > 0 {
            self.shared.queue.wake_all();
        }
        // count == 0 here means the write side hung up
        Ok(count)
    }

    fn poll(&self, _file: &File, _requested: PollEvents) -> FsResult<PollReady> {
        let guard = self.shared.buf.lock();
        let mut ready = PollEvents::empty();
        if guard.len > 0 {
            ready |= PollEvents::READ;
        }
        if guard.write_closed {
            ready |= PollEvents::HUP;
        }
        drop(guard);
        Ok(PollReady {
            ready,
            queue: Some(self.shared.queue.clone()),
        })
    }

    fn cleanup(&self, _file: &File) {
        self.shared.buf.lock().read_closed = true;
        self.shared.queue.wake_all();
    }
}

struct PipeWriteOps {
    shared: Arc<PipeShared>,
}

impl FileOps for PipeWriteOps {
    fn write(&self, _file: &File, input: &[u8]) -> FsResult<usize> {
        let mut written = 0;

        while written < input.len() {
            let mut guard = self.shared.buf.lock();
            if guard.read_closed {
                drop(guard);
                return if written == 0 {
                    Err(FsError::BrokenPipe)
                } else {
                    Ok(written)
                };
            }

            let result = wait_until_locked!(
                &self.shared.queue,
                guard,
                guard.len < PIPE_CAPACITY || guard.read_closed
            );
            if result != WaitResult::Norm {
                drop(guard);
                return Ok(written);
            }

            written += guard.push(&input[written..]);
            drop(guard);
            self.shared.queue.wake_all();
        }

        Ok(written)
    }

    fn poll(&self, _file: &File, _requested: PollEvents) -> FsResult<PollReady> {
        let guard = self.shared.buf.lock();
        let mut ready = PollEvents::empty();
        if guard.len < PIPE_CAPACITY {
            ready |= PollEvents::WRITE;
        }
        if guard.read_closed {
            ready |= PollEvents::HUP;
        }
        drop(guard);
        Ok(PollReady {
            ready,
            queue: Some(self.shared.queue.clone()),
        })
    }

    fn cleanup(&self, _file: &File) {
        self.shared.buf.lock().write_closed = true;
        self.shared.queue.wake_all();
    }
}

/// A fresh pipe as `(read_end, write_end)`.
pub fn create(volume: Option<Arc<Volume>>) -> (FileRef, FileRef) {
    let shared = Arc::new(PipeShared {
        buf: IrqMutex::new(PipeBuf {
            data: alloc::vec![0u8; PIPE_CAPACITY].into_boxed_slice(),
            read_index: 0,
            len: 0,
            read_closed: false,
            write_closed: false,
        }),
        queue: WaitQueue::new(),
    });

    let read_end = File::new(
        volume.clone(),
        Box::new(PipeReadOps {
            shared: shared.clone(),
        }),
    );
    let write_end = File::new(volume, Box::new(PipeWriteOps { shared }));
    (read_end, write_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn echo_through_pipe() {
        let (read_end, write_end) = create(None);

        assert_eq!(write_end.write(b"ABCD").unwrap(), 4);

        let mut buf = [0u8; 4];
        assert_eq!(read_end.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ABCD");
    }

    #[test_case]
    fn eof_after_writer_closes() {
        let (read_end, write_end) = create(None);
        write_end.write(b"xy").unwrap();
        drop(write_end);

        let mut buf = [0u8; 8];
        assert_eq!(read_end.read(&mut buf).unwrap(), 2);
        assert_eq!(read_end.read(&mut buf).unwrap(), 0);
    }

    #[test_case]
    fn broken_pipe_on_closed_reader() {
        let (read_end, write_end) = create(None);
        drop(read_end);
        assert_eq!(write_end.write(b"z").unwrap_err(), FsError::BrokenPipe);
    }
}
