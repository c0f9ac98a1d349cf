//! Broadcast streams of fixed 8-byte event records (input devices). Every
//! open file keeps its own cursor; slow readers lose the oldest records.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;

use cairn_abi::io::PollEvents;

use crate::fs::{File, FileOps, FileRef, FsResult, PollReady, Volume};
use crate::utils::locks::IrqMutex;
use crate::wait::{WaitQueue, WaitResult};
use crate::wait_until_locked;

pub const RECORD_SIZE: usize = 8;
const STREAM_CAPACITY: usize = 256;

pub type Record = [u8; RECORD_SIZE];

struct StreamInner {
    records: VecDeque<(u64, Record)>,
    next_seq: u64,
}

pub struct EventStream {
    inner: IrqMutex<StreamInner>,
    queue: WaitQueue,
}

impl EventStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: IrqMutex::new(StreamInner {
                records: VecDeque::new(),
                next_seq: 0,
            }),
            queue: WaitQueue::new(),
        })
    }

    /// Publishes a record to every reader. Safe from trap context.
    pub fn push(&self, record: Record) {
        {
            let mut inner = self.inner.lock();
            if inner.records.len() == STREAM_CAPACITY {
                inner.records.pop_front();
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.records.push_back((seq, record));
        }
        self.queue.wake_all();
    }

    /// A file whose position is its read cursor.
    pub fn open(self: &Arc<Self>, volume: Option<Arc<Volume>>) -> FileRef {
        let file = File::new(
            volume,
            Box::new(StreamFileOps {
                stream: self.clone(),
            }),
        );
        // start at the live end, not the backlog
        file.set_position(self.inner.lock().next_seq);
        file
    }
}

struct StreamFileOps {
    stream: Arc<EventStream>,
}

impl StreamFileOps {
    /// Copies records at sequence `cursor` onward; returns bytes copied and
    /// the advanced cursor.
    fn drain(inner: &StreamInner, cursor: u64, out: &mut [u8]) -> (usize, u64) {
        let mut copied = 0;
        let mut cursor = cursor;
        for (seq, record) in &inner.records {
            if *seq < cursor {
                continue;
            }
            if copied + RECORD_SIZE > out.len() {
                break;
            }
            out[copied..copied + RECORD_SIZE].copy_from_slice(record);
            copied += RECORD_SIZE;
            cursor = seq + 1;
        }
        (copied, cursor)
    }
}

impl FileOps for StreamFileOps {
    fn read(&self, file: &File, out: &mut [u8]) -> FsResult<usize> {
        if out.len() < RECORD_SIZE {
            return Ok(0);
        }

        let mut guard = self.stream.inner.lock();
        let result = wait_until_locked!(
            &self.stream.queue,
            guard,
            guard.next_seq > file.position()
        );
        if result != WaitResult::Norm {
            return Ok(0);
        }

        let (copied, cursor) = Self::drain(&guard, file.position(), out);
        file.set_position(cursor);
        Ok(copied)
    }

    fn poll(&self, file: &File, _requested: PollEvents) -> FsResult<PollReady> {
        let guard = self.stream.inner.lock();
        let ready = if guard.next_seq > file.position() {
            PollEvents::READ
        } else {
            PollEvents::empty()
        };
        drop(guard);
        Ok(PollReady {
            ready,
            queue: Some(self.stream.queue.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn records_reach_every_open_cursor() {
        let stream = EventStream::new();
        let a = stream.open(None);
        let b = stream.open(None);

        stream.push(*b"keydown!");

        let mut buf = [0u8; RECORD_SIZE];
        assert_eq!(a.read(&mut buf).unwrap(), RECORD_SIZE);
        assert_eq!(&buf, b"keydown!");
        assert_eq!(b.read(&mut buf).unwrap(), RECORD_SIZE);
    }

    #[test_case]
    fn poll_reports_pending_records() {
        let stream = EventStream::new();
        let file = stream.open(None);

        let report = file.poll(PollEvents::READ).unwrap();
        assert!(report.ready.is_empty());

        stream.push([7; RECORD_SIZE]);
        let report = file.poll(PollEvents::READ).unwrap();
        assert!(report.ready.contains(PollEvents::READ));
    }
}
