//! File hand-off between processes: `share` publishes an open file under a
//! fresh key and waits for a `claim`; the key travels out of band (a pipe,
//! shared memory, argv).

use core::sync::atomic::{AtomicU64, Ordering};

use cairn_abi::Clocks;
use cairn_abi::errors::{Errno, SysResult};
use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::fs::FileRef;
use crate::utils::locks::Mutex;
use crate::wait::{WaitQueue, WaitResult};
use crate::wait_until;

struct SharedEntry {
    file: FileRef,
    claimed_queue: WaitQueue,
}

lazy_static! {
    static ref SHARED: Mutex<HashMap<u64, SharedEntry>> = Mutex::new(HashMap::new());
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Publishes `file` and blocks until it is claimed or the timeout passes.
/// `key` is written before blocking so the caller's peer can learn it.
pub fn share(file: FileRef, key_out: &mut u64, timeout: Clocks) -> SysResult<()> {
    let key = NEXT_KEY.fetch_add(1, Ordering::SeqCst);
    let queue = WaitQueue::new();

    SHARED.lock().insert(
        key,
        SharedEntry {
            file,
            claimed_queue: queue.clone(),
        },
    );
    *key_out = key;

    let result = wait_until!(&queue, !SHARED.lock().contains_key(&key), timeout);
    match result {
        WaitResult::Timeout => {
            // claim may still have won the race right at the deadline
            if SHARED.lock().remove(&key).is_some() {
                Err(Errno::ETIMEDOUT)
            } else {
                Ok(())
            }
        }
        WaitResult::Dead => Err(Errno::EINTR),
        WaitResult::Error => Err(Errno::ENOMEM),
        WaitResult::Norm => Ok(()),
    }
}

/// Takes the file published under `key`.
pub fn claim(key: u64) -> SysResult<FileRef> {
    let entry = SHARED.lock().remove(&key).ok_or(Errno::ENOENT)?;
    entry.claimed_queue.wake_all();
    Ok(entry.file)
}
