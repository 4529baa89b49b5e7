//! Per-repo serialization.
//!
//! Every operation that touches a mirror (sync, git backend, and through the
//! pre-receive callout the whole validate-and-forward protocol) runs under
//! the repo's exclusive slot.  Slots for different repos are independent.
//!
//! The map insert/remove is guarded by a std mutex so acquire and cleanup
//! are atomic; the slot itself is a tokio mutex, whose waiter queue is
//! FIFO-fair.  Entries are refcounted and removed when the last
//! holder or waiter leaves, so the map only holds live repos.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as TokioMutex;

#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    slots: Arc<StdMutex<HashMap<String, Slot>>>,
}

#[derive(Debug)]
struct Slot {
    mutex: Arc<TokioMutex<()>>,
    refs: usize,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` while holding the exclusive slot for `repo`.  The slot
    /// is released on every exit path, including panic and cancellation
    /// while waiting.
    pub async fn with_exclusive<T>(&self, repo: &str, action: impl Future<Output = T>) -> T {
        let mutex = self.checkout(repo);
        // Declared before the guard so the tokio mutex is released first.
        let _release = Release { locks: self, repo };
        let _guard = mutex.lock_owned().await;
        action.await
    }

    fn checkout(&self, repo: &str) -> Arc<TokioMutex<()>> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.entry(repo.to_string()).or_insert_with(|| Slot {
            mutex: Arc::new(TokioMutex::new(())),
            refs: 0,
        });
        slot.refs += 1;
        Arc::clone(&slot.mutex)
    }

    fn release(&self, repo: &str) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(repo) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(repo);
            }
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

struct Release<'a> {
    locks: &'a RepoLocks,
    repo: &'a str,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.locks.release(self.repo);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
