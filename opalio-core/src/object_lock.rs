use crate::error::{OpalError, Result};
use crate::object_id::ObjectId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Identity of an execution context holding or awaiting object locks.
///
/// Tasks have no usable thread identity, so reentrancy is tracked against
/// an explicit token minted once per inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

struct LockEntry {
    owner: ContextId,
    count: u64,
    waiters: VecDeque<WaitingContext>,
}

struct WaitingContext {
    context: ContextId,
    notify: Arc<Notify>,
}

/// Undoes a queued wait if the waiting future is dropped before the lock
/// is granted. Forgotten on successful acquisition.
struct WaiterGuard<'a> {
    manager: &'a LockManager,
    context: ContextId,
    object_id: ObjectId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.manager.entries.lock().expect("lock map poisoned");
        let Some(entry) = entries.get_mut(&self.object_id) else {
            return;
        };
        if entry.owner == self.context {
            // Ownership was handed to us while we were being cancelled;
            // pass it straight on.
            match entry.waiters.pop_front() {
                Some(next) => {
                    entry.owner = next.context;
                    entry.count = 1;
                    next.notify.notify_one();
                }
                None => {
                    entries.remove(&self.object_id);
                }
            }
        } else {
            entry
                .waiters
                .retain(|waiter| waiter.context != self.context);
        }
    }
}

/// Per-object-id advisory mutual exclusion, reentrant for the owning
/// context, FIFO for contenders.
///
/// The map itself is guarded by one coarse mutex, independent of the locks
/// it grants. Ownership transfers directly to the front waiter on release,
/// so a newly arriving context cannot barge past the queue.
pub struct LockManager {
    entries: Mutex<HashMap<ObjectId, LockEntry>>,
    next_context: AtomicU64,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_context: AtomicU64::new(1),
        }
    }

    /// Mint a fresh context identity for one execution context.
    pub fn next_context(&self) -> ContextId {
        ContextId(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    /// Acquire the lock on `object_id`, waiting until granted.
    ///
    /// Reentrant: a context that already holds the lock increments a
    /// counter and returns immediately. There is no acquire timeout;
    /// [`LockManager::try_lock`] is the non-blocking variant.
    pub async fn lock(&self, context: ContextId, object_id: ObjectId) {
        let notify = {
            let mut entries = self.entries.lock().expect("lock map poisoned");
            match entries.get_mut(&object_id) {
                None => {
                    entries.insert(
                        object_id,
                        LockEntry {
                            owner: context,
                            count: 1,
                            waiters: VecDeque::new(),
                        },
                    );
                    return;
                }
                Some(entry) if entry.owner == context => {
                    entry.count += 1;
                    return;
                }
                Some(entry) => {
                    let notify = Arc::new(Notify::new());
                    entry.waiters.push_back(WaitingContext {
                        context,
                        notify: Arc::clone(&notify),
                    });
                    notify
                }
            }
        };

        // If this future is dropped mid-wait, the guard dequeues us (or
        // passes on an ownership handoff that raced the cancellation).
        let guard = WaiterGuard {
            manager: self,
            context,
            object_id,
        };
        // Ownership is transferred to us before the notification fires.
        notify.notified().await;
        std::mem::forget(guard);
    }

    /// Acquire the lock if it is free or already held by `context`.
    /// Returns false without queuing when another context holds it.
    pub fn try_lock(&self, context: ContextId, object_id: ObjectId) -> bool {
        let mut entries = self.entries.lock().expect("lock map poisoned");
        match entries.get_mut(&object_id) {
            None => {
                entries.insert(
                    object_id,
                    LockEntry {
                        owner: context,
                        count: 1,
                        waiters: VecDeque::new(),
                    },
                );
                true
            }
            Some(entry) if entry.owner == context => {
                entry.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one hold on `object_id`. The lock passes to the next queued
    /// waiter once the reentrancy count reaches zero.
    pub fn unlock(&self, context: ContextId, object_id: ObjectId) -> Result<()> {
        let mut entries = self.entries.lock().expect("lock map poisoned");
        let entry = entries
            .get_mut(&object_id)
            .filter(|entry| entry.owner == context)
            .ok_or(OpalError::NotLocked(object_id))?;

        entry.count -= 1;
        if entry.count > 0 {
            return Ok(());
        }

        match entry.waiters.pop_front() {
            Some(next) => {
                entry.owner = next.context;
                entry.count = 1;
                next.notify.notify_one();
            }
            None => {
                entries.remove(&object_id);
            }
        }
        Ok(())
    }

    /// Assert that `context` currently holds the lock on `object_id`.
    pub fn assert_held(&self, context: ContextId, object_id: ObjectId) -> Result<()> {
        let entries = self.entries.lock().expect("lock map poisoned");
        match entries.get(&object_id) {
            Some(entry) if entry.owner == context => Ok(()),
            _ => Err(OpalError::NotLocked(object_id)),
        }
    }

    pub fn is_locked(&self, object_id: ObjectId) -> bool {
        self.entries
            .lock()
            .expect("lock map poisoned")
            .contains_key(&object_id)
    }
}
