//! Pending-request registry
//!
//! The backend protocol has no request ids of its own, so each request gets a
//! cookie: an id plus a buffer that collects reply items until the backend
//! signals end-of-list or failure. The waiting caller holds a [`Cookie`] and
//! blocks on a one-shot channel; the drain thread feeds the registry.
//!
//! An entry leaves the registry exactly once: the terminal signal removes it,
//! and the `Cookie` drop guard removes it when the wait times out or the
//! caller bails out early.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::pulse::types::InfoItem;

/// Correlation id carried by a request and its replies
pub type CookieId = u64;

/// Terminal outcome delivered to the waiter
#[derive(Debug)]
enum Outcome {
    Done(Vec<InfoItem>),
    Failed,
}

/// Why a wait did not produce items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// The backend signalled failure
    Failed,
    /// No terminal signal within the timeout
    Timeout,
}

struct Pending {
    items: Vec<InfoItem>,
    done: Sender<Outcome>,
}

/// Registry of in-flight requests
pub struct CookieJar {
    next_id: AtomicU64,
    pending: DashMap<CookieId, Pending>,
}

impl CookieJar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        })
    }

    /// Allocate a fresh entry
    pub fn create(self: &Arc<Self>) -> Cookie {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (done, rx) = bounded(1);
        self.pending.insert(
            id,
            Pending {
                items: Vec::new(),
                done,
            },
        );

        Cookie {
            id,
            jar: Arc::clone(self),
            rx,
        }
    }

    /// Append one reply item
    pub fn feed(&self, id: CookieId, item: InfoItem) {
        match self.pending.get_mut(&id) {
            Some(mut entry) => entry.items.push(item),
            None => tracing::warn!("Reply item for unknown cookie {}", id),
        }
    }

    /// Complete the entry successfully with whatever was fed so far
    pub fn end_of_list(&self, id: CookieId) {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                let _ = entry.done.send(Outcome::Done(entry.items));
            }
            None => tracing::warn!("End of list for unknown cookie {}", id),
        }
    }

    /// Complete the entry with a failure, discarding partial items
    pub fn failed(&self, id: CookieId) {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                let _ = entry.done.send(Outcome::Failed);
            }
            None => tracing::warn!("Failure for unknown cookie {}", id),
        }
    }

    /// Number of outstanding entries
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Caller-side handle of one pending request
pub struct Cookie {
    id: CookieId,
    jar: Arc<CookieJar>,
    rx: Receiver<Outcome>,
}

impl Cookie {
    pub fn id(&self) -> CookieId {
        self.id
    }

    /// Block until the request completes, returning every item
    pub fn reply_list(self, timeout: Duration) -> Result<Vec<InfoItem>, ReplyError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Outcome::Done(items)) => Ok(items),
            Ok(Outcome::Failed) => Err(ReplyError::Failed),
            Err(RecvTimeoutError::Timeout) => Err(ReplyError::Timeout),
            // Sender dropped without a terminal send: treat as failure
            Err(RecvTimeoutError::Disconnected) => Err(ReplyError::Failed),
        }
    }

    /// Block until the request completes, returning the first item if any
    pub fn reply(self, timeout: Duration) -> Result<Option<InfoItem>, ReplyError> {
        Ok(self.reply_list(timeout)?.into_iter().next())
    }
}

impl Drop for Cookie {
    fn drop(&mut self) {
        self.jar.pending.remove(&self.id);
    }
}
