//! Bookkeeping for calls that were sent but not yet answered.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use stdrpc_core::{Error, Result};
use tokio::sync::oneshot;

type Reply = Result<Value>;

#[derive(Default)]
struct Table {
    calls: HashMap<u64, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Outstanding calls keyed by request id.
///
/// Once closed, every waiting call has been failed and new registrations are
/// refused, so no call can slip in after the session ended and wait forever.
#[derive(Default)]
pub(crate) struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<Reply>> {
        let mut table = self.lock();
        if table.closed {
            return Err(Error::ProcessTerminated);
        }
        let (tx, rx) = oneshot::channel();
        table.calls.insert(id, tx);
        Ok(rx)
    }

    /// Hand a reply to the call waiting on `id`.
    ///
    /// Returns false when nobody waits for it (late reply for an abandoned
    /// call, or an id this client never sent).
    pub fn complete(&self, id: u64, reply: Reply) -> bool {
        let sender = self.lock().calls.remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Fail every outstanding call, leaving the table open.
    pub fn fail_all(&self, make_err: impl Fn() -> Error) -> usize {
        let drained: Vec<_> = self.lock().calls.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_err()));
        }
        count
    }

    /// Fail every outstanding call with [`Error::ProcessTerminated`] and
    /// refuse new ones.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut table = self.lock();
            table.closed = true;
            table.calls.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ProcessTerminated));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }
}

/// Removes its call from the table when dropped, so a call abandoned by
/// timeout or by its caller leaves nothing behind.
pub(crate) struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    pub fn new(pending: &'a PendingCalls, id: u64) -> Self {
        Self { pending, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}
