//! Correlation table: pending replies by correlation key

use crate::error::{Error, Result};
use crate::message::{Reply, Response};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Pending replies keyed by correlation key.
///
/// A key is present exactly while a `sendrecv` for it is waiting. Callers
/// insert and remove their own entries; the receive worker only looks
/// entries up, except when it fails and fans the failure out.
pub(crate) struct ResponseTable<R> {
    entries: Mutex<HashMap<u64, Arc<Reply<R>>>>,
}

impl<R: Response> ResponseTable<R> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(10)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Arc<Reply<R>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub(crate) fn get(&self, key: u64) -> Option<Arc<Reply<R>>> {
        self.entries().get(&key).cloned()
    }

    fn insert(&self, key: u64, reply: Arc<Reply<R>>) -> Result<()> {
        let mut entries = self.entries();
        if entries.contains_key(&key) {
            return Err(Error::DuplicateKey(key));
        }
        entries.insert(key, reply);
        Ok(())
    }

    /// Remove `key` only if it still maps to `reply`
    fn remove_if_same(&self, key: u64, reply: &Arc<Reply<R>>) {
        let mut entries = self.entries();
        if entries
            .get(&key)
            .map_or(false, |current| Arc::ptr_eq(current, reply))
        {
            entries.remove(&key);
        }
    }

    /// Wake every waiter so each can check its own deadline
    pub(crate) fn wake_all(&self) {
        let pending: Vec<_> = self.entries().values().cloned().collect();
        for reply in pending {
            reply.wake();
        }
    }

    /// Deliver `cause` to every pending reply and clear the table
    pub(crate) fn fail_all(&self, cause: Arc<Error>) -> usize {
        let drained: Vec<_> = self.entries().drain().map(|(_, reply)| reply).collect();
        for reply in &drained {
            reply.fail(cause.clone());
        }
        drained.len()
    }
}

/// Table entries owned by one `sendrecv` call.
///
/// Dropping the registration removes every entry it added, on success,
/// error, early return and cancellation alike.
pub(crate) struct Registration<'a, R: Response> {
    table: &'a ResponseTable<R>,
    entries: Vec<(u64, Arc<Reply<R>>)>,
}

impl<'a, R: Response> Registration<'a, R> {
    pub(crate) fn new(table: &'a ResponseTable<R>) -> Self {
        Self {
            table,
            entries: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, key: u64, reply: &Arc<Reply<R>>) -> Result<()> {
        self.table.insert(key, reply.clone())?;
        self.entries.push((key, reply.clone()));
        Ok(())
    }
}

impl<R: Response> Drop for Registration<'_, R> {
    fn drop(&mut self) {
        for (key, reply) in &self.entries {
            self.table.remove_if_same(*key, reply);
        }
    }
}
