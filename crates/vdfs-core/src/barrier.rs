//! Transaction barrier.
//!
//! Every metadata-modifying call chain holds the barrier shared for its
//! whole duration; `sync` takes it exclusively so no mutation is in flight
//! while a generation is committed. Shared entry is reentrant per thread:
//! only the outermost [`TransactionBarrier::start`] touches the lock, nested
//! ones bump a per-thread depth.

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use vdfs_error::{Fault, Result};

#[derive(Debug, Default)]
pub struct TransactionBarrier {
    lock: RwLock<()>,
    depth: Mutex<HashMap<ThreadId, u32>>,
}

/// A running transaction; dropping it ends it.
#[must_use = "the transaction ends when this guard is dropped"]
pub struct Transaction<'a> {
    barrier: &'a TransactionBarrier,
    _shared: Option<RwLockReadGuard<'a, ()>>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("outermost", &self._shared.is_some())
            .finish()
    }
}

impl TransactionBarrier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) -> bool {
        let mut depth = self.depth.lock();
        let count = depth.entry(thread::current().id()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Begin a transaction, waiting for a running commit to finish.
    pub fn start(&self) -> Transaction<'_> {
        let outermost = self.enter();
        Transaction {
            barrier: self,
            _shared: outermost.then(|| self.lock.read()),
        }
    }

    /// Begin a transaction unless a commit holds or is waiting for the
    /// barrier, in which case [`Fault::Interrupted`] is returned.
    pub fn try_start(&self) -> Result<Transaction<'_>> {
        if self.in_transaction() {
            return Ok(self.start());
        }
        let shared = self.lock.try_read().ok_or(Fault::Interrupted)?;
        self.enter();
        Ok(Transaction {
            barrier: self,
            _shared: Some(shared),
        })
    }

    /// Whether the calling thread is inside a transaction.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.depth.lock().contains_key(&thread::current().id())
    }

    /// Transactions currently open across all threads.
    #[must_use]
    pub fn active(&self) -> usize {
        self.depth.lock().len()
    }

    /// Wait until no transaction is running and keep new ones out.
    ///
    /// Calling it from inside a transaction would wait on itself and is
    /// rejected.
    pub fn exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        if self.in_transaction() {
            return Err(Fault::InvalidArgument(
                "commit requested from inside a transaction".to_owned(),
            ));
        }
        Ok(self.lock.write())
    }

    fn leave(&self) {
        let mut depth = self.depth.lock();
        let id = thread::current().id();
        if let Some(count) = depth.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                depth.remove(&id);
            }
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.barrier.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn nested_starts_share_one_registration() {
        let barrier = TransactionBarrier::new();
        let outer = barrier.start();
        {
            let _inner = barrier.start();
            assert!(barrier.in_transaction());
            assert_eq!(barrier.active(), 1);
        }
        assert!(barrier.in_transaction());
        assert!(matches!(barrier.exclusive(), Err(Fault::InvalidArgument(_))));
        drop(outer);
        assert!(!barrier.in_transaction());
        assert!(barrier.exclusive().is_ok());
    }

    #[test]
    fn try_start_loses_to_a_commit() {
        let barrier = TransactionBarrier::new();
        let commit = barrier.exclusive().expect("exclusive");
        assert!(matches!(barrier.try_start(), Err(Fault::Interrupted)));
        assert!(!barrier.in_transaction());
        drop(commit);
        let _txn = barrier.try_start().expect("start");
    }

    #[test]
    fn commit_waits_for_running_transactions() {
        let barrier = Arc::new(TransactionBarrier::new());
        let committed = Arc::new(AtomicBool::new(false));
        let txn = barrier.start();
        let handle = {
            let barrier = Arc::clone(&barrier);
            let committed = Arc::clone(&committed);
            std::thread::spawn(move || {
                let _guard = barrier.exclusive().expect("exclusive");
                committed.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!committed.load(Ordering::SeqCst));
        drop(txn);
        handle.join().expect("join");
        assert!(committed.load(Ordering::SeqCst));
    }
}
