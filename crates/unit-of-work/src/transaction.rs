//! Transaction manager seam and in-memory implementations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::TransactionError;

/// Opaque handle identifying a transaction started by a
/// [`TransactionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(u64);

impl TransactionHandle {
    /// Creates a handle from a raw identifier.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Manages the external transactions a unit of work or a replay can be
/// bound to. Implementations must be thread-safe.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Starts a new transaction and returns its handle.
    async fn start_transaction(&self) -> Result<TransactionHandle, TransactionError>;

    /// Commits the transaction identified by `handle`.
    async fn commit_transaction(&self, handle: TransactionHandle) -> Result<(), TransactionError>;

    /// Rolls back the transaction identified by `handle`.
    async fn rollback_transaction(&self, handle: TransactionHandle)
    -> Result<(), TransactionError>;
}

/// Transaction manager for setups without a transactional resource.
///
/// Hands out fresh handles and treats commit and rollback as no-ops.
#[derive(Debug, Default)]
pub struct NoTransactionManager {
    next_id: AtomicU64,
}

impl NoTransactionManager {
    /// Creates a new no-op transaction manager.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionManager for NoTransactionManager {
    async fn start_transaction(&self) -> Result<TransactionHandle, TransactionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(TransactionHandle::new(id))
    }

    async fn commit_transaction(&self, _handle: TransactionHandle) -> Result<(), TransactionError> {
        Ok(())
    }

    async fn rollback_transaction(
        &self,
        _handle: TransactionHandle,
    ) -> Result<(), TransactionError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecorderState {
    next_id: u64,
    active: HashSet<u64>,
    committed: Vec<u64>,
    rolled_back: Vec<u64>,
}

/// In-memory transaction manager that records every commit and rollback.
///
/// Cloning shares the underlying record.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransactionManager {
    inner: Arc<Mutex<RecorderState>>,
}

impl RecordingTransactionManager {
    /// Creates a new recording transaction manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed transactions so far.
    pub fn commit_count(&self) -> usize {
        self.lock().committed.len()
    }

    /// Number of rolled-back transactions so far.
    pub fn rollback_count(&self) -> usize {
        self.lock().rolled_back.len()
    }

    /// Number of transactions started but neither committed nor rolled back.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RecorderState> {
        self.inner.lock().expect("transaction recorder lock poisoned")
    }
}

#[async_trait]
impl TransactionManager for RecordingTransactionManager {
    async fn start_transaction(&self) -> Result<TransactionHandle, TransactionError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.active.insert(id);
        Ok(TransactionHandle::new(id))
    }

    async fn commit_transaction(&self, handle: TransactionHandle) -> Result<(), TransactionError> {
        let mut state = self.lock();
        if !state.active.remove(&handle.id()) {
            return Err(TransactionError::UnknownHandle(handle));
        }
        state.committed.push(handle.id());
        Ok(())
    }

    async fn rollback_transaction(
        &self,
        handle: TransactionHandle,
    ) -> Result<(), TransactionError> {
        let mut state = self.lock();
        if !state.active.remove(&handle.id()) {
            return Err(TransactionError::UnknownHandle(handle));
        }
        state.rolled_back.push(handle.id());
        Ok(())
    }
}
