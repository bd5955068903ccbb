//! Transactional ordered KV backend contract
//!
//! The storage engine delegates all coordination to the backend's
//! serializable transactions. The contract mirrors the constraints that
//! shape every algorithm above it: a 5-second transaction window, 10 MB of
//! writes per transaction, 100 kB per value, ordered keys, and atomic
//! multi-key commit. Operations that need more than one window checkpoint
//! and re-open a transaction.

mod memory;

pub use memory::MemoryBackend;

use crate::{config, Result, RingError};
use std::time::{Duration, Instant};

/// Longest a single transaction may stay open
pub const MAX_TXN_DURATION: Duration = Duration::from_secs(5);

/// Write bytes (keys + values) a single transaction may buffer
pub const MAX_TXN_BYTES: usize = 10_000_000;

/// Largest value accepted for a single key
pub const MAX_VALUE_BYTES: usize = 100_000;

/// Backend failure modes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// A concurrent commit invalidated this transaction's reads
    #[error("transaction conflict")]
    CommitConflict,

    /// The transaction outlived the backend's time window
    #[error("transaction too old")]
    TransactionTooOld,

    #[error("value of {0} bytes exceeds the per-value limit")]
    ValueTooLarge(usize),

    #[error("transaction of {0} bytes exceeds the per-transaction limit")]
    TransactionTooLarge(usize),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend corruption: {0}")]
    Corruption(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::CommitConflict
                | BackendError::TransactionTooOld
                | BackendError::Unavailable(_)
        )
    }
}

impl From<BackendError> for RingError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Corruption(msg) => RingError::BackendFatal(msg),
            BackendError::ValueTooLarge(_) | BackendError::TransactionTooLarge(_) => {
                RingError::BackendFatal(err.to_string())
            }
            other if other.is_retryable() => RingError::BackendTransient(other.to_string()),
            other => RingError::BackendFatal(other.to_string()),
        }
    }
}

/// A key/value pair returned by range reads
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Handle to a transactional ordered KV store
pub trait Backend: Send + Sync + 'static {
    /// Open a new transaction against the current committed state
    fn transaction(&self) -> Result<Box<dyn Transaction + '_>>;
}

/// A single serializable transaction
///
/// Reads observe one snapshot. Writes are buffered and applied atomically at
/// commit; a transaction that is dropped without commit has no effect.
pub trait Transaction {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Ordered scan of `[start, end)`, at most `limit` pairs
    fn get_range(&mut self, start: &[u8], end: &[u8], limit: usize) -> Result<Vec<KeyValue>>;

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, start: &[u8], end: &[u8]);

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Deadline for a logical operation spanning one or more transactions
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Self { at: Instant::now() + duration }
    }

    pub fn default_op() -> Self {
        Self::after(Duration::from_secs(config::DEFAULT_OP_TIMEOUT_SECS))
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Run `f` in fresh transactions until it commits, retrying transient
/// failures with exponential backoff up to `config::MAX_RETRIES` attempts
/// or the deadline, whichever comes first.
pub fn retrying<B, T, F>(backend: &B, deadline: Deadline, mut f: F) -> Result<T>
where
    B: Backend + ?Sized,
    F: FnMut(&mut dyn Transaction) -> Result<T>,
{
    let mut attempt = 0u32;
    loop {
        let result: Result<T> = (|| {
            let mut txn = backend.transaction()?;
            let value = f(txn.as_mut())?;
            txn.commit()?;
            Ok(value)
        })();
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                attempt += 1;
                if attempt >= config::MAX_RETRIES || deadline.expired() {
                    return Err(err);
                }
                let delay = config::RETRY_BASE_DELAY_MS << attempt.min(6);
                tracing::warn!(attempt, delay_ms = delay, error = %err, "retrying backend transaction");
                std::thread::sleep(Duration::from_millis(delay));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_mapping() {
        let err: RingError = BackendError::CommitConflict.into();
        assert!(err.is_retryable());
        let err: RingError = BackendError::Corruption("bad record".into()).into();
        assert!(matches!(err, RingError::BackendFatal(_)));
    }

    #[test]
    fn test_retrying_commits_once() {
        let backend = MemoryBackend::new();
        let calls = std::cell::Cell::new(0);
        let out = retrying(&backend, Deadline::default_op(), |txn| {
            calls.set(calls.get() + 1);
            txn.set(b"k", b"v")?;
            Ok(7)
        })
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.get(), 1);

        let mut txn = backend.transaction().unwrap();
        assert_eq!(txn.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_retrying_gives_up_on_fatal() {
        let backend = MemoryBackend::new();
        let err = retrying::<_, (), _>(&backend, Deadline::default_op(), |_txn| {
            Err(RingError::BackendFatal("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, RingError::BackendFatal(_)));
    }
}
