//! RingDB Core - Bounded Time-Series Storage Engine
//!
//! A time-series database whose defining property is bounded storage by
//! construction: a fixed, per-metric ring of slots in a transactional
//! ordered key-value store, overwritten in place.
//!
//! # Architecture
//!
//! - **Codec**: tuple keys and fixed-schema value records
//! - **Backend**: transactional ordered KV contract plus an in-memory implementation
//! - **Registry**: metric descriptors, name/tag indexes, id allocation
//! - **Ring**: slot math, overwrite-in-place writes, bounded range reads
//! - **Counter**: cumulative-counter ingest and advisory last-state
//! - **Query**: vectorised SQL layer over the `samples`/`metrics`/`metric_tags`
//!   virtual tables, extended with time-series UDFs

pub mod backend;
pub mod codec;
pub mod counter;
pub mod dashboards;
pub mod query;
pub mod registry;
pub mod ring;
pub mod store;

mod error;
mod types;

pub use error::{Result, RingError};
pub use store::Tsdb;
pub use types::*;

/// RingDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Default sampling interval in seconds
    pub const DEFAULT_STEP: u32 = 1;

    /// Default ring length (one hour at the default step)
    pub const DEFAULT_SLOTS: u32 = 3600;

    /// Upper bound on `step * slots` accepted at metric creation
    pub const MAX_RETENTION_WINDOW_SECS: u64 = 366 * 86_400;

    /// Rows fetched per backend range read before the scan checkpoints
    pub const SCAN_BATCH_ROWS: usize = 10_000;

    /// Slots cleared per transaction during delete and retention rewrite
    pub const CLEAR_BATCH_SLOTS: u32 = 50_000;

    /// Samples replayed per transaction during retention rewrite
    pub const REWRITE_BATCH_SAMPLES: usize = 25_000;

    /// Default page size for registry lookups
    pub const DEFAULT_LOOKUP_LIMIT: usize = 200;

    /// Hard cap on registry lookup pages
    pub const MAX_LOOKUP_LIMIT: usize = 2_000;

    /// Cap on metrics a single query selector may match
    pub const MAX_SELECTOR_MATCHES: usize = 500;

    /// Cap on rows a query may return
    pub const MAX_RESULT_ROWS: usize = 100_000;

    /// Attempts for retryable backend errors
    pub const MAX_RETRIES: u32 = 5;

    /// Base delay for exponential backoff between retries
    pub const RETRY_BASE_DELAY_MS: u64 = 10;

    /// Default deadline for a single storage operation
    pub const DEFAULT_OP_TIMEOUT_SECS: u64 = 30;
}
