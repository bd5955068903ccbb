//! KV codec: tuple keys and fixed-schema value records
//!
//! Keys are length-unambiguous tuples whose byte order matches tuple order,
//! so every key family supports range scans. Values are fixed-schema binary
//! records with constant per-sample size, keeping disk usage at
//! `num_metrics * slots * record_size`.

mod key;
mod record;

pub use key::*;
pub use record::*;

/// Key family tags; stable on-disk compatibility contracts
pub mod family {
    /// `(0,)` metric-id allocation counter
    pub const ID_COUNTER: u64 = 0;
    /// `(1, metric_id, slot)` sample slots
    pub const SAMPLE: u64 = 1;
    /// `(2, metric_id)` metric descriptors
    pub const DESCRIPTOR: u64 = 2;
    /// `(3, metric_id)` counter state
    pub const COUNTER_STATE: u64 = 3;
    /// `(4, name, metric_id)` name index
    pub const NAME_INDEX: u64 = 4;
    /// `(5, name, tag_key, tag_value, metric_id)` tag index
    pub const TAG_INDEX: u64 = 5;
    /// `(6, slug)` opaque dashboard blobs
    pub const DASHBOARD: u64 = 6;
}
