//! Reading cache
//!
//! Holds the freshest known-good reading and a short history of recent
//! readings, and keeps the statistics that describe how stale the data we
//! send is and how often delivery succeeds.

mod buffer;
mod stats;

pub use buffer::{CacheBuffer, CacheConfig, CacheSnapshot, MAX_BUFFER_CAPACITY};
pub use stats::TransmissionStats;
