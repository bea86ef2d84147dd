//! Caches and configuration for the row preview pipeline
//!
//! - [`TtlCache`]: bounded key/value map with lazy TTL pruning
//! - [`WarmDecodeCache`]: per-row record of the last successfully decoded URL
//! - [`PipelineConfig`]: tunable limits loaded from env, TOML or code

pub mod config;
pub mod ttl;
pub mod warm;

pub use config::{ConfigError, PipelineConfig};
pub use ttl::{CacheStats, TtlCache};
pub use warm::{WarmDecodeCache, WARM_CAPACITY, WARM_TTL};
