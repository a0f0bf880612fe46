//! Foundational low-level utilities shared across kite crates.
//!
//! Provides the clock abstraction used by windowed analysis and rate limiting,
//! prefixed identifier generation, and deterministic dedup key hashing.

pub mod clock;
pub mod ids;
pub mod time_utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ids::{dedup_key, new_id};
pub use time_utils::{current_unix_timestamp_ms, duration_to_chrono, truncate_chars};
