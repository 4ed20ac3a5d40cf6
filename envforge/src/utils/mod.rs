//! Utility functions for timestamps and hashing.

mod digest;
pub mod timestamps;

pub use digest::{sha256_file, sha256_hex, stable_seed};
pub use timestamps::{format_iso8601, iso_timestamp, now_utc, Timestamp};
