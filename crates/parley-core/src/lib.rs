//! Foundational low-level utilities shared across Parley crates.
//!
//! Provides wall-clock helpers used by shared stores and text helpers used by
//! admission keys and delivery diagnostics.

pub mod text_utils;
pub mod time_utils;

pub use text_utils::{casefold_trimmed, truncate_for_error};
pub use time_utils::{current_unix_timestamp_ms, duration_to_ms};
