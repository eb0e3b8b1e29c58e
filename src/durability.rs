//! Write-through JSON-lines logs with `fdatasync` on every append.

pub mod log;

pub use self::log::{DurabilityLogError, JsonLinesLog};
