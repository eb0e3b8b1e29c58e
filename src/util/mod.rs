//! Shared helpers (clocks, retry policies, the umbrella error).

pub mod clock;
pub mod error;
pub mod retry;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{RetentionError, SerializationError};
pub use retry::{retry_async, RetryHandle, RetryPolicy, RetryStrategy};
