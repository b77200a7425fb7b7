//! API key pool with rotation for the generative-AI service
//!
//! Holds a set of API keys (user-supplied or system-supplied), hands them out
//! round-robin, and wraps every outbound call so that a failing key is
//! skipped in favour of the next one. Failures are classified from the error
//! message:
//!
//! 1. Authorization failure (key rejected) → key marked `Invalid`, next key tried
//! 2. Transient failure (rate limit, quota, 5xx) → next key tried, key stays `Active`
//! 3. Anything else → returned to the caller unchanged, no further keys tried
//! 4. Every active key failed → `RotationError::Exhausted`, telling the caller
//!    whether the user's own keys or the system keys ran out
//!
//! Invalid keys stay invalid until the pool is rebuilt (the user saves a new
//! key list). Same-key retry with exponential backoff and a minimum-interval
//! throttle are separate layers that call sites opt into.

pub mod backoff;
pub mod classify;
pub mod error;
pub mod pool;
pub mod rotation;
pub mod store;
pub mod throttle;

pub use backoff::{RetryPolicy, retry_with_backoff};
pub use classify::{FailureClass, FailureClassifier, KeyFailure};
pub use error::{Error, Result};
pub use pool::{Credential, KeyPool, KeySource, KeyStatus, normalize_keys, parse_key_list};
pub use rotation::{AggregateFailure, RotationError, Rotator};
pub use store::{KeyStore, MAX_USER_KEYS};
pub use throttle::Throttle;
