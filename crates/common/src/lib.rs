//! Shared types for the studio workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
