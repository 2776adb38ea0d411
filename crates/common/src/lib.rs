//! Common types for the bucket credential workspace

mod error;
mod token;

pub use error::{Error, Result};
pub use token::{BEARER, OAuthToken, now_millis, now_secs};
