//! Shared building blocks for the upstream gateway workspace
//!
//! - `Secret` keeps credential material out of Debug/Display output
//! - `redact` scrubs credential-shaped substrings from free text (log lines,
//!   upstream error bodies)
//! - `Error` covers configuration loading

mod error;
pub mod redact;
mod secret;

pub use error::{Error, Result};
pub use redact::{RedactingMakeWriter, redact};
pub use secret::Secret;
