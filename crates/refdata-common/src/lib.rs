//! Refdata Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging setup and file checksums for the refdata
//! workspace members.
//!
//! # Example
//!
//! ```no_run
//! use refdata_common::checksum::sha256_file;
//!
//! fn fingerprint(path: &str) -> refdata_common::Result<String> {
//!     sha256_file(path)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
