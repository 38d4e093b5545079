//! Shared error types, IDs, config loading and small utilities used by
//! every relaybox crate.

pub mod config;
pub mod error;
pub mod hash;
pub mod ids;
pub mod time;

pub use config::Config;
pub use error::{Error, Result};
pub use hash::{json_hash, sha256_hex};
pub use ids::RowId;
pub use time::now_rfc3339;
