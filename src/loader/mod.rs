//! Isolated loading of game archives
//!
//! - [`archive`]: container decoding into an in-memory table
//! - [`isolated`]: per-game loader with host-namespace refusal
//! - [`scratch`]: ledger of materialized temp files

pub mod archive;
pub mod isolated;
pub mod scratch;

pub use isolated::{HostRuntimeDir, IsolatedLoader, NoTrustedLookup, TrustedLookup};
