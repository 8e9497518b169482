//! Utilities
//!
//! Environment hygiene, bounded output collection, and thread role markers.

pub mod env_hygiene;
pub mod output;
pub mod thread_role;
