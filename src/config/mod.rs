//! Configuration and shared types
//!
//! Launcher settings, URI redirection, and the error taxonomy.

pub mod settings;
pub mod types;
pub mod url_map;
