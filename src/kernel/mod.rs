//! Thin wrappers around Unix process primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod process;
pub mod signal;
