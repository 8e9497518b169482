//! Resource cache
//!
//! Maps remote identifiers to local slot files, tracks freshness and
//! parent/child invalidation, and persists its index after every mutation.

pub mod fetch;
pub mod index;
pub mod lock;
pub mod populate;
pub mod resource;
pub mod store;

pub use resource::{CachedRead, Resource};
pub use store::{Cache, CacheOptions};
