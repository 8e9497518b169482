//! gamebox: sandboxing and lifecycle core for untrusted game binaries
//!
//! Games are downloaded archives whose main entry runs as a child process
//! in its own process group. The launcher keeps at most one game active,
//! mediates everything the game asks of the host, and tears it down in two
//! phases when asked to stop.
//!
//! # Architecture
//!
//! ## Resource Cache ([`cache`])
//! - [`cache::store`]: URI to local slot mapping, freshness, parent/child invalidation
//! - [`cache::index`]: Persisted index with a version check
//! - [`cache::lock`]: Single-instance directory lock
//! - [`cache::fetch`]: HTTP and `file:` downloads
//! - [`cache::populate`]: Prefetching every redirected URI
//!
//! ## Isolated Loader ([`loader`])
//! - [`loader::archive`]: Zip and gzip-tar archive decoding
//! - [`loader::isolated`]: Per-game entry lookup with host-namespace refusal
//! - [`loader::scratch`]: Materialized files tracked for cleanup
//!
//! ## Sandbox Policy Gate ([`sandbox`])
//! - [`sandbox::context`]: Game tokens, execution contexts and attribution
//! - [`sandbox::policy`]: Exit and connection rules
//! - [`sandbox::broker`]: Line protocol between a game and the gate
//! - [`sandbox::resolve`]: Host resolution for origin matching
//! - [`sandbox::unit`]: Execution unit seam
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::process`]: Process-group spawning, `/proc` scanning and signalling
//! - [`kernel::signal`]: Launcher shutdown signals
//!
//! ## Games ([`game`])
//! - [`game::model`]: Game descriptions and launch records
//! - [`game::configuration`]: Per-game configuration and launch environment
//! - [`game::runner`]: Lifecycle state machine
//! - [`game::terminate`]: Two-phase termination sweep
//! - [`game::orchestrator`]: At-most-one active game, plus the watchdog
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured audit events
//!
//! ## Configuration ([`config`])
//! - [`config::settings`]: `config.json` loading and validation
//! - [`config::url_map`]: URI redirection
//! - [`config::types`]: Shared types and the error taxonomy
//!
//! ## Utilities ([`utils`])
//! - [`utils::env_hygiene`]: Launch environment construction
//! - [`utils::output`]: Bounded output collection
//! - [`utils::thread_role`]: Presentation thread marker

// Resource Cache
pub mod cache;

// Isolated Loader
pub mod loader;

// Sandbox Policy Gate
pub mod sandbox;

// Kernel Primitives
pub mod kernel;

// Games
pub mod game;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the gamebox binary.
pub mod cli;

pub use config::types::*;
