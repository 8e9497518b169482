//! Game configuration, lifecycle and orchestration
//!
//! A [`configuration::GameConfiguration`] binds one game to its execution
//! context and loader; a [`runner::LifecycleRunner`] drives it; the
//! [`orchestrator::GameOrchestrator`] keeps at most one game active.

pub mod configuration;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod runner;
pub mod terminate;
#[cfg(test)]
pub(crate) mod testing;

pub use configuration::{ConfigurationFactory, GameConfiguration, StyleVariant};
pub use model::{GameDescription, GameDetail, GameDetailRecord, GameStyle, SourceKind};
pub use orchestrator::{GameOrchestrator, TransitionOutcome};
pub use progress::Progress;
pub use runner::LifecycleRunner;
pub use terminate::KillReport;
