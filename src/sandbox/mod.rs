//! Sandbox policy and attribution
//!
//! Games run as child processes. Everything they may ask of the host goes
//! through a [`policy::PolicyGate`] via a per-game [`broker::RequestBroker`],
//! and every unit they run is attributed to one
//! [`context::ExecutionContext`] by an explicit game token.

pub mod broker;
pub mod context;
pub mod policy;
pub mod resolve;
#[cfg(test)]
pub(crate) mod testing;
pub mod unit;

pub use context::{Caller, ExecutionContext, GamesContext, Origin};
pub use policy::{ExitRequest, PolicyGate};
pub use unit::{ExecutionUnit, SpawnRequest, UnitDiscovery, UnitSpawner};
