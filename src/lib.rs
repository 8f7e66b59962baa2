//! Poolwarden: background health scoring and auto-selection for a pool
//! of proxy servers.
//!
//! Three periodic cycles share one exclusion gate:
//! - **harvest** runs external producers and imports the servers they emit;
//! - **score** latency-probes every testable server and prunes the dead;
//! - **pooling** throughput-tests the best scorers and promotes the fastest.
//!
//! The server list, the probing engine, the HTTP client and the producers
//! are reached through traits ([`store::ServerStore`],
//! [`engine::ProbeEngine`], [`probe::ProbeClient`],
//! [`discovery::ProducerRunner`]) so the [`orchestrator::Orchestrator`]
//! can run under any host.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pool;
pub mod probe;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testkit;

pub use error::{PoolError, Result};
pub use orchestrator::{Collaborators, CycleReport, Orchestrator};
pub use scheduler::CycleKind;
