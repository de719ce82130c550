#![warn(missing_docs)]

//! Meridian DR: cross-region write tracking, conflict detection and
//! resolution, region health monitoring and leased failover orchestration.

pub mod cli;
pub mod collaborators;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod health;
pub mod lag;
pub mod lease;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod resolver;
pub mod retention;
pub mod rules;
pub mod store;
pub mod tracker;
pub mod types;

pub use config::DrConfig;
pub use engine::{DrEngine, EngineState, SweepReport};
pub use error::{DrError, Result};
pub use orchestrator::{DrOrchestrator, FailoverRequest};
pub use resolver::{ConflictResolver, Resolution};
pub use store::AuditStore;
pub use types::{ConflictType, Operation, RegionId, ResolutionOutcome};
