//! Error types for the conflict-resolution and disaster-recovery engine.

use thiserror::Error;

/// Errors that can occur in the DR engine.
#[derive(Debug, Error)]
pub enum DrError {
    /// A single probe attempt failed or timed out. Retried with backoff.
    #[error("transient probe error for region {region}: {msg}")]
    TransientProbe {
        /// Region being probed.
        region: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// A region failed enough consecutive probe cycles to be declared down.
    #[error("region {region} failed {consecutive_failures} consecutive probe cycles")]
    ConfirmedRegionFailure {
        /// Region declared unhealthy.
        region: String,
        /// Consecutive failed probe cycles.
        consecutive_failures: u32,
    },

    /// No active rule matched; the default strategy is used instead.
    #[error("no resolution rule for table {table} and conflict type {conflict_type}")]
    ResolutionRuleNotFound {
        /// Table being resolved.
        table: String,
        /// Requested conflict type.
        conflict_type: String,
    },

    /// The resolution outcome could not be appended to the audit log.
    #[error("outcome write raced for {table}/{record_id}: {msg}")]
    ConflictWriteRace {
        /// Table of the record.
        table: String,
        /// Record identifier.
        record_id: String,
        /// Error message describing the race.
        msg: String,
    },

    /// No modifications exist for the requested record.
    #[error("no modifications recorded for {table}/{record_id}")]
    RecordNotFound {
        /// Table of the record.
        table: String,
        /// Record identifier.
        record_id: String,
    },

    /// One branch of the parallel failover failed.
    #[error("failover sub-action {action} failed: {msg}")]
    FailoverSubAction {
        /// Sub-action name.
        action: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// Validation did not finish within the configured timeout.
    #[error("validation timed out after {minutes} minutes")]
    ValidationTimeout {
        /// Configured validation timeout.
        minutes: u64,
    },

    /// The workflow exceeded its recovery time objective.
    #[error("RTO of {rto_minutes} minutes breached")]
    RtoBreach {
        /// Configured RTO.
        rto_minutes: u64,
    },

    /// A failover workflow already holds the environment lease.
    #[error("failover already in progress for environment {environment} (lease held since {held_since})")]
    FailoverInProgress {
        /// Environment owning the lease.
        environment: String,
        /// When the active lease was acquired.
        held_since: String,
    },

    /// The lease token or version did not match the stored FailoverState.
    #[error("lease conflict for environment {environment}: {msg}")]
    LeaseConflict {
        /// Environment owning the lease.
        environment: String,
        /// Error message describing the mismatch.
        msg: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {msg}")]
    Config {
        /// Error message describing the problem.
        msg: String,
    },

    /// Audit store rejected an operation.
    #[error("store error: {msg}")]
    Store {
        /// Error message describing the problem.
        msg: String,
    },

    /// External collaborator call failed.
    #[error("collaborator {name} failed: {msg}")]
    Collaborator {
        /// Collaborator name.
        name: String,
        /// Error message describing the failure.
        msg: String,
    },

    /// JSON serialization/deserialization error.
    #[error("serialization error")]
    Json(#[from] serde_json::Error),

    /// TOML parse error.
    #[error("config parse error")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Engine was shut down.
    #[error("engine shut down")]
    Shutdown,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DrError>;
