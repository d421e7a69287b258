//! # Stage: Service Routing
//!
//! ## Responsibility
//! Pick the best backend server for each request, execute it with bounded
//! retries and failover, and account for its cost. Server health and load
//! are tracked continuously from request outcomes and periodic probes.
//!
//! ## Guarantees
//! - Deterministic: for a fixed registry snapshot and requirement set the
//!   scorer always selects the same server (ties go to registration order).
//! - Thread-safe: the registry and cost ledger are the sole mutators of their
//!   state, behind `parking_lot` locks; readers get copied snapshots.
//! - Bounded: a request makes at most `failover.max_attempts` strictly
//!   sequential attempts and never runs past its deadline.
//! - Observable: health transitions, failures, completions and budget alerts
//!   are published as [`crate::events::RouterEvent`]s.
//!
//! ## NOT Responsible For
//! - Transport to the servers (that belongs to [`crate::backend`])
//! - Message delivery between components (see [`crate::bus`])
//! - Persisting metrics or the cost ledger across restarts

pub mod capability;
pub mod cost_tracker;
pub mod failover;
pub mod health;
pub mod registry;
pub mod router;
pub mod scorer;

// Re-exports for convenience
pub use capability::{Capability, Constraints, Requirements};
pub use cost_tracker::{BudgetLevel, BudgetStatus, CostSnapshot, CostTracker, ServerCost};
pub use failover::{AttemptOutcome, AttemptRecord, FailoverManager, RequestEnvelope};
pub use health::{BackendProbe, HealthMonitor, HealthProbe};
pub use registry::{ServerRegistry, ServerSnapshot, ServerStatus};
pub use router::{ExecuteOptions, ExecutionResult, ServiceRouter};
pub use scorer::{ScoreBreakdown, SelectionScorer};
