//! Infrastructure layer: job store, advisory locks, intake detection, stage
//! routing, handoff, recovery and the operator/observability surfaces.
//!
//! ```text
//! intake tree → StabilityDetector → JobRegistrar → JobStore
//!                                                     ↑
//!      StageExecutor ⇄ StageRouter (LockManager + HandoffArea) → EventSink
//!                          ↑
//!                   RecoverySweeper
//! ```

pub mod admin;
pub mod config;
pub mod detector;
pub mod error;
pub mod event_bus;
pub mod handoff;
pub mod locks;
pub mod pause;
pub mod publish;
pub mod query;
pub mod registrar;
pub mod router;
pub mod store;
pub mod sweeper;
pub mod workers;


pub use admin::{AdminService, CheckpointSummary};
pub use config::{ConfigError, OrchestratorConfig};
pub use detector::{CandidateArrival, DetectorSettings, IntakeWatcher, StabilityDetector};
pub use error::{OrchestratorError, OrchestratorResult};
pub use handoff::{HandoffArea, HandoffError};
pub use locks::{
    InMemoryLockManager, LeaseGrant, LockError, LockKey, LockManager, PostgresLockManager, attempt_is_live,
};
pub use pause::PauseGate;
pub use publish::{EventSink, FanoutSink, NullSink};
pub use query::{JobView, PipelineQuery, PipelineStats};
pub use registrar::{JobRegistrar, Registration, RegistrationOutcome};
pub use router::{Checkpoint, Committed, RouterSettings, StageLease, StageRouter, StageSuccess, StageTicket};
pub use store::{InMemoryJobStore, InsertOutcome, JobFilter, JobStore, PostgresJobStore, StoreError};
pub use sweeper::{RecoverySweeper, SweepReport, SweeperSettings};
