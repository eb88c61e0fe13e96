//! Infrastructure layer: guard stores, guard services, the workflow-engine
//! client and the dispatch pipeline that ties them together.

pub mod admission;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod store;

pub use admission::{
    ActivateKillSwitch, AdminError, AuditLog, ConcurrencyGuard, ConcurrencyStatus, KillSwitch,
    RateLimiter,
};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{ConfigError, DispatchConfig};
pub use dispatch::{DispatchCoordinator, DispatchOutcome, DispatchRequest, DispatchSummary};
pub use engine::{EngineError, HttpWorkflowEngine, InvokeRequest, WorkflowEngine};
pub use store::{GuardStore, InMemoryGuardStore, PostgresGuardStore, StoreError};
