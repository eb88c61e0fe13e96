//! Per-request admission pipeline.

mod coordinator;

pub use coordinator::{
    ConcurrencyInfo, DispatchCoordinator, DispatchOutcome, DispatchRequest, DispatchState,
    DispatchSummary, GuardInfo, RateLimitInfo,
};
