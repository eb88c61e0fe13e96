//! `dispatchgate-core` — shared foundation building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model and optimistic-version checks.

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{ExecutionLogId, HolderId};
pub use version::ExpectedVersion;
