//! # borgitory-core
//!
//! Umbrella crate for the borgitory backup-orchestration core. The domain
//! model and persistence live in [`borgitory_shared`]; the execution
//! engine (pools, runner, events, scheduler) in
//! [`borgitory_orchestration`]. This crate re-exports both and hosts the
//! end-to-end tests that drive the whole engine through its public facade.

pub use borgitory_orchestration as orchestration;
pub use borgitory_shared as shared;

pub use borgitory_orchestration::{
    CancelOutcome, JobManager, JobManagerDependencies, Scheduler,
};
pub use borgitory_shared::{BorgitoryError, BorgitoryResult, JobManagerConfig};
