//! docker-job - run a container to completion on Docker Swarm.
//!
//! A job is launched as a replicated service with restart condition `none`.
//! Every run bumps the service's `ForceUpdate` counter so the tasks of that
//! run can be told apart from older ones, then each task is polled until it
//! reaches a terminal state.
//!
//! ## Layout
//!
//! - **docker**: the [`Orchestrator`](docker::Orchestrator) trait and the
//!   Docker Engine client implementing it
//! - **lifecycle**: create, start, poll and delete a job service
//! - **tracker** / **poll**: task discovery and state polling
//! - **frame**: demultiplexing of container log streams
//! - **repeat**: log based repeat conditions
//! - **run**: the complete command flow used by the `dj` binary

pub mod cli;
pub mod docker;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod poll;
pub mod repeat;
pub mod run;
pub mod spec;
pub mod tracker;
pub mod tunnel;

pub use error::{LifecycleError, OrchestratorError, Result};
pub use lifecycle::{LifecycleOptions, ServiceManager, ServiceRequest};
pub use run::{RunConfig, RunReport, run};
