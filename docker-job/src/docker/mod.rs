//! Orchestrator access.
//!
//! The lifecycle code only talks to the [`Orchestrator`] trait; [`DockerClient`]
//! is the Docker Engine implementation.

pub mod client;
pub mod models;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::OrchestratorError;
use models::{Service, ServiceCreateResponse, ServiceSpec, ServiceUpdateResponse, Task};

pub use client::{DEFAULT_API_VERSION, DockerClient, Endpoint};

pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Raw multiplexed log bytes, chunked however the transport delivers them.
pub type LogStream = BoxStream<'static, OrchestratorResult<Vec<u8>>>;

/// Swarm operations needed to run a job.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create a service from a spec.
    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<ServiceCreateResponse>;

    /// Inspect a service by ID or name.
    async fn inspect_service(&self, id: &str) -> OrchestratorResult<Service>;

    /// Replace a service spec. `version` must be the index from the last inspect.
    async fn update_service(
        &self,
        id: &str,
        spec: &ServiceSpec,
        version: u64,
    ) -> OrchestratorResult<ServiceUpdateResponse>;

    async fn delete_service(&self, id: &str) -> OrchestratorResult<()>;

    /// All tasks of a service, of every generation.
    async fn list_tasks(&self, service_id: &str) -> OrchestratorResult<Vec<Task>>;

    async fn inspect_task(&self, task_id: &str) -> OrchestratorResult<Task>;

    /// Stdout and stderr of a task. With `follow` the stream stays open
    /// until the task's container exits.
    async fn fetch_logs(&self, task_id: &str, follow: bool) -> OrchestratorResult<LogStream>;

    /// Pull an image onto the daemon.
    async fn pull_image(&self, image: &str) -> OrchestratorResult<()>;

    /// Look up a config object by exact name and return its ID.
    async fn resolve_config(&self, name: &str) -> OrchestratorResult<String>;
}
