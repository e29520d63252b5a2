//! Discovery of the tasks spawned by one start of a service.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::docker::Orchestrator;
use crate::docker::models::Task;
use crate::error::{LifecycleError, Result};
use crate::poll::DEFAULT_POLL_INTERVAL;

/// Lists the tasks that belong to a given generation of a service.
pub struct TaskTracker {
    orchestrator: Arc<dyn Orchestrator>,
    interval: Duration,
    timeout: Option<Duration>,
}

impl TaskTracker {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self {
            orchestrator,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Tasks of `service_id` created for `generation`.
    ///
    /// The orchestrator creates tasks asynchronously after an update, so an
    /// empty listing is retried until at least one task shows up. Tasks left
    /// over from earlier generations are never returned.
    pub async fn list_current_tasks(&self, service_id: &str, generation: u64) -> Result<Vec<Task>> {
        let deadline = self.timeout.map(|t| Instant::now() + t);

        loop {
            let tasks = self
                .orchestrator
                .list_tasks(service_id)
                .await
                .map_err(LifecycleError::ListTasks)?;
            let total = tasks.len();
            let current: Vec<Task> = tasks
                .into_iter()
                .filter(|task| task.generation() == generation)
                .collect();

            if !current.is_empty() {
                debug!(
                    service_id = %service_id,
                    generation,
                    tasks = current.len(),
                    "Discovered tasks"
                );
                return Ok(current);
            }
            trace!(service_id = %service_id, generation, total, "No current tasks yet");

            if deadline.is_some_and(|d| Instant::now() + self.interval > d) {
                return Err(LifecycleError::DiscoveryTimeout {
                    service_id: service_id.to_string(),
                    generation,
                });
            }
            sleep(self.interval).await;
        }
    }
}
