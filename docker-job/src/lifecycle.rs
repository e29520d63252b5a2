//! Service lifecycle: create, start, poll to completion, delete.
//!
//! A job is a replicated service with restart condition `none`. It is created
//! with zero replicas and every start bumps `ForceUpdate`, which the daemon
//! copies into the spec of each task it spawns. That counter is the
//! generation used to tell this start's tasks apart from earlier ones.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Map;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::docker::models::{
    ConfigFile, ConfigReference, ContainerSpec, RestartCondition, RestartPolicy, ServiceMode,
    ServiceSpec, Task, TaskSpec,
};
use crate::docker::{LogStream, Orchestrator};
use crate::error::{LifecycleError, OrchestratorError, Result};
use crate::frame::{FrameReader, LogSink};
use crate::poll::{DEFAULT_POLL_INTERVAL, poll_until};
use crate::spec::{ConfigSpec, VolumeSpec};
use crate::tracker::TaskTracker;

/// How long to keep reading a followed log stream after its task completed.
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Timing knobs for waiting on tasks.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleOptions {
    pub poll_interval: Duration,
    pub discovery_interval: Duration,
    /// Upper bound for each wait (task discovery, each task's poll).
    pub timeout: Option<Duration>,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            discovery_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ServiceRequest {
    pub image: String,
    pub args: Vec<String>,
    pub name: Option<String>,
    pub env: Vec<String>,
    pub volumes: Vec<VolumeSpec>,
    pub configs: Vec<ConfigSpec>,
}

/// Result of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    /// Generation the new tasks will carry.
    pub generation: u64,
    pub warnings: Vec<String>,
}

impl StartOutcome {
    /// Warnings from the update are treated as fatal.
    pub fn check(&self) -> Result<()> {
        if self.warnings.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::Warnings(self.warnings.clone()))
        }
    }
}

/// A task that did not finish successfully.
#[derive(Debug)]
pub struct TaskFailure {
    pub task_id: String,
    pub error: LifecycleError,
    /// Last state reported by the orchestrator.
    pub state: Option<String>,
    /// The orchestrator's error detail (`Status.Err`).
    pub detail: Option<String>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}: \"{} ({})\"",
            self.task_id,
            self.error,
            self.detail.as_deref().unwrap_or(""),
            self.state.as_deref().unwrap_or("unknown")
        )
    }
}

/// Result of polling every task of one generation.
#[derive(Debug)]
pub struct PollOutcome<R> {
    /// Callback result of the last task that completed.
    pub last: Option<R>,
    pub failures: Vec<TaskFailure>,
    pub tasks: usize,
}

impl<R> PollOutcome<R> {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Drives a job service through its lifecycle.
pub struct ServiceManager {
    orchestrator: Arc<dyn Orchestrator>,
    tracker: TaskTracker,
    options: LifecycleOptions,
}

impl ServiceManager {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, options: LifecycleOptions) -> Self {
        let tracker = TaskTracker::new(Arc::clone(&orchestrator))
            .with_interval(options.discovery_interval)
            .with_timeout(options.timeout);
        Self {
            orchestrator,
            tracker,
            options,
        }
    }

    /// Create the service with zero replicas and return its ID.
    pub async fn create(&self, request: &ServiceRequest) -> Result<String> {
        if let Some(name) = &request.name {
            match self.orchestrator.inspect_service(name).await {
                Ok(_) => return Err(LifecycleError::NameConflict(name.clone())),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(LifecycleError::Create(e)),
            }
        }

        let mut configs = Vec::with_capacity(request.configs.len());
        for config in &request.configs {
            let config_id = self
                .orchestrator
                .resolve_config(&config.source)
                .await
                .map_err(|e| {
                    if e.is_not_found() {
                        LifecycleError::ConfigNotFound(config.source.clone())
                    } else {
                        LifecycleError::Create(e)
                    }
                })?;
            configs.push(ConfigReference {
                file: Some(ConfigFile {
                    name: config.target.clone(),
                    uid: config.uid.clone(),
                    gid: config.gid.clone(),
                    mode: config.mode,
                }),
                config_id,
                config_name: config.source.clone(),
                extra: Map::new(),
            });
        }

        let spec = ServiceSpec {
            name: request.name.clone(),
            task_template: TaskSpec {
                container_spec: ContainerSpec {
                    image: request.image.clone(),
                    args: request.args.clone(),
                    env: request.env.clone(),
                    mounts: request.volumes.iter().map(VolumeSpec::to_mount).collect(),
                    configs,
                    extra: Map::new(),
                },
                restart_policy: Some(RestartPolicy {
                    condition: RestartCondition::None,
                    extra: Map::new(),
                }),
                force_update: 0,
                extra: Map::new(),
            },
            mode: Some(ServiceMode::replicated(0)),
            extra: Map::new(),
        };

        let created = self
            .orchestrator
            .create_service(&spec)
            .await
            .map_err(LifecycleError::Create)?;
        for warning in created.warnings.iter().flatten() {
            warn!(service_id = %created.id, warning = %warning, "Create returned a warning");
        }
        info!(service_id = %created.id, image = %request.image, "Created service");
        Ok(created.id)
    }

    /// Scale the service to `replicas` and force a new generation of tasks.
    pub async fn start(&self, service_id: &str, replicas: u64, pull: bool) -> Result<StartOutcome> {
        let service = self
            .orchestrator
            .inspect_service(service_id)
            .await
            .map_err(LifecycleError::Start)?;
        let mut spec = service.spec;

        if pull {
            self.orchestrator
                .pull_image(&spec.task_template.container_spec.image)
                .await
                .map_err(LifecycleError::Start)?;
        }

        spec.mode = Some(ServiceMode::replicated(replicas));
        spec.task_template.force_update += 1;
        let generation = spec.task_template.force_update;

        let updated = self
            .orchestrator
            .update_service(service_id, &spec, service.version.index)
            .await
            .map_err(LifecycleError::Start)?;

        info!(service_id = %service_id, replicas, generation, "Started service");
        Ok(StartOutcome {
            generation,
            warnings: updated.warnings.unwrap_or_default(),
        })
    }

    /// Wait for every task of `generation` to finish.
    ///
    /// Tasks are handled one after the other. When `sink` is given, each
    /// task's live output is decoded into it while the task is polled. A
    /// task that fails (or whose callback fails) is recorded and the
    /// remaining tasks are still processed.
    pub async fn poll_to_completion<R, F, Fut>(
        &self,
        service_id: &str,
        generation: u64,
        mut on_task_complete: F,
        mut sink: Option<&mut dyn LogSink>,
    ) -> Result<PollOutcome<R>>
    where
        F: FnMut(Task) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let tasks = self
            .tracker
            .list_current_tasks(service_id, generation)
            .await?;
        let mut outcome = PollOutcome {
            last: None,
            failures: Vec::new(),
            tasks: tasks.len(),
        };

        for task in tasks {
            let task_id = task.id.clone();
            let polled = match sink.as_deref_mut() {
                Some(sink) => self.poll_streaming(&task_id, sink).await,
                None => self.poll_task(&task_id).await,
            };
            let result = match polled {
                Ok(_) => on_task_complete(task).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    debug!(task_id = %task_id, "Task complete");
                    outcome.last = Some(value);
                }
                Err(e) => outcome.failures.push(self.record_failure(&task_id, e).await),
            }
        }

        Ok(outcome)
    }

    /// Collect a task's output so far as text, stdout and stderr interleaved.
    pub async fn task_logs(&self, task_id: &str) -> Result<String> {
        let mut stream = self
            .orchestrator
            .fetch_logs(task_id, false)
            .await
            .map_err(LifecycleError::Logs)?;
        let mut reader = FrameReader::new();
        let mut text = String::new();

        while let Some(chunk) = stream.next().await {
            reader.push(&chunk.map_err(LifecycleError::Logs)?);
            while let Some(frame) = reader.next_frame()? {
                text.push_str(&frame.text());
            }
        }
        reader.finish()?;
        Ok(text)
    }

    pub async fn delete(&self, service_id: &str) -> Result<()> {
        self.orchestrator
            .delete_service(service_id)
            .await
            .map_err(LifecycleError::Delete)?;
        info!(service_id = %service_id, "Deleted service");
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.options.timeout.map(|t| Instant::now() + t)
    }

    async fn poll_task(&self, task_id: &str) -> Result<String> {
        let probe = |id: String| async move {
            self.orchestrator
                .inspect_task(&id)
                .await
                .map(|task| task.status.state)
        };
        let state = poll_until(
            probe,
            task_id.to_string(),
            self.options.poll_interval,
            self.deadline(),
        )
        .await?;
        Ok(state)
    }

    /// Poll a task while copying its followed log stream into `sink`.
    async fn poll_streaming(&self, task_id: &str, sink: &mut dyn LogSink) -> Result<String> {
        let mut stream = self
            .orchestrator
            .fetch_logs(task_id, true)
            .await
            .map_err(LifecycleError::Logs)?;
        let mut reader = FrameReader::new();

        let poll = self.poll_task(task_id);
        tokio::pin!(poll);
        let mut open = true;

        let state = loop {
            tokio::select! {
                result = &mut poll => break result?,
                chunk = stream.next(), if open => match chunk {
                    Some(chunk) => forward(&mut reader, chunk, sink)?,
                    None => open = false,
                },
            }
        };

        if open {
            open = drain(&mut stream, &mut reader, sink).await?;
        }
        if !open {
            reader.finish()?;
        }
        Ok(state)
    }

    async fn record_failure(&self, task_id: &str, error: LifecycleError) -> TaskFailure {
        let (state, detail) = match self.orchestrator.inspect_task(task_id).await {
            Ok(task) => (Some(task.status.state), task.status.err),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to inspect failed task");
                (None, None)
            }
        };
        let failure = TaskFailure {
            task_id: task_id.to_string(),
            error,
            state,
            detail,
        };
        error!(
            task_id = %task_id,
            error = %failure.error,
            state = failure.state.as_deref().unwrap_or("unknown"),
            detail = failure.detail.as_deref().unwrap_or(""),
            "Task failed"
        );
        failure
    }
}

fn forward(
    reader: &mut FrameReader,
    chunk: std::result::Result<Vec<u8>, OrchestratorError>,
    sink: &mut dyn LogSink,
) -> Result<()> {
    reader.push(&chunk.map_err(LifecycleError::Logs)?);
    while let Some(frame) = reader.next_frame()? {
        sink.write_frame(&frame).map_err(LifecycleError::Output)?;
    }
    Ok(())
}

/// Read what is left of a followed stream after the task finished. Returns
/// whether the stream is still open when the grace period runs out.
async fn drain(
    stream: &mut LogStream,
    reader: &mut FrameReader,
    sink: &mut dyn LogSink,
) -> Result<bool> {
    let grace = sleep(LOG_DRAIN_GRACE);
    tokio::pin!(grace);

    loop {
        tokio::select! {
            _ = &mut grace => return Ok(true),
            chunk = stream.next() => match chunk {
                Some(chunk) => forward(reader, chunk, sink)?,
                None => return Ok(false),
            },
        }
    }
}
