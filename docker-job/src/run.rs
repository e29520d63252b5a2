//! The `dj` flow: create, start, wait, maybe repeat, maybe remove.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::docker::models::Task;
use crate::error::{LifecycleError, Result};
use crate::frame::LogSink;
use crate::lifecycle::{LifecycleOptions, ServiceManager, ServiceRequest, TaskFailure};
use crate::repeat::{RepeatPredicate, should_repeat};

/// Validated settings for one invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub service: ServiceRequest,
    pub replicas: u64,
    pub detach: bool,
    pub show_logs: bool,
    pub follow: bool,
    pub remove: bool,
    pub pull: bool,
    pub repeat: Option<RepeatPredicate>,
    pub max_iterations: Option<u64>,
    pub lifecycle: LifecycleOptions,
}

#[derive(Debug)]
pub struct RunReport {
    pub service_id: String,
    /// Number of starts.
    pub iterations: u64,
    pub failures: Vec<TaskFailure>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run the service described by `config`.
///
/// The service ID is written to `out` right after creation, followed by
/// each task's logs when requested. With `follow`, live output goes to
/// `sink` instead.
pub async fn run(
    manager: &ServiceManager,
    config: &RunConfig,
    out: &mut (dyn Write + Send),
    sink: &mut dyn LogSink,
) -> Result<RunReport> {
    let service_id = manager.create(&config.service).await?;
    writeln!(out, "{service_id}")
        .and_then(|_| out.flush())
        .map_err(LifecycleError::Output)?;

    let mut report = RunReport {
        service_id,
        iterations: 0,
        failures: Vec::new(),
    };
    let result = iterate(manager, config, &mut report, out, sink).await;

    if config.remove {
        match manager.delete(&report.service_id).await {
            Ok(()) => {}
            Err(e) if result.is_ok() => return Err(e),
            Err(e) => warn!(service_id = %report.service_id, error = %e, "Cleanup failed"),
        }
    }

    result.map(|()| report)
}

async fn iterate(
    manager: &ServiceManager,
    config: &RunConfig,
    report: &mut RunReport,
    out: &mut (dyn Write + Send),
    sink: &mut dyn LogSink,
) -> Result<()> {
    let collect_logs = config.show_logs || config.repeat.is_some();
    let print_logs = config.show_logs && !config.follow;
    let output = Mutex::new(out);

    loop {
        let started = manager
            .start(&report.service_id, config.replicas, config.pull)
            .await?;
        started.check()?;
        report.iterations += 1;

        if config.detach {
            return Ok(());
        }

        let output = &output;
        let on_task_complete = |task: Task| async move {
            if !collect_logs {
                return Ok(false);
            }
            let logs = manager.task_logs(&task.id).await?;
            if print_logs {
                let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
                out.write_all(logs.as_bytes())
                    .and_then(|_| out.flush())
                    .map_err(LifecycleError::Output)?;
            }
            Ok::<_, LifecycleError>(should_repeat(config.repeat.as_ref(), &logs))
        };
        let live = if config.follow {
            Some(&mut *sink as &mut dyn LogSink)
        } else {
            None
        };

        let outcome = manager
            .poll_to_completion(&report.service_id, started.generation, on_task_complete, live)
            .await?;
        let again = outcome.last == Some(true);
        report.failures.extend(outcome.failures);

        let exhausted = config
            .max_iterations
            .is_some_and(|max| report.iterations >= max);
        if !again || exhausted {
            if again {
                info!(iterations = report.iterations, "Iteration limit reached");
            }
            return Ok(());
        }
        info!(service_id = %report.service_id, iteration = report.iterations + 1, "Repeating");
    }
}
