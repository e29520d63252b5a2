//! Generic state poller.
//!
//! Repeatedly probes a subject until the reported state label is terminal.
//! Probes never overlap: each one is awaited before sleeping for the next.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::error::{OrchestratorError, PollError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The only terminal success label.
pub const COMPLETE: &str = "complete";

/// Labels that mean "keep waiting".
pub const IN_PROGRESS_STATES: &[&str] = &[
    "new",
    "pending",
    "assigned",
    "accepted",
    "preparing",
    "ready",
    "starting",
    "running",
    "shutdown",
    "remove",
];

/// Result of classifying a single state label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Complete,
    Waiting,
}

/// Classify a state label. Terminal failures and unknown labels are errors.
pub fn classify(label: &str) -> Result<Progress, PollError> {
    match label {
        COMPLETE => Ok(Progress::Complete),
        "failed" => Err(PollError::Execution),
        "rejected" => Err(PollError::BadParameters),
        "orphaned" => Err(PollError::NodeTimeout),
        other if IN_PROGRESS_STATES.contains(&other) => Ok(Progress::Waiting),
        other => Err(PollError::UnknownState(other.to_string())),
    }
}

/// Poll until `probe(subject)` reports a terminal state.
pub async fn poll<S, F, Fut>(probe: F, subject: S, interval: Duration) -> Result<String, PollError>
where
    S: Clone + Display,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<String, OrchestratorError>>,
{
    poll_until(probe, subject, interval, None).await
}

/// Like [`poll`], but gives up with [`PollError::Timeout`] once `deadline`
/// has passed.
pub async fn poll_until<S, F, Fut>(
    mut probe: F,
    subject: S,
    interval: Duration,
    deadline: Option<Instant>,
) -> Result<String, PollError>
where
    S: Clone + Display,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<String, OrchestratorError>>,
{
    let mut last: Option<String> = None;

    loop {
        let label = probe(subject.clone()).await.map_err(PollError::Probe)?;
        trace!(subject = %subject, state = %label, "Probed state");

        if last.as_deref() != Some(label.as_str()) {
            debug!(subject = %subject, state = %label, "State changed");
        }

        if classify(&label)? == Progress::Complete {
            return Ok(label);
        }
        last = Some(label);

        if deadline.is_some_and(|deadline| Instant::now() + interval > deadline) {
            return Err(PollError::Timeout(subject.to_string()));
        }
        sleep(interval).await;
    }
}
