//! Test helpers for docker-job integration tests.
//!
//! [`MockOrchestrator`] keeps services and tasks in memory and behaves like a
//! swarm manager just enough for the lifecycle code: updates spawn one task per
//! replica stamped with the service's `ForceUpdate`, tasks walk through a
//! scripted list of states as they are inspected, and old tasks stay listed.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use docker_job::docker::models::{
    ContainerStatus, ObjectVersion, Service, ServiceCreateResponse, ServiceMode, ServiceSpec,
    ServiceUpdateResponse, Task, TaskStamp, TaskStatus,
};
use docker_job::docker::{LogStream, Orchestrator};
use docker_job::frame::{StreamKind, encode_frame};
use docker_job::{LifecycleOptions, OrchestratorError, ServiceManager};

type OrchestratorResult<T> = Result<T, OrchestratorError>;

const DEFAULT_SCRIPT: &[&str] = &["pending", "running", "complete"];

struct MockTask {
    task: Task,
    script: Vec<String>,
    probes: usize,
    logs: Vec<u8>,
}

#[derive(Default)]
struct State {
    services: HashMap<String, Service>,
    next_id: usize,
    tasks: Vec<MockTask>,
    default_script: Vec<String>,
    scripts: VecDeque<Vec<String>>,
    visibility_lag: usize,
    hidden_lists: usize,
    logs: HashMap<u64, Vec<(StreamKind, String)>>,
    configs: HashMap<String, String>,
    update_warnings: Vec<String>,
    fail_updates: bool,
    calls: Vec<String>,
}

/// In-memory stand-in for a swarm manager.
#[derive(Default)]
pub struct MockOrchestrator {
    state: Mutex<State>,
}

impl MockOrchestrator {
    pub fn new() -> Arc<Self> {
        let mock = Self::default();
        mock.set_task_states(DEFAULT_SCRIPT);
        Arc::new(mock)
    }

    /// States every new task goes through, one per inspect.
    pub fn set_task_states(&self, states: &[&str]) {
        self.state.lock().unwrap().default_script = strings(states);
    }

    /// States for the next task to be spawned, overriding the default once.
    pub fn push_task_states(&self, states: &[&str]) {
        self.state.lock().unwrap().scripts.push_back(strings(states));
    }

    /// Number of task listings after each update that do not show the new
    /// tasks yet.
    pub fn set_visibility_lag(&self, lists: usize) {
        self.state.lock().unwrap().visibility_lag = lists;
    }

    /// Output of every task spawned for `generation`.
    pub fn set_logs(&self, generation: u64, frames: &[(StreamKind, &str)]) {
        let frames = frames.iter().map(|(k, t)| (*k, t.to_string())).collect();
        self.state.lock().unwrap().logs.insert(generation, frames);
    }

    pub fn add_config(&self, name: &str, id: &str) {
        self.state
            .lock()
            .unwrap()
            .configs
            .insert(name.to_string(), id.to_string());
    }

    pub fn set_update_warnings(&self, warnings: &[&str]) {
        self.state.lock().unwrap().update_warnings = strings(warnings);
    }

    pub fn fail_updates(&self, fail: bool) {
        self.state.lock().unwrap().fail_updates = fail;
    }

    /// Register an existing service, e.g. to provoke a name conflict.
    pub fn add_service(&self, name: &str) -> String {
        let mut state = self.state.lock().unwrap();
        let id = state.next_service_id();
        let spec = ServiceSpec {
            name: Some(name.to_string()),
            ..Default::default()
        };
        state.services.insert(
            id.clone(),
            Service {
                id: id.clone(),
                version: ObjectVersion { index: 1 },
                spec,
            },
        );
        id
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of recorded calls whose name starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn service(&self, id: &str) -> Option<Service> {
        self.state.lock().unwrap().services.get(id).cloned()
    }

    /// IDs of the tasks spawned for `generation`, in creation order.
    pub fn task_ids(&self, generation: u64) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.task.generation() == generation)
            .map(|t| t.task.id.clone())
            .collect()
    }

    /// How often each task was inspected.
    pub fn probes(&self, task_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .tasks
            .iter()
            .find(|t| t.task.id == task_id)
            .map_or(0, |t| t.probes)
    }
}

impl State {
    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    fn next_service_id(&mut self) -> String {
        self.next_id += 1;
        format!("svc{}", self.next_id)
    }

    fn find_service(&self, id_or_name: &str) -> Option<&Service> {
        self.services.get(id_or_name).or_else(|| {
            self.services
                .values()
                .find(|s| s.spec.name.as_deref() == Some(id_or_name))
        })
    }

    fn spawn_tasks(&mut self, service_id: &str, generation: u64, replicas: u64) {
        let frames = self.logs.get(&generation).cloned().unwrap_or_default();
        let logs: Vec<u8> = frames
            .iter()
            .flat_map(|(kind, text)| encode_frame(*kind, text.as_bytes()))
            .collect();

        for slot in 1..=replicas {
            let script = self
                .scripts
                .pop_front()
                .unwrap_or_else(|| self.default_script.clone());
            let id = format!("{service_id}.g{generation}.{slot}");
            self.tasks.push(MockTask {
                task: Task {
                    id: id.clone(),
                    service_id: service_id.to_string(),
                    slot: Some(slot),
                    spec: TaskStamp {
                        force_update: generation,
                    },
                    status: TaskStatus {
                        state: "new".into(),
                        ..Default::default()
                    },
                    desired_state: Some("running".into()),
                },
                script,
                probes: 0,
                logs: logs.clone(),
            });
        }
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<ServiceCreateResponse> {
        let mut state = self.state.lock().unwrap();
        state.record("create_service".into());
        let id = state.next_service_id();
        state.services.insert(
            id.clone(),
            Service {
                id: id.clone(),
                version: ObjectVersion { index: 1 },
                spec: spec.clone(),
            },
        );
        Ok(ServiceCreateResponse { id, warnings: None })
    }

    async fn inspect_service(&self, id: &str) -> OrchestratorResult<Service> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("inspect_service:{id}"));
        state
            .find_service(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {id} not found")))
    }

    async fn update_service(
        &self,
        id: &str,
        spec: &ServiceSpec,
        version: u64,
    ) -> OrchestratorResult<ServiceUpdateResponse> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("update_service:{id}"));
        if state.fail_updates {
            return Err(OrchestratorError::Api {
                status: 500,
                message: "update out of sequence".into(),
            });
        }
        let warnings = state.update_warnings.clone();

        let service = state
            .services
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {id} not found")))?;
        if service.version.index != version {
            return Err(OrchestratorError::Conflict("update out of sequence".into()));
        }
        service.version.index += 1;
        service.spec = spec.clone();

        let replicas = match spec.mode {
            Some(ServiceMode::Replicated { replicas }) => replicas,
            _ => 0,
        };
        let generation = spec.task_template.force_update;
        state.spawn_tasks(id, generation, replicas);
        state.hidden_lists = state.visibility_lag;

        Ok(ServiceUpdateResponse {
            warnings: (!warnings.is_empty()).then_some(warnings),
        })
    }

    async fn delete_service(&self, id: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("delete_service:{id}"));
        state
            .services
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| OrchestratorError::NotFound(format!("service {id} not found")))
    }

    async fn list_tasks(&self, service_id: &str) -> OrchestratorResult<Vec<Task>> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("list_tasks:{service_id}"));
        let newest = state
            .services
            .get(service_id)
            .map_or(0, |s| s.spec.task_template.force_update);
        let hide_newest = state.hidden_lists > 0;
        if hide_newest {
            state.hidden_lists -= 1;
        }
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.task.service_id == service_id)
            .filter(|t| !(hide_newest && t.task.generation() == newest))
            .map(|t| t.task.clone())
            .collect())
    }

    async fn inspect_task(&self, task_id: &str) -> OrchestratorResult<Task> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("inspect_task:{task_id}"));
        let mock = state
            .tasks
            .iter_mut()
            .find(|t| t.task.id == task_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id} not found")))?;

        let step = mock.probes.min(mock.script.len() - 1);
        mock.probes += 1;
        let label = mock.script[step].clone();
        mock.task.status.err = match label.as_str() {
            "failed" => Some("task: non-zero exit (1)".into()),
            "rejected" => Some("No such image".into()),
            _ => None,
        };
        if label != "new" && label != "pending" {
            mock.task.status.container_status = Some(ContainerStatus {
                container_id: Some(format!("ctr-{task_id}")),
                exit_code: None,
            });
        }
        mock.task.status.state = label;
        Ok(mock.task.clone())
    }

    async fn fetch_logs(&self, task_id: &str, follow: bool) -> OrchestratorResult<LogStream> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("fetch_logs:{task_id}:{follow}"));
        let logs = state
            .tasks
            .iter()
            .find(|t| t.task.id == task_id)
            .map(|t| t.logs.clone())
            .ok_or_else(|| OrchestratorError::NotFound(format!("task {task_id} not found")))?;

        // Deliver in small pieces so frames straddle chunk boundaries.
        let chunks: Vec<OrchestratorResult<Vec<u8>>> =
            logs.chunks(5).map(|c| Ok(c.to_vec())).collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn pull_image(&self, image: &str) -> OrchestratorResult<()> {
        self.state
            .lock()
            .unwrap()
            .record(format!("pull_image:{image}"));
        Ok(())
    }

    async fn resolve_config(&self, name: &str) -> OrchestratorResult<String> {
        let mut state = self.state.lock().unwrap();
        state.record(format!("resolve_config:{name}"));
        state
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("config {name}")))
    }
}

/// Short intervals; tests run on a paused clock anyway.
pub fn fast_options() -> LifecycleOptions {
    LifecycleOptions {
        poll_interval: Duration::from_millis(10),
        discovery_interval: Duration::from_millis(10),
        timeout: None,
    }
}

pub fn manager(mock: &Arc<MockOrchestrator>) -> ServiceManager {
    ServiceManager::new(mock.clone(), fast_options())
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
