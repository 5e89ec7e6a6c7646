use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel::executor::{
    ContainerRuntime, ContainerSpec, ContainerState, LABEL_RUN_ID, STOP_CODE_USER_INITIATED,
    TaskDescription, TaskLaunch, TaskService,
};
use keel::RunId;
use parking_lot::Mutex;

struct FakeContainer {
    spec: ContainerSpec,
    state: ContainerState,
    logs: Vec<String>,
}

#[derive(Default)]
struct ContainerRecords {
    containers: HashMap<String, FakeContainer>,
    created: Vec<ContainerSpec>,
    stopped: Vec<String>,
}

/// Container engine held entirely in memory.
///
/// New containers start `running`. Tests move them along with
/// [`set_state`](Self::set_state) and feed output through
/// [`push_logs`](Self::push_logs). Stopping a container marks it `exited`
/// with code 137.
#[derive(Clone, Default)]
pub struct FakeContainerRuntime {
    records: Arc<Mutex<ContainerRecords>>,
    fail_create: Arc<AtomicBool>,
    create_delay: Duration,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `create_and_start` open for `delay` after the container exists,
    /// like an engine that is slow to answer.
    pub fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Make every `create_and_start` fail until reset.
    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Specs of every container created, in order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.records.lock().created.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.records.lock().stopped.clone()
    }

    /// Id of the container launched for `run_id`.
    pub fn container_for(&self, run_id: RunId) -> Option<String> {
        let run_id = run_id.to_string();
        self.records
            .lock()
            .containers
            .iter()
            .find(|(_, c)| c.spec.labels.get(LABEL_RUN_ID) == Some(&run_id))
            .map(|(id, _)| id.clone())
    }

    pub fn set_state(&self, container_id: &str, status: &str, exit_code: Option<i64>) {
        if let Some(container) = self.records.lock().containers.get_mut(container_id) {
            container.state = ContainerState {
                status: status.to_string(),
                exit_code,
                error: None,
            };
        }
    }

    pub fn push_logs<I, S>(&self, container_id: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(container) = self.records.lock().containers.get_mut(container_id) {
            container.logs.extend(lines.into_iter().map(Into::into));
        }
    }

    /// Delete a container behind the executor's back.
    pub fn remove(&self, container_id: &str) {
        self.records.lock().containers.remove(container_id);
    }

    pub fn assert_created_count_eq(&self, expected: usize) {
        let actual = self.records.lock().created.len();
        assert_eq!(
            actual, expected,
            "expected {expected} containers created, got {actual}"
        );
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("image {} not found", spec.image);
        }
        let id = {
            let mut records = self.records.lock();
            let id = format!("c{:04}", records.created.len() + 1);
            records.created.push(spec.clone());
            records.containers.insert(
                id.clone(),
                FakeContainer {
                    spec: spec.clone(),
                    state: ContainerState {
                        status: "running".to_string(),
                        exit_code: None,
                        error: None,
                    },
                    logs: Vec::new(),
                },
            );
            id
        };
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        Ok(id)
    }

    async fn inspect(&self, container_id: &str) -> anyhow::Result<Option<ContainerState>> {
        Ok(self
            .records
            .lock()
            .containers
            .get(container_id)
            .map(|c| c.state.clone()))
    }

    async fn logs(&self, container_id: &str, from_line: usize) -> anyhow::Result<Vec<String>> {
        let records = self.records.lock();
        let container = records
            .containers
            .get(container_id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {container_id}"))?;
        Ok(container.logs.iter().skip(from_line).cloned().collect())
    }

    async fn stop(&self, container_id: &str) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        records.stopped.push(container_id.to_string());
        let container = records
            .containers
            .get_mut(container_id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {container_id}"))?;
        container.state = ContainerState {
            status: "exited".to_string(),
            exit_code: Some(137),
            error: None,
        };
        Ok(())
    }
}

struct FakeTask {
    launch: TaskLaunch,
    description: TaskDescription,
    logs: Vec<String>,
}

#[derive(Default)]
struct TaskRecords {
    tasks: HashMap<String, FakeTask>,
    launches: Vec<TaskLaunch>,
    stops: Vec<(String, String)>,
}

/// Serverless task service held entirely in memory.
///
/// Tasks start `PROVISIONING`. `stop_task` moves a task straight to
/// `STOPPED` with a user-initiated stop code.
#[derive(Clone, Default)]
pub struct FakeTaskService {
    records: Arc<Mutex<TaskRecords>>,
}

impl FakeTaskService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<TaskLaunch> {
        self.records.lock().launches.clone()
    }

    /// `(task_ref, reason)` for every stop request.
    pub fn stops(&self) -> Vec<(String, String)> {
        self.records.lock().stops.clone()
    }

    /// Task launched with `run_id` as its client token.
    pub fn task_for(&self, run_id: RunId) -> Option<String> {
        let token = run_id.to_string();
        self.records
            .lock()
            .tasks
            .iter()
            .find(|(_, t)| t.launch.client_token == token)
            .map(|(task_ref, _)| task_ref.clone())
    }

    pub fn set_description(&self, task_ref: &str, description: TaskDescription) {
        if let Some(task) = self.records.lock().tasks.get_mut(task_ref) {
            task.description = description;
        }
    }

    pub fn set_status(&self, task_ref: &str, last_status: &str) {
        if let Some(task) = self.records.lock().tasks.get_mut(task_ref) {
            task.description.last_status = last_status.to_string();
        }
    }

    /// Mark a task stopped by its own container exiting.
    pub fn finish(&self, task_ref: &str, exit_code: i64) {
        self.set_description(
            task_ref,
            TaskDescription {
                last_status: "STOPPED".to_string(),
                stop_code: Some("EssentialContainerExited".to_string()),
                stopped_reason: Some("Essential container in task exited".to_string()),
                exit_code: Some(exit_code),
            },
        );
    }

    pub fn push_logs<I, S>(&self, task_ref: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(task) = self.records.lock().tasks.get_mut(task_ref) {
            task.logs.extend(lines.into_iter().map(Into::into));
        }
    }

    pub fn forget(&self, task_ref: &str) {
        self.records.lock().tasks.remove(task_ref);
    }
}

#[async_trait]
impl TaskService for FakeTaskService {
    async fn run_task(&self, launch: &TaskLaunch) -> anyhow::Result<String> {
        let mut records = self.records.lock();
        let task_ref = format!(
            "arn:aws:ecs:us-east-1:000000000000:task/{}/{:04}",
            launch.cluster,
            records.launches.len() + 1
        );
        records.launches.push(launch.clone());
        records.tasks.insert(
            task_ref.clone(),
            FakeTask {
                launch: launch.clone(),
                description: TaskDescription {
                    last_status: "PROVISIONING".to_string(),
                    ..TaskDescription::default()
                },
                logs: Vec::new(),
            },
        );
        Ok(task_ref)
    }

    async fn describe_task(&self, task_ref: &str) -> anyhow::Result<Option<TaskDescription>> {
        Ok(self
            .records
            .lock()
            .tasks
            .get(task_ref)
            .map(|t| t.description.clone()))
    }

    async fn log_events(&self, task_ref: &str, from_line: usize) -> anyhow::Result<Vec<String>> {
        Ok(self
            .records
            .lock()
            .tasks
            .get(task_ref)
            .map(|t| t.logs.iter().skip(from_line).cloned().collect())
            .unwrap_or_default())
    }

    async fn stop_task(&self, task_ref: &str, reason: &str) -> anyhow::Result<()> {
        let mut records = self.records.lock();
        records
            .stops
            .push((task_ref.to_string(), reason.to_string()));
        let task = records
            .tasks
            .get_mut(task_ref)
            .ok_or_else(|| anyhow::anyhow!("task {task_ref} not found"))?;
        task.description = TaskDescription {
            last_status: "STOPPED".to_string(),
            stop_code: Some(STOP_CODE_USER_INITIATED.to_string()),
            stopped_reason: Some(reason.to_string()),
            exit_code: None,
        };
        Ok(())
    }
}
