//! In-process workflow engine.
//!
//! Each execution runs as its own tokio task and advances one step at a time; the engine records an
//! append-only history (entered/exited steps, task failures, terminal event) that the status
//! aggregator replays.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playdock_common::status::WorkflowKind;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionDescription {
    pub execution_id: String,
    pub workflow: WorkflowKind,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub cause: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum HistoryEventKind {
    ExecutionStarted { input: Value },
    StepEntered { name: String },
    StepExited { name: String },
    TaskFailed {
        step: String,
        error_type: String,
        message: String,
    },
    ExecutionSucceeded { output: Value },
    ExecutionFailed { error: String, cause: String },
    ExecutionTimedOut,
    ExecutionAborted,
}

#[derive(Clone, Debug, Serialize)]
pub struct HistoryEvent {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: HistoryEventKind,
}

/// Typed failure of one step. `error_type` is the machine-readable code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub error_type: String,
    pub message: String,
}

impl From<&LifecycleError> for StepFailure {
    fn from(e: &LifecycleError) -> Self {
        StepFailure {
            error_type: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

impl From<LifecycleError> for StepFailure {
    fn from(e: LifecycleError) -> Self {
        StepFailure::from(&e)
    }
}

pub enum StepTransition {
    /// Current step finished; enter the named step next.
    Next(&'static str),
    Succeeded(Value),
    Failed(StepFailure),
}

#[derive(Clone, Debug)]
pub enum ExecutionOutcome {
    Succeeded(Value),
    Failed(StepFailure),
    TimedOut,
    Aborted,
}

/// One running workflow. The engine calls `step` until it returns a terminal transition.
#[async_trait]
pub trait WorkflowRun: Send {
    fn initial_step(&self) -> &'static str;

    /// Execute the current step.
    async fn step(&mut self) -> StepTransition;

    /// Runs exactly once after the execution reached any terminal state, including abort/timeout.
    /// The terminal status is recorded only after this returns; until then the execution
    /// still describes as `Running`.
    async fn finish(&mut self, _outcome: &ExecutionOutcome) {}
}

pub trait WorkflowFactory: Send + Sync {
    fn create(
        &self,
        kind: WorkflowKind,
        execution_id: &str,
        input: &Value,
    ) -> Result<Box<dyn WorkflowRun>>;
}

#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Starts an execution and returns its id. `execution_id` lets the caller pick the id up front.
    async fn start_execution(
        &self,
        kind: WorkflowKind,
        execution_id: Option<String>,
        input: Value,
    ) -> Result<String>;

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription>;

    async fn get_execution_history(&self, execution_id: &str) -> Result<Vec<HistoryEvent>>;

    /// Returns false when the execution had already finished.
    async fn abort_execution(&self, execution_id: &str) -> Result<bool>;
}

struct ExecutionRecord {
    description: ExecutionDescription,
    history: Vec<HistoryEvent>,
    abort: Arc<Notify>,
}

#[derive(Clone, Default)]
struct Executions {
    inner: Arc<RwLock<HashMap<String, ExecutionRecord>>>,
}

impl Executions {
    async fn append(&self, execution_id: &str, kind: HistoryEventKind) {
        let mut guard = self.inner.write().await;
        if let Some(rec) = guard.get_mut(execution_id) {
            let id = rec.history.len() as u64 + 1;
            rec.history.push(HistoryEvent {
                id,
                timestamp: Utc::now(),
                kind,
            });
        }
    }

    async fn complete(&self, execution_id: &str, outcome: &ExecutionOutcome) {
        let mut guard = self.inner.write().await;
        let Some(rec) = guard.get_mut(execution_id) else {
            return;
        };
        let d = &mut rec.description;
        d.end_time = Some(Utc::now());
        let event = match outcome {
            ExecutionOutcome::Succeeded(output) => {
                d.status = ExecutionStatus::Succeeded;
                d.output = Some(output.clone());
                HistoryEventKind::ExecutionSucceeded {
                    output: output.clone(),
                }
            }
            ExecutionOutcome::Failed(f) => {
                d.status = ExecutionStatus::Failed;
                d.error = Some(f.error_type.clone());
                d.cause = Some(f.message.clone());
                HistoryEventKind::ExecutionFailed {
                    error: f.error_type.clone(),
                    cause: f.message.clone(),
                }
            }
            ExecutionOutcome::TimedOut => {
                d.status = ExecutionStatus::TimedOut;
                d.error = Some("ExecutionTimedOut".to_string());
                d.cause = Some("execution exceeded its overall timeout".to_string());
                HistoryEventKind::ExecutionTimedOut
            }
            ExecutionOutcome::Aborted => {
                d.status = ExecutionStatus::Aborted;
                d.error = Some("ExecutionAborted".to_string());
                d.cause = Some("execution was aborted".to_string());
                HistoryEventKind::ExecutionAborted
            }
        };
        let id = rec.history.len() as u64 + 1;
        rec.history.push(HistoryEvent {
            id,
            timestamp: Utc::now(),
            kind: event,
        });
    }
}

pub struct LocalOrchestrator {
    factory: Arc<dyn WorkflowFactory>,
    executions: Executions,
    execution_timeout: Option<Duration>,
}

impl LocalOrchestrator {
    pub fn new(factory: Arc<dyn WorkflowFactory>, execution_timeout: Option<Duration>) -> Self {
        Self {
            factory,
            executions: Executions::default(),
            execution_timeout,
        }
    }
}

async fn drive(run: &mut dyn WorkflowRun, executions: &Executions, execution_id: &str) -> ExecutionOutcome {
    let mut current = run.initial_step();
    executions
        .append(execution_id, HistoryEventKind::StepEntered { name: current.to_string() })
        .await;
    loop {
        match run.step().await {
            StepTransition::Next(next) => {
                executions
                    .append(execution_id, HistoryEventKind::StepExited { name: current.to_string() })
                    .await;
                executions
                    .append(execution_id, HistoryEventKind::StepEntered { name: next.to_string() })
                    .await;
                current = next;
            }
            StepTransition::Succeeded(output) => {
                executions
                    .append(execution_id, HistoryEventKind::StepExited { name: current.to_string() })
                    .await;
                return ExecutionOutcome::Succeeded(output);
            }
            StepTransition::Failed(failure) => {
                warn!(
                    execution_id,
                    step = current,
                    error_type = %failure.error_type,
                    "[engine] step failed: {}",
                    failure.message
                );
                executions
                    .append(
                        execution_id,
                        HistoryEventKind::TaskFailed {
                            step: current.to_string(),
                            error_type: failure.error_type.clone(),
                            message: failure.message.clone(),
                        },
                    )
                    .await;
                return ExecutionOutcome::Failed(failure);
            }
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn start_execution(
        &self,
        kind: WorkflowKind,
        execution_id: Option<String>,
        input: Value,
    ) -> Result<String> {
        let execution_id = execution_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut run = self.factory.create(kind, &execution_id, &input)?;
        let abort = Arc::new(Notify::new());

        {
            let mut guard = self.executions.inner.write().await;
            if guard.contains_key(&execution_id) {
                return Err(LifecycleError::ExecutionAlreadyExists(execution_id));
            }
            guard.insert(
                execution_id.clone(),
                ExecutionRecord {
                    description: ExecutionDescription {
                        execution_id: execution_id.clone(),
                        workflow: kind,
                        status: ExecutionStatus::Running,
                        input: input.clone(),
                        output: None,
                        error: None,
                        cause: None,
                        start_time: Utc::now(),
                        end_time: None,
                    },
                    history: vec![HistoryEvent {
                        id: 1,
                        timestamp: Utc::now(),
                        kind: HistoryEventKind::ExecutionStarted { input },
                    }],
                    abort: abort.clone(),
                },
            );
        }

        info!(execution_id = %execution_id, workflow = kind.as_str(), "[engine] execution started");

        let executions = self.executions.clone();
        let timeout = self.execution_timeout;
        let id = execution_id.clone();
        tokio::spawn(async move {
            let outcome = {
                let driving = drive(run.as_mut(), &executions, &id);
                tokio::select! {
                    outcome = driving => outcome,
                    _ = abort.notified() => ExecutionOutcome::Aborted,
                    _ = deadline(timeout) => ExecutionOutcome::TimedOut,
                }
            };
            // Record cleanup must be visible before the terminal status is.
            run.finish(&outcome).await;
            executions.complete(&id, &outcome).await;
            match &outcome {
                ExecutionOutcome::Succeeded(_) => {
                    info!(execution_id = %id, "[engine] execution succeeded")
                }
                ExecutionOutcome::Failed(f) => {
                    error!(execution_id = %id, error_type = %f.error_type, "[engine] execution failed: {}", f.message)
                }
                ExecutionOutcome::TimedOut => warn!(execution_id = %id, "[engine] execution timed out"),
                ExecutionOutcome::Aborted => warn!(execution_id = %id, "[engine] execution aborted"),
            }
        });

        Ok(execution_id)
    }

    async fn describe_execution(&self, execution_id: &str) -> Result<ExecutionDescription> {
        self.executions
            .inner
            .read()
            .await
            .get(execution_id)
            .map(|r| r.description.clone())
            .ok_or_else(|| LifecycleError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn get_execution_history(&self, execution_id: &str) -> Result<Vec<HistoryEvent>> {
        self.executions
            .inner
            .read()
            .await
            .get(execution_id)
            .map(|r| r.history.clone())
            .ok_or_else(|| LifecycleError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn abort_execution(&self, execution_id: &str) -> Result<bool> {
        let guard = self.executions.inner.read().await;
        let rec = guard
            .get(execution_id)
            .ok_or_else(|| LifecycleError::ExecutionNotFound(execution_id.to_string()))?;
        if rec.description.status.is_terminal() {
            return Ok(false);
        }
        rec.abort.notify_one();
        info!(execution_id, "[engine] abort requested");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Plays back a fixed list of transitions; `None` entries hang forever.
    struct Scripted {
        transitions: VecDeque<Option<StepTransition>>,
        finished: Arc<AtomicU32>,
        finish_delay: Duration,
    }

    #[async_trait]
    impl WorkflowRun for Scripted {
        fn initial_step(&self) -> &'static str {
            "A"
        }

        async fn step(&mut self) -> StepTransition {
            match self.transitions.pop_front() {
                Some(Some(t)) => t,
                _ => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn finish(&mut self, _outcome: &ExecutionOutcome) {
            tokio::time::sleep(self.finish_delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Factory {
        script: fn() -> Vec<Option<StepTransition>>,
        finished: Arc<AtomicU32>,
        finish_delay: Duration,
    }

    impl WorkflowFactory for Factory {
        fn create(&self, _kind: WorkflowKind, _id: &str, _input: &Value) -> Result<Box<dyn WorkflowRun>> {
            Ok(Box::new(Scripted {
                transitions: (self.script)().into(),
                finished: self.finished.clone(),
                finish_delay: self.finish_delay,
            }))
        }
    }

    fn orchestrator(
        script: fn() -> Vec<Option<StepTransition>>,
        timeout: Option<Duration>,
    ) -> (LocalOrchestrator, Arc<AtomicU32>) {
        slow_finish_orchestrator(script, timeout, Duration::ZERO)
    }

    fn slow_finish_orchestrator(
        script: fn() -> Vec<Option<StepTransition>>,
        timeout: Option<Duration>,
        finish_delay: Duration,
    ) -> (LocalOrchestrator, Arc<AtomicU32>) {
        let finished = Arc::new(AtomicU32::new(0));
        let factory = Arc::new(Factory {
            script,
            finished: finished.clone(),
            finish_delay,
        });
        (LocalOrchestrator::new(factory, timeout), finished)
    }

    async fn wait_terminal(o: &LocalOrchestrator, id: &str) -> ExecutionDescription {
        for _ in 0..1000 {
            let d = o.describe_execution(id).await.unwrap();
            if d.status.is_terminal() {
                return d;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("execution {id} never finished");
    }

    fn names(history: &[HistoryEvent]) -> Vec<String> {
        history
            .iter()
            .map(|e| match &e.kind {
                HistoryEventKind::ExecutionStarted { .. } => "started".to_string(),
                HistoryEventKind::StepEntered { name } => format!("enter:{name}"),
                HistoryEventKind::StepExited { name } => format!("exit:{name}"),
                HistoryEventKind::TaskFailed { step, .. } => format!("failed:{step}"),
                HistoryEventKind::ExecutionSucceeded { .. } => "succeeded".to_string(),
                HistoryEventKind::ExecutionFailed { .. } => "execution-failed".to_string(),
                HistoryEventKind::ExecutionTimedOut => "timed-out".to_string(),
                HistoryEventKind::ExecutionAborted => "aborted".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn records_steps_in_order() {
        let (o, finished) = orchestrator(
            || {
                vec![
                    Some(StepTransition::Next("B")),
                    Some(StepTransition::Succeeded(json!({"ok": true}))),
                ]
            },
            None,
        );
        let id = o
            .start_execution(WorkflowKind::Deploy, None, json!({"userId": "u1"}))
            .await
            .unwrap();
        let d = wait_terminal(&o, &id).await;
        assert_eq!(d.status, ExecutionStatus::Succeeded);
        assert_eq!(d.output, Some(json!({"ok": true})));
        assert!(d.end_time.is_some());

        let history = o.get_execution_history(&id).await.unwrap();
        assert_eq!(
            names(&history),
            vec!["started", "enter:A", "exit:A", "enter:B", "exit:B", "succeeded"]
        );
        assert!(history.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_records_task_failed() {
        let (o, finished) = orchestrator(
            || {
                vec![
                    Some(StepTransition::Next("B")),
                    Some(StepTransition::Failed(StepFailure {
                        error_type: "InstanceBusy".into(),
                        message: "instance i-1 is still pending".into(),
                    })),
                ]
            },
            None,
        );
        let id = o
            .start_execution(WorkflowKind::Terminate, Some("exec-1".into()), json!({}))
            .await
            .unwrap();
        assert_eq!(id, "exec-1");
        let d = wait_terminal(&o, &id).await;
        assert_eq!(d.status, ExecutionStatus::Failed);
        assert_eq!(d.error.as_deref(), Some("InstanceBusy"));
        let history = o.get_execution_history(&id).await.unwrap();
        assert_eq!(
            names(&history),
            vec!["started", "enter:A", "exit:A", "enter:B", "failed:B", "execution-failed"]
        );
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_status_waits_for_finish() {
        let (o, finished) = slow_finish_orchestrator(
            || vec![Some(StepTransition::Succeeded(json!({})))],
            None,
            Duration::from_millis(50),
        );
        let id = o
            .start_execution(WorkflowKind::Deploy, None, json!({}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(o.describe_execution(&id).await.unwrap().status, ExecutionStatus::Running);

        let d = wait_terminal(&o, &id).await;
        assert_eq!(d.status, ExecutionStatus::Succeeded);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let (o, _) = orchestrator(|| vec![None], None);
        o.start_execution(WorkflowKind::Deploy, Some("x".into()), json!({}))
            .await
            .unwrap();
        let err = o
            .start_execution(WorkflowKind::Deploy, Some("x".into()), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ExecutionAlreadyExists");
    }

    #[tokio::test]
    async fn abort_stops_a_hanging_step_and_runs_finish() {
        let (o, finished) = orchestrator(|| vec![Some(StepTransition::Next("B")), None], None);
        let id = o
            .start_execution(WorkflowKind::Deploy, None, json!({}))
            .await
            .unwrap();
        assert!(o.abort_execution(&id).await.unwrap());
        let d = wait_terminal(&o, &id).await;
        assert_eq!(d.status, ExecutionStatus::Aborted);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(!o.abort_execution(&id).await.unwrap());
    }

    #[tokio::test]
    async fn overall_timeout_is_recorded() {
        let (o, finished) = orchestrator(|| vec![None], Some(Duration::from_millis(10)));
        let id = o
            .start_execution(WorkflowKind::Deploy, None, json!({}))
            .await
            .unwrap();
        let d = wait_terminal(&o, &id).await;
        assert_eq!(d.status, ExecutionStatus::TimedOut);
        let history = o.get_execution_history(&id).await.unwrap();
        assert_eq!(names(&history).last().map(String::as_str), Some("timed-out"));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_execution() {
        let (o, _) = orchestrator(|| vec![], None);
        assert_eq!(
            o.describe_execution("nope").await.unwrap_err().code(),
            "ExecutionNotFound"
        );
        assert!(o.get_execution_history("nope").await.is_err());
        assert!(o.abort_execution("nope").await.is_err());
    }
}
