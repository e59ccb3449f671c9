//! Status Aggregator: turns an execution's event history into a pollable status payload.

use std::collections::HashSet;
use std::sync::Arc;

use playdock_common::status::DeploymentStatus;
use serde_json::Value;
use tracing::debug;

use crate::engine::{ExecutionDescription, ExecutionStatus, HistoryEvent, HistoryEventKind, Orchestrator};
use crate::workflows::steps_for;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepProgress {
    pub current_step: Option<String>,
    /// 1-based position of `current_step` in the step list.
    pub step_order: Option<usize>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub progress: u8,
}

/// Replay `history` against the ordered `steps`. Unknown step names are ignored.
pub fn replay(history: &[HistoryEvent], steps: &[&str]) -> StepProgress {
    let total = steps.len();
    let mut current: Option<&str> = None;
    let mut exited: HashSet<&str> = HashSet::new();
    let mut succeeded = false;

    for event in history {
        match &event.kind {
            HistoryEventKind::StepEntered { name } => {
                if let Some(s) = steps.iter().find(|s| **s == name.as_str()) {
                    current = Some(*s);
                }
            }
            HistoryEventKind::StepExited { name } => {
                if let Some(s) = steps.iter().find(|s| **s == name.as_str()) {
                    exited.insert(*s);
                }
            }
            HistoryEventKind::ExecutionSucceeded { .. } => succeeded = true,
            _ => {}
        }
    }

    if succeeded {
        return StepProgress {
            current_step: steps.last().map(|s| s.to_string()),
            step_order: if total > 0 { Some(total) } else { None },
            completed_steps: total,
            total_steps: total,
            progress: 100,
        };
    }

    let completed = exited.len();
    StepProgress {
        step_order: current.and_then(|c| steps.iter().position(|s| *s == c).map(|i| i + 1)),
        current_step: current.map(str::to_string),
        completed_steps: completed,
        total_steps: total,
        progress: percent(completed, total),
    }
}

fn percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Nearest task failure, scanning backward.
fn last_task_failure(history: &[HistoryEvent]) -> Option<(&str, &str, &str)> {
    history.iter().rev().find_map(|e| match &e.kind {
        HistoryEventKind::TaskFailed {
            step,
            error_type,
            message,
        } => Some((step.as_str(), error_type.as_str(), message.as_str())),
        _ => None,
    })
}

fn output_str(output: Option<&Value>, key: &str) -> Option<String> {
    output
        .and_then(|o| o.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

pub fn aggregate(desc: &ExecutionDescription, history: &[HistoryEvent]) -> DeploymentStatus {
    let steps = steps_for(desc.workflow);
    let label = match desc.workflow {
        playdock_common::status::WorkflowKind::Deploy => "Deployment",
        playdock_common::status::WorkflowKind::Terminate => "Termination",
    };

    match desc.status {
        ExecutionStatus::Running => {
            let p = replay(history, steps);
            let message = match (&p.current_step, p.step_order) {
                (Some(step), Some(order)) => {
                    format!("{} in progress: step {}/{} ({})", label, order, p.total_steps, step)
                }
                _ => format!("{} is starting", label),
            };
            DeploymentStatus::Running {
                execution_id: desc.execution_id.clone(),
                workflow: desc.workflow,
                current_step: p.current_step,
                step_order: p.step_order,
                total_steps: p.total_steps,
                completed_steps: p.completed_steps,
                progress: p.progress,
                message,
            }
        }
        ExecutionStatus::Succeeded => {
            let output = desc.output.as_ref();
            DeploymentStatus::Succeeded {
                execution_id: desc.execution_id.clone(),
                workflow: desc.workflow,
                instance_id: output_str(output, "instanceId"),
                instance_arn: output_str(output, "instanceArn"),
                streaming_link: output_str(output, "streamingLink"),
                message: output_str(output, "message")
                    .unwrap_or_else(|| format!("{} succeeded", label)),
            }
        }
        ExecutionStatus::Failed | ExecutionStatus::TimedOut | ExecutionStatus::Aborted => {
            let (error_step, error_type, error_message) = match last_task_failure(history) {
                Some((step, error_type, message)) => {
                    (Some(step.to_string()), error_type.to_string(), message.to_string())
                }
                None => (
                    None,
                    desc.error.clone().unwrap_or_else(|| "ExecutionFailed".to_string()),
                    desc.cause.clone().unwrap_or_else(|| "execution ended without details".to_string()),
                ),
            };
            let message = match &error_step {
                Some(step) => format!("{} failed at {}: {}", label, step, error_message),
                None => format!("{} failed: {}", label, error_message),
            };
            DeploymentStatus::Failed {
                execution_id: desc.execution_id.clone(),
                workflow: desc.workflow,
                error_step,
                error_type,
                error_message,
                message,
            }
        }
    }
}

pub struct StatusAggregator {
    orchestrator: Arc<dyn Orchestrator>,
}

impl StatusAggregator {
    pub fn new(orchestrator: Arc<dyn Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Never fails: a missing execution yields `NotFound`.
    pub async fn status_for_execution(&self, execution_id: Option<&str>) -> DeploymentStatus {
        let Some(execution_id) = execution_id else {
            return DeploymentStatus::NotFound {
                message: "No workflow execution found".to_string(),
            };
        };
        let described = self.orchestrator.describe_execution(execution_id).await;
        let history = self.orchestrator.get_execution_history(execution_id).await;
        match (described, history) {
            (Ok(desc), Ok(history)) => aggregate(&desc, &history),
            (Err(e), _) | (_, Err(e)) => {
                debug!(execution_id, "[status] execution unavailable: {}", e);
                DeploymentStatus::NotFound {
                    message: format!("Execution {} not found", execution_id),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use playdock_common::status::WorkflowKind;
    use serde_json::json;

    const STEPS: [&str; 3] = ["A", "B", "C"];

    fn ev(id: u64, kind: HistoryEventKind) -> HistoryEvent {
        HistoryEvent {
            id,
            timestamp: Utc::now(),
            kind,
        }
    }

    fn entered(id: u64, name: &str) -> HistoryEvent {
        ev(id, HistoryEventKind::StepEntered { name: name.into() })
    }

    fn exited(id: u64, name: &str) -> HistoryEvent {
        ev(id, HistoryEventKind::StepExited { name: name.into() })
    }

    fn desc(status: ExecutionStatus) -> ExecutionDescription {
        ExecutionDescription {
            execution_id: "exec-1".into(),
            workflow: WorkflowKind::Deploy,
            status,
            input: json!({"userId": "u1"}),
            output: None,
            error: None,
            cause: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    #[test]
    fn tracks_current_and_completed() {
        let history = vec![
            ev(1, HistoryEventKind::ExecutionStarted { input: json!({}) }),
            entered(2, "A"),
            exited(3, "A"),
            entered(4, "B"),
        ];
        let p = replay(&history, &STEPS);
        assert_eq!(p.current_step.as_deref(), Some("B"));
        assert_eq!(p.step_order, Some(2));
        assert_eq!(p.completed_steps, 1);
        assert_eq!(p.progress, 33);
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let full = vec![
            entered(1, "A"),
            exited(2, "A"),
            entered(3, "B"),
            exited(4, "B"),
            // Re-exiting a step must not double count.
            exited(5, "B"),
            entered(6, "C"),
            exited(7, "C"),
            exited(8, "Unknown"),
        ];
        let mut last = 0;
        for n in 0..=full.len() {
            let p = replay(&full[..n], &STEPS);
            assert!(p.completed_steps >= last);
            assert!(p.completed_steps <= p.total_steps);
            last = p.completed_steps;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn success_forces_full_progress() {
        let history = vec![
            entered(1, "A"),
            ev(2, HistoryEventKind::ExecutionSucceeded { output: json!({}) }),
        ];
        let p = replay(&history, &STEPS);
        assert_eq!(p.progress, 100);
        assert_eq!(p.completed_steps, 3);
        assert_eq!(p.current_step.as_deref(), Some("C"));
    }

    #[test]
    fn failure_reports_nearest_task_failure() {
        let history = vec![
            entered(1, "CheckExistingStream"),
            ev(
                2,
                HistoryEventKind::TaskFailed {
                    step: "CheckExistingStream".into(),
                    error_type: "StreamAlreadyActive".into(),
                    message: "an active stream already exists for user u1".into(),
                },
            ),
            ev(
                3,
                HistoryEventKind::ExecutionFailed {
                    error: "StreamAlreadyActive".into(),
                    cause: "x".into(),
                },
            ),
        ];
        match aggregate(&desc(ExecutionStatus::Failed), &history) {
            DeploymentStatus::Failed {
                error_step,
                error_type,
                message,
                ..
            } => {
                assert_eq!(error_step.as_deref(), Some("CheckExistingStream"));
                assert_eq!(error_type, "StreamAlreadyActive");
                assert_ne!(message, error_type);
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn failure_without_task_event_uses_execution_fields() {
        let mut d = desc(ExecutionStatus::TimedOut);
        d.error = Some("ExecutionTimedOut".into());
        d.cause = Some("execution exceeded its overall timeout".into());
        match aggregate(&d, &[entered(1, "ProvisionInstance")]) {
            DeploymentStatus::Failed {
                error_step,
                error_type,
                ..
            } => {
                assert!(error_step.is_none());
                assert_eq!(error_type, "ExecutionTimedOut");
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[test]
    fn success_reads_output_identifiers() {
        let mut d = desc(ExecutionStatus::Succeeded);
        d.output = Some(json!({
            "instanceId": "i-1",
            "instanceArn": "arn:i-1",
            "streamingLink": "https://x:8443/#s",
            "message": "Streaming session is ready"
        }));
        match aggregate(&d, &[]) {
            DeploymentStatus::Succeeded {
                instance_id,
                streaming_link,
                message,
                ..
            } => {
                assert_eq!(instance_id.as_deref(), Some("i-1"));
                assert_eq!(streaming_link.as_deref(), Some("https://x:8443/#s"));
                assert_eq!(message, "Streaming session is ready");
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }
}
