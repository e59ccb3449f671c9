//! Terminate: ResolveActiveInstance -> StopSession -> DetachVolumes -> TerminateInstance
//! -> PersistTerminatedStatus.
//!
//! Only `TerminateInstance` must succeed; the other steps record a `BestEffortOutcome`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use playdock_common::{GamingInstance, InstanceStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{BestEffortOutcome, WorkflowDeps};
use crate::engine::{StepFailure, StepTransition, WorkflowRun};
use crate::error::{LifecycleError, Result};

pub const TERMINATE_STEPS: [&str; 5] = [
    "ResolveActiveInstance",
    "StopSession",
    "DetachVolumes",
    "TerminateInstance",
    "PersistTerminatedStatus",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateState {
    ResolveActiveInstance,
    StopSession,
    DetachVolumes,
    TerminateInstance,
    PersistTerminatedStatus,
}

impl TerminateState {
    pub fn name(&self) -> &'static str {
        TERMINATE_STEPS[self.order()]
    }

    pub fn order(&self) -> usize {
        match self {
            TerminateState::ResolveActiveInstance => 0,
            TerminateState::StopSession => 1,
            TerminateState::DetachVolumes => 2,
            TerminateState::TerminateInstance => 3,
            TerminateState::PersistTerminatedStatus => 4,
        }
    }

    pub fn next(&self) -> Option<TerminateState> {
        match self {
            TerminateState::ResolveActiveInstance => Some(TerminateState::StopSession),
            TerminateState::StopSession => Some(TerminateState::DetachVolumes),
            TerminateState::DetachVolumes => Some(TerminateState::TerminateInstance),
            TerminateState::TerminateInstance => Some(TerminateState::PersistTerminatedStatus),
            TerminateState::PersistTerminatedStatus => None,
        }
    }
}

/// Execution output of a terminate run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateResult {
    pub success: bool,
    pub instance_id: String,
    pub instance_arn: String,
    pub message: String,
    pub already_terminated: bool,
    pub stop_session_state: Option<BestEffortOutcome>,
    pub detach_volume_state: Option<BestEffortOutcome>,
    pub persist_state: Option<BestEffortOutcome>,
}

impl TerminateResult {
    /// Final message: always states the instance outcome, then any best-effort warnings.
    fn summarize(&mut self) {
        let mut warnings = Vec::new();
        if let Some(s) = self.stop_session_state.as_ref().filter(|s| s.is_failed()) {
            warnings.push(format!("session stop failed: {}", s.message));
        }
        if let Some(s) = self.detach_volume_state.as_ref().filter(|s| s.is_failed()) {
            warnings.push(format!("volume detach failed: {}", s.message));
        }
        if let Some(s) = self.persist_state.as_ref().filter(|s| s.is_failed()) {
            warnings.push(format!("status update failed: {}", s.message));
        }
        self.message = format!("Instance {} terminated", self.instance_id);
        if !warnings.is_empty() {
            self.message.push_str(&format!(" (warnings: {})", warnings.join("; ")));
        }
    }
}

pub struct TerminateRun {
    deps: Arc<WorkflowDeps>,
    execution_id: String,
    user_id: String,
    state: TerminateState,
    instance: Option<GamingInstance>,
    result: TerminateResult,
}

impl TerminateRun {
    pub fn new(deps: Arc<WorkflowDeps>, execution_id: &str, user_id: &str) -> Self {
        Self {
            deps,
            execution_id: execution_id.to_string(),
            user_id: user_id.to_string(),
            state: TerminateState::ResolveActiveInstance,
            instance: None,
            result: TerminateResult::default(),
        }
    }

    fn instance(&self) -> Result<&GamingInstance> {
        self.instance
            .as_ref()
            .ok_or_else(|| LifecycleError::NoActiveInstance(self.user_id.clone()))
    }

    /// Returns `Some(output)` when the run can finish right away.
    async fn resolve_active_instance(&mut self) -> Result<Option<Value>> {
        let registry = &self.deps.registry;
        let record = registry
            .active_instance_for_user(&self.user_id)
            .await?
            .ok_or_else(|| LifecycleError::NoActiveInstance(self.user_id.clone()))?;

        self.result.instance_id = record.instance_id.clone();
        self.result.instance_arn = record.arn.clone();

        if record.status == InstanceStatus::Terminated {
            info!(instance_id = %record.instance_id, "[workflow] instance already terminated");
            self.result.success = true;
            self.result.already_terminated = true;
            self.result.message = format!("Instance {} already terminated", record.instance_id);
            return self.output().map(Some);
        }

        let now = Utc::now();
        if record.is_placeholder() {
            // Its deploy is no longer running and never recorded an instance.
            registry
                .update_instance_status(&record.instance_id, InstanceStatus::Terminated, now)
                .await?;
            self.result.success = true;
            self.result.already_terminated = true;
            self.result.message = format!(
                "No instance was provisioned for {}; deployment record closed",
                record.instance_id
            );
            return self.output().map(Some);
        }

        if let Err(e) = registry
            .update_instance_status(&record.instance_id, InstanceStatus::Terminating, now)
            .await
        {
            warn!(instance_id = %record.instance_id, "[workflow] could not mark instance terminating: {}", e);
        }
        self.instance = Some(record);
        Ok(None)
    }

    async fn stop_session(&mut self) -> Result<()> {
        let instance_id = self.instance()?.instance_id.clone();
        let res = self.deps.sessions.stop_session(&instance_id).await;
        self.result.stop_session_state = Some(if res.stopped_successfully {
            BestEffortOutcome::succeeded(res.message)
        } else {
            BestEffortOutcome::failed(res.message)
        });
        Ok(())
    }

    async fn detach_volumes(&mut self) -> Result<()> {
        let instance_id = self.instance()?.instance_id.clone();
        let provisioning = &self.deps.provisioning;

        let outcome = match provisioning.get_instance_details(&instance_id).await {
            Ok(details) => {
                let mut detached = Vec::new();
                let mut failures = Vec::new();
                for volume in details.volumes.iter().filter(|v| !v.is_root) {
                    match provisioning.detach_volume(&instance_id, &volume.volume_id).await {
                        Ok(()) => detached.push(volume.volume_id.clone()),
                        Err(e) => {
                            warn!(instance_id = %instance_id, volume_id = %volume.volume_id, "[workflow] detach failed: {}", e);
                            failures.push(format!("{}: {}", volume.volume_id, e));
                        }
                    }
                }
                if !failures.is_empty() {
                    BestEffortOutcome::failed(failures.join("; "))
                } else if detached.is_empty() {
                    BestEffortOutcome::skipped("no data volumes attached")
                } else {
                    BestEffortOutcome::succeeded(format!("detached {}", detached.join(", ")))
                }
            }
            Err(e) => {
                warn!(instance_id = %instance_id, "[workflow] could not list volumes: {}", e);
                BestEffortOutcome::failed(e.to_string())
            }
        };
        self.result.detach_volume_state = Some(outcome);
        Ok(())
    }

    async fn terminate_instance(&mut self) -> Result<()> {
        let instance_id = self.instance()?.instance_id.clone();
        let res = self
            .deps
            .provisioning
            .terminate_and_wait(&instance_id, self.deps.settings.timings.instance_max_wait)
            .await?;
        info!(
            instance_id = %instance_id,
            state = %res.current_state,
            already = res.was_already_terminated,
            "[workflow] instance terminated"
        );
        Ok(())
    }

    async fn persist_terminated_status(&mut self) -> Result<Value> {
        let (instance_id, arn) = {
            let i = self.instance()?;
            (i.instance_id.clone(), i.arn.clone())
        };
        let registry = &self.deps.registry;
        let mut problems = Vec::new();
        if let Err(e) = registry
            .update_instance_status(&instance_id, InstanceStatus::Terminated, Utc::now())
            .await
        {
            problems.push(format!("instance record: {}", e));
        }
        if let Err(e) = registry.delete_session(&arn).await {
            problems.push(format!("session record: {}", e));
        }
        self.result.persist_state = Some(if problems.is_empty() {
            BestEffortOutcome::succeeded("records updated")
        } else {
            warn!(instance_id = %instance_id, "[workflow] persisting termination failed: {:?}", problems);
            BestEffortOutcome::failed(problems.join("; "))
        });

        self.result.success = true;
        self.result.summarize();
        info!(user_id = %self.user_id, instance_id = %instance_id, "[workflow] terminate complete");
        self.output()
    }

    fn output(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.result)?)
    }

    async fn run_state(&mut self) -> Result<Option<Value>> {
        match self.state {
            TerminateState::ResolveActiveInstance => return self.resolve_active_instance().await,
            TerminateState::StopSession => self.stop_session().await?,
            TerminateState::DetachVolumes => self.detach_volumes().await?,
            TerminateState::TerminateInstance => self.terminate_instance().await?,
            TerminateState::PersistTerminatedStatus => {
                return self.persist_terminated_status().await.map(Some)
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl WorkflowRun for TerminateRun {
    fn initial_step(&self) -> &'static str {
        TerminateState::ResolveActiveInstance.name()
    }

    async fn step(&mut self) -> StepTransition {
        info!(
            execution_id = %self.execution_id,
            user_id = %self.user_id,
            step = self.state.name(),
            "[workflow] terminate step"
        );
        match self.run_state().await {
            Ok(Some(output)) => StepTransition::Succeeded(output),
            Ok(None) => match self.state.next() {
                Some(next) => {
                    self.state = next;
                    StepTransition::Next(next.name())
                }
                None => match self.output() {
                    Ok(output) => StepTransition::Succeeded(output),
                    Err(e) => StepTransition::Failed(StepFailure::from(e)),
                },
            },
            Err(e) => StepTransition::Failed(StepFailure::from(e)),
        }
    }
}
