//! Deploy and terminate workflows as explicit state machines driven by the engine.

use std::sync::Arc;

use playdock_common::status::WorkflowKind;
use playdock_providers::ParameterStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{WorkflowFactory, WorkflowRun};
use crate::error::{LifecycleError, Result};
use crate::provisioning::InstanceProvisioningManager;
use crate::registry::RegistryStore;
use crate::session::SessionController;
use crate::settings::Settings;

pub mod deploy;
pub mod terminate;

pub use deploy::{DeployResult, DeployRun, DeployState, DEPLOY_STEPS};
pub use terminate::{TerminateResult, TerminateRun, TerminateState, TERMINATE_STEPS};

/// Ordered step names of a workflow, as recorded in execution history.
pub fn steps_for(kind: WorkflowKind) -> &'static [&'static str] {
    match kind {
        WorkflowKind::Deploy => &DEPLOY_STEPS,
        WorkflowKind::Terminate => &TERMINATE_STEPS,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInput {
    pub user_id: String,
}

impl WorkflowInput {
    pub fn parse(input: &Value) -> Result<Self> {
        let parsed: WorkflowInput =
            serde_json::from_value(input.clone()).map_err(|_| LifecycleError::MissingUserId)?;
        if parsed.user_id.trim().is_empty() {
            return Err(LifecycleError::MissingUserId);
        }
        Ok(parsed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BestEffortStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Result of a best-effort step: recorded, never propagated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestEffortOutcome {
    pub status: BestEffortStatus,
    pub message: String,
}

impl BestEffortOutcome {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            status: BestEffortStatus::Succeeded,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: BestEffortStatus::Failed,
            message: message.into(),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: BestEffortStatus::Skipped,
            message: message.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == BestEffortStatus::Failed
    }
}

/// Collaborators shared by every workflow run.
pub struct WorkflowDeps {
    pub registry: Arc<dyn RegistryStore>,
    pub provisioning: Arc<InstanceProvisioningManager>,
    pub sessions: Arc<SessionController>,
    pub parameters: Arc<dyn ParameterStore>,
    pub settings: Settings,
}

pub struct LifecycleWorkflows {
    deps: Arc<WorkflowDeps>,
}

impl LifecycleWorkflows {
    pub fn new(deps: Arc<WorkflowDeps>) -> Self {
        Self { deps }
    }
}

impl WorkflowFactory for LifecycleWorkflows {
    fn create(
        &self,
        kind: WorkflowKind,
        execution_id: &str,
        input: &Value,
    ) -> Result<Box<dyn WorkflowRun>> {
        let input = WorkflowInput::parse(input)?;
        Ok(match kind {
            WorkflowKind::Deploy => Box::new(DeployRun::new(
                self.deps.clone(),
                execution_id,
                &input.user_id,
            )),
            WorkflowKind::Terminate => Box::new(TerminateRun::new(
                self.deps.clone(),
                execution_id,
                &input.user_id,
            )),
        })
    }
}
