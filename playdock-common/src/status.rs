//! Client-facing payloads returned while polling a workflow.

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    Deploy,
    Terminate,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowKind::Deploy => "deploy",
            WorkflowKind::Terminate => "terminate",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WorkflowStarted {
    pub execution_id: String,
}

/// Result of `get_deployment_status`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Running {
        execution_id: String,
        workflow: WorkflowKind,
        current_step: Option<String>,
        step_order: Option<usize>,
        total_steps: usize,
        completed_steps: usize,
        progress: u8,
        message: String,
    },
    Succeeded {
        execution_id: String,
        workflow: WorkflowKind,
        instance_id: Option<String>,
        instance_arn: Option<String>,
        streaming_link: Option<String>,
        message: String,
    },
    Failed {
        execution_id: String,
        workflow: WorkflowKind,
        error_step: Option<String>,
        error_type: String,
        error_message: String,
        message: String,
    },
    NotFound {
        message: String,
    },
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::Running { .. })
    }
}

/// Credentials a client needs to open the remote desktop.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub endpoint: String,
    pub username: String,
    pub password: Option<String>,
    pub session_id: String,
}
