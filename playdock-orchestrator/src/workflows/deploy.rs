//! Deploy: CheckExistingStream -> CheckStreamValidity -> ProvisionInstance -> WaitInstanceRunning
//! -> ConfigureSession -> PersistSessionRecord.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use playdock_common::{placeholder_instance_id, GamingInstance, InstanceStatus, StreamingSession};
use playdock_providers::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use super::WorkflowDeps;
use crate::engine::{ExecutionOutcome, StepFailure, StepTransition, WorkflowRun};
use crate::error::{LifecycleError, Result};
use crate::provisioning::{InstanceConfig, InstanceDetails};
use crate::session::{
    generate_password, nip_io_domain, streaming_link, ConfigureOutcome, SessionEndpoint,
};

pub const DEPLOY_STEPS: [&str; 6] = [
    "CheckExistingStream",
    "CheckStreamValidity",
    "ProvisionInstance",
    "WaitInstanceRunning",
    "ConfigureSession",
    "PersistSessionRecord",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeployState {
    CheckExistingStream,
    CheckStreamValidity,
    ProvisionInstance,
    WaitInstanceRunning,
    ConfigureSession,
    PersistSessionRecord,
}

impl DeployState {
    pub fn name(&self) -> &'static str {
        DEPLOY_STEPS[self.order()]
    }

    pub fn order(&self) -> usize {
        match self {
            DeployState::CheckExistingStream => 0,
            DeployState::CheckStreamValidity => 1,
            DeployState::ProvisionInstance => 2,
            DeployState::WaitInstanceRunning => 3,
            DeployState::ConfigureSession => 4,
            DeployState::PersistSessionRecord => 5,
        }
    }

    pub fn next(&self) -> Option<DeployState> {
        match self {
            DeployState::CheckExistingStream => Some(DeployState::CheckStreamValidity),
            DeployState::CheckStreamValidity => Some(DeployState::ProvisionInstance),
            DeployState::ProvisionInstance => Some(DeployState::WaitInstanceRunning),
            DeployState::WaitInstanceRunning => Some(DeployState::ConfigureSession),
            DeployState::ConfigureSession => Some(DeployState::PersistSessionRecord),
            DeployState::PersistSessionRecord => None,
        }
    }
}

/// Execution output of a successful deploy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub instance_id: String,
    pub instance_arn: String,
    pub session_id: String,
    pub streaming_link: String,
    pub password_set: bool,
    pub ssl_configured: bool,
    pub message: String,
}

pub struct DeployRun {
    deps: Arc<WorkflowDeps>,
    execution_id: String,
    user_id: String,
    state: DeployState,
    instance_id: Option<String>,
    details: Option<InstanceDetails>,
    endpoint: Option<SessionEndpoint>,
    password: Option<String>,
    configured: Option<ConfigureOutcome>,
}

impl DeployRun {
    pub fn new(deps: Arc<WorkflowDeps>, execution_id: &str, user_id: &str) -> Self {
        Self {
            deps,
            execution_id: execution_id.to_string(),
            user_id: user_id.to_string(),
            state: DeployState::CheckExistingStream,
            instance_id: None,
            details: None,
            endpoint: None,
            password: None,
            configured: None,
        }
    }

    fn placeholder_id(&self) -> String {
        placeholder_instance_id(&self.execution_id)
    }

    async fn check_existing_stream(&self) -> Result<()> {
        let registry = &self.deps.registry;
        let sessions = registry.sessions_for_user(&self.user_id).await?;
        if sessions.is_empty() {
            return Ok(());
        }
        let instances = registry.instances_for_user(&self.user_id).await?;
        let active = sessions.iter().find(|s| {
            instances
                .iter()
                .any(|i| i.arn == s.instance_arn && i.status == InstanceStatus::Running)
        });
        if let Some(s) = active {
            info!(user_id = %self.user_id, instance_arn = %s.instance_arn, "[workflow] active stream found");
            return Err(LifecycleError::StreamAlreadyActive(self.user_id.clone()));
        }
        Ok(())
    }

    /// Reconcile the user's other live records with the backend.
    async fn check_stream_validity(&self) -> Result<()> {
        let registry = &self.deps.registry;
        let own_placeholder = self.placeholder_id();
        let now = Utc::now();

        for record in registry.instances_for_user(&self.user_id).await? {
            if !record.status.is_active() || record.instance_id == own_placeholder {
                continue;
            }
            if record.is_placeholder() {
                warn!(instance_id = %record.instance_id, "[workflow] closing abandoned placeholder");
                registry
                    .update_instance_status(&record.instance_id, InstanceStatus::Terminated, now)
                    .await?;
                continue;
            }

            match self.deps.provisioning.get_instance_details(&record.instance_id).await {
                Ok(d) if matches!(d.state.as_str(), "pending" | "running" | "stopping") => {
                    info!(instance_id = %record.instance_id, state = %d.state, "[workflow] user already has a live instance");
                    return Err(LifecycleError::StreamAlreadyActive(self.user_id.clone()));
                }
                Ok(d) if matches!(d.state.as_str(), "shutting-down" | "terminated") => {
                    registry
                        .update_instance_status(&record.instance_id, InstanceStatus::Terminated, now)
                        .await?;
                }
                Ok(d) => {
                    warn!(instance_id = %record.instance_id, state = %d.state, "[workflow] ignoring non-streaming instance");
                }
                Err(LifecycleError::InstanceNotFound(_)) => {
                    info!(instance_id = %record.instance_id, "[workflow] stale record, instance is gone");
                    registry
                        .update_instance_status(&record.instance_id, InstanceStatus::Terminated, now)
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn resolve_image_id(&self) -> Result<String> {
        if let Some(id) = &self.deps.settings.image_id {
            return Ok(id.clone());
        }
        let name = &self.deps.settings.image_parameter_name;
        match self.deps.parameters.get_parameter(name).await {
            Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            Ok(_) | Err(ProviderError::ParameterNotFound(_)) => Err(LifecycleError::MissingImageId),
            Err(e) => Err(LifecycleError::from_backend(e)),
        }
    }

    async fn provision_instance(&mut self) -> Result<()> {
        let image_id = self.resolve_image_id().await?;
        let created = self
            .deps
            .provisioning
            .create_instance(&InstanceConfig {
                user_id: self.user_id.clone(),
                image_id: Some(image_id),
                instance_type: None,
                extra_tags: vec![("ExecutionId".to_string(), self.execution_id.clone())],
            })
            .await?;
        self.instance_id = Some(created.instance_id);
        Ok(())
    }

    fn current_instance_id(&self) -> Result<String> {
        self.instance_id
            .clone()
            .ok_or_else(|| LifecycleError::InstanceNotFound(self.placeholder_id()))
    }

    async fn wait_instance_running(&mut self) -> Result<()> {
        let instance_id = self.current_instance_id()?;
        let details = self
            .deps
            .provisioning
            .wait_for_instance_running(&instance_id, self.deps.settings.timings.instance_max_wait)
            .await?;
        self.details = Some(details);
        Ok(())
    }

    async fn configure_session(&mut self) -> Result<()> {
        let instance_id = self.current_instance_id()?;
        let endpoint = self
            .deps
            .sessions
            .ensure_session_ready(&instance_id, &self.user_id)
            .await?;

        let password = generate_password();
        let outcome = self
            .deps
            .sessions
            .configure_tls_and_password(&instance_id, &endpoint.host, &password)
            .await;
        if !outcome.success() {
            warn!(
                instance_id = %instance_id,
                errors = ?outcome.errors,
                "[workflow] session configured with degraded guarantees"
            );
        }
        self.endpoint = Some(endpoint);
        self.password = Some(password);
        self.configured = Some(outcome);
        Ok(())
    }

    async fn persist_session_record(&self) -> Result<DeployResult> {
        let instance_id = self.current_instance_id()?;
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| LifecycleError::InstanceNotFound(instance_id.clone()))?;
        let configured = self.configured.clone().unwrap_or_default();

        let host = if configured.ssl_configured {
            configured
                .domain
                .clone()
                .unwrap_or_else(|| nip_io_domain(&endpoint.host))
        } else {
            endpoint.host.clone()
        };
        let link = streaming_link(&host, endpoint.port, &endpoint.session_id);
        let arn = self
            .details
            .as_ref()
            .map(|d| d.arn.clone())
            .unwrap_or_else(|| self.deps.provisioning.instance_arn(&instance_id));
        let now = Utc::now();

        self.deps
            .registry
            .put_session(&StreamingSession {
                instance_arn: arn.clone(),
                user_id: self.user_id.clone(),
                session_id: endpoint.session_id.clone(),
                host: host.clone(),
                port: i32::from(endpoint.port),
                username: endpoint.username.clone(),
                password: self.password.clone().unwrap_or_default(),
                streaming_link: link.clone(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        self.deps
            .registry
            .swap_placeholder(
                &self.placeholder_id(),
                GamingInstance {
                    instance_id: instance_id.clone(),
                    user_id: self.user_id.clone(),
                    arn: arn.clone(),
                    status: InstanceStatus::Running,
                    execution_id: Some(self.execution_id.clone()),
                    creation_time: now,
                    last_modified_time: now,
                    terminated_at: None,
                },
            )
            .await?;

        let message = deploy_message(&configured);
        info!(user_id = %self.user_id, instance_id = %instance_id, link = %link, "[workflow] deploy complete");
        Ok(DeployResult {
            instance_id,
            instance_arn: arn,
            session_id: endpoint.session_id.clone(),
            streaming_link: link,
            password_set: configured.password_set,
            ssl_configured: configured.ssl_configured,
            message,
        })
    }

    async fn run_state(&mut self) -> Result<Option<Value>> {
        match self.state {
            DeployState::CheckExistingStream => self.check_existing_stream().await?,
            DeployState::CheckStreamValidity => self.check_stream_validity().await?,
            DeployState::ProvisionInstance => self.provision_instance().await?,
            DeployState::WaitInstanceRunning => self.wait_instance_running().await?,
            DeployState::ConfigureSession => self.configure_session().await?,
            DeployState::PersistSessionRecord => {
                let result = self.persist_session_record().await?;
                return Ok(Some(serde_json::to_value(result)?));
            }
        }
        Ok(None)
    }
}

/// The degraded case stays a success but says so.
fn deploy_message(configured: &ConfigureOutcome) -> String {
    let mut missing = Vec::new();
    if !configured.password_set {
        missing.push("password not set");
    }
    if !configured.ssl_configured {
        missing.push("TLS certificate not configured");
    }
    if missing.is_empty() {
        "Streaming session is ready".to_string()
    } else {
        format!(
            "Streaming session is ready with degraded security: {}",
            missing.join(", ")
        )
    }
}

#[async_trait]
impl WorkflowRun for DeployRun {
    fn initial_step(&self) -> &'static str {
        DeployState::CheckExistingStream.name()
    }

    async fn step(&mut self) -> StepTransition {
        info!(
            execution_id = %self.execution_id,
            user_id = %self.user_id,
            step = self.state.name(),
            "[workflow] deploy step"
        );
        match self.run_state().await {
            Ok(Some(output)) => StepTransition::Succeeded(output),
            Ok(None) => match self.state.next() {
                Some(next) => {
                    self.state = next;
                    StepTransition::Next(next.name())
                }
                None => StepTransition::Succeeded(Value::Null),
            },
            Err(e) => StepTransition::Failed(StepFailure::from(e)),
        }
    }

    /// Releases the per-user lock and cleans up the instance record of a failed run.
    async fn finish(&mut self, outcome: &ExecutionOutcome) {
        let registry = &self.deps.registry;
        if !matches!(outcome, ExecutionOutcome::Succeeded(_)) {
            let placeholder = self.placeholder_id();
            let now = Utc::now();
            let cleanup = match &self.instance_id {
                // A real instance exists: keep it visible as deploying so terminate can find it.
                Some(instance_id) => registry
                    .swap_placeholder(
                        &placeholder,
                        GamingInstance {
                            instance_id: instance_id.clone(),
                            user_id: self.user_id.clone(),
                            arn: self.deps.provisioning.instance_arn(instance_id),
                            status: InstanceStatus::Deploying,
                            execution_id: Some(self.execution_id.clone()),
                            creation_time: now,
                            last_modified_time: now,
                            terminated_at: None,
                        },
                    )
                    .await
                    .map(|_| ()),
                None => registry
                    .update_instance_status(&placeholder, InstanceStatus::Terminated, now)
                    .await
                    .map(|_| ()),
            };
            if let Err(e) = cleanup {
                error!(execution_id = %self.execution_id, "[workflow] failed to record deploy failure: {}", e);
            }
        }

        match registry
            .release_user_lock(&self.user_id, &self.execution_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(user_id = %self.user_id, execution_id = %self.execution_id, "[workflow] deploy lock was not held"),
            Err(e) => error!(user_id = %self.user_id, "[workflow] failed to release deploy lock: {}", e),
        }
    }
}
