//! Lifecycle service: the entry points the API layer and the command bus call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use playdock_common::status::{DeploymentStatus, SessionCredentials, WorkflowKind, WorkflowStarted};
use playdock_common::{GamingInstance, InstanceStatus};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::commands::RemoteCommandExecutor;
use crate::engine::{LocalOrchestrator, Orchestrator};
use crate::error::{LifecycleError, Result};
use crate::provider_manager::Backends;
use crate::provisioning::InstanceProvisioningManager;
use crate::registry::RegistryStore;
use crate::session::SessionController;
use crate::settings::Settings;
use crate::status::StatusAggregator;
use crate::workflows::{LifecycleWorkflows, WorkflowDeps};

/// Lock age after which a deploy lock is considered abandoned when no execution timeout is set.
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(6 * 3600);

pub struct LifecycleService {
    registry: Arc<dyn RegistryStore>,
    orchestrator: Arc<dyn Orchestrator>,
    status: StatusAggregator,
    lock_ttl: Duration,
}

impl LifecycleService {
    pub fn new(
        registry: Arc<dyn RegistryStore>,
        orchestrator: Arc<dyn Orchestrator>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            status: StatusAggregator::new(orchestrator.clone()),
            registry,
            orchestrator,
            lock_ttl,
        }
    }

    /// Wire the whole core (provisioning, commands, sessions, workflows, local engine).
    pub fn assemble(settings: &Settings, registry: Arc<dyn RegistryStore>, backends: Backends) -> Self {
        let provisioning = Arc::new(InstanceProvisioningManager::new(backends.compute, settings));
        let commands = Arc::new(RemoteCommandExecutor::new(backends.commands, &settings.timings));
        let sessions = Arc::new(SessionController::new(provisioning.clone(), commands, settings));
        let deps = Arc::new(WorkflowDeps {
            registry: registry.clone(),
            provisioning,
            sessions,
            parameters: backends.parameters,
            settings: settings.clone(),
        });
        let orchestrator: Arc<dyn Orchestrator> = Arc::new(LocalOrchestrator::new(
            Arc::new(LifecycleWorkflows::new(deps)),
            settings.timings.execution_timeout,
        ));
        let lock_ttl = settings.timings.execution_timeout.unwrap_or(DEFAULT_LOCK_TTL);
        Self::new(registry, orchestrator, lock_ttl)
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    fn require_user(user_id: &str) -> Result<&str> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(LifecycleError::MissingUserId);
        }
        Ok(user_id)
    }

    /// Take the per-user lock, write the placeholder record, then start the deploy execution.
    pub async fn start_deploy_workflow(&self, user_id: &str) -> Result<WorkflowStarted> {
        let user_id = Self::require_user(user_id)?;
        let execution_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let stale_before = now
            - chrono::Duration::from_std(self.lock_ttl).unwrap_or_else(|_| chrono::Duration::hours(6));

        if !self
            .registry
            .try_acquire_user_lock(user_id, &execution_id, stale_before)
            .await?
        {
            info!(user_id, "[workflow] deploy rejected, another deploy holds the lock");
            return Err(LifecycleError::DeploymentInProgress(user_id.to_string()));
        }

        let placeholder = GamingInstance::placeholder(user_id, &execution_id, now);
        if let Err(e) = self.registry.put_instance(&placeholder).await {
            self.release_quietly(user_id, &execution_id).await;
            return Err(e);
        }

        let started = self
            .orchestrator
            .start_execution(
                WorkflowKind::Deploy,
                Some(execution_id.clone()),
                json!({ "userId": user_id }),
            )
            .await;
        match started {
            Ok(id) => {
                info!(user_id, execution_id = %id, "[workflow] deploy started");
                Ok(WorkflowStarted { execution_id: id })
            }
            Err(e) => {
                if let Err(err) = self
                    .registry
                    .update_instance_status(&placeholder.instance_id, InstanceStatus::Terminated, Utc::now())
                    .await
                {
                    warn!(user_id, "[workflow] could not close placeholder: {}", err);
                }
                self.release_quietly(user_id, &execution_id).await;
                Err(e)
            }
        }
    }

    async fn release_quietly(&self, user_id: &str, execution_id: &str) {
        if let Err(e) = self.registry.release_user_lock(user_id, execution_id).await {
            warn!(user_id, execution_id, "[workflow] could not release deploy lock: {}", e);
        }
    }

    /// Deploy execution still running behind one of the user's placeholder records, if any.
    /// Such a deploy may already own a backend instance that the placeholder does not name.
    async fn deploy_in_flight(&self, user_id: &str) -> Result<Option<String>> {
        for record in self.registry.instances_for_user(user_id).await? {
            if !record.is_placeholder() || !record.status.is_active() {
                continue;
            }
            let Some(execution_id) = record.execution_id else {
                continue;
            };
            match self.orchestrator.describe_execution(&execution_id).await {
                Ok(d) if !d.status.is_terminal() => return Ok(Some(execution_id)),
                Ok(_) | Err(LifecycleError::ExecutionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Start the terminate execution and point the user's latest record at it for status polling.
    /// Rejected with `DeploymentInProgress` while a deploy for the same user is still running.
    pub async fn start_terminate_workflow(&self, user_id: &str) -> Result<WorkflowStarted> {
        let user_id = Self::require_user(user_id)?;
        if let Some(deploy) = self.deploy_in_flight(user_id).await? {
            info!(user_id, deploy_execution = %deploy, "[workflow] terminate rejected, deploy still running");
            return Err(LifecycleError::DeploymentInProgress(user_id.to_string()));
        }
        let execution_id = Uuid::new_v4().to_string();

        if let Some(record) = self.registry.active_instance_for_user(user_id).await? {
            self.registry
                .set_instance_execution(&record.instance_id, &execution_id, Utc::now())
                .await?;
        }

        let id = self
            .orchestrator
            .start_execution(
                WorkflowKind::Terminate,
                Some(execution_id),
                json!({ "userId": user_id }),
            )
            .await?;
        info!(user_id, execution_id = %id, "[workflow] terminate started");
        Ok(WorkflowStarted { execution_id: id })
    }

    /// Status of the user's most recent workflow. Never fails; unknown users get `NotFound`.
    pub async fn get_deployment_status(&self, user_id: &str) -> DeploymentStatus {
        let execution_id = match self
            .registry
            .latest_tracked_instance_for_user(user_id.trim())
            .await
        {
            Ok(record) => record.and_then(|r| r.execution_id),
            Err(e) => {
                warn!(user_id, "[status] registry lookup failed: {}", e);
                None
            }
        };
        if execution_id.is_none() {
            return DeploymentStatus::NotFound {
                message: format!("No deployment found for user {}", user_id.trim()),
            };
        }
        self.status.status_for_execution(execution_id.as_deref()).await
    }

    pub async fn get_streaming_session(&self, user_id: &str) -> Result<Option<SessionCredentials>> {
        let user_id = Self::require_user(user_id)?;
        let session = self.registry.sessions_for_user(user_id).await?.into_iter().next();
        Ok(session.map(|s| SessionCredentials {
            endpoint: s.streaming_link,
            username: s.username,
            password: if s.password.is_empty() {
                None
            } else {
                Some(s.password)
            },
            session_id: s.session_id,
        }))
    }

    /// Client poll loop: fixed interval, stops on any terminal status. Returns `None` once
    /// `cancel` resolves; the running workflow is not affected.
    pub async fn wait_for_terminal_status<C>(
        &self,
        user_id: &str,
        interval: Duration,
        cancel: C,
    ) -> Option<DeploymentStatus>
    where
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        loop {
            let status = tokio::select! {
                _ = &mut cancel => return None,
                s = self.get_deployment_status(user_id) => s,
            };
            if status.is_terminal() {
                return Some(status);
            }
            tokio::select! {
                _ = &mut cancel => return None,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
