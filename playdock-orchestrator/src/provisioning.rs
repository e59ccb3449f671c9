//! Instance Provisioning Manager: create, wait, inspect and terminate compute instances.
//!
//! Termination is state-gated (`can_terminate`) so repeated teardown never issues a second
//! terminate call for an instance that is already going away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use playdock_providers::inventory::{AttachedVolume, InstanceDescription, LaunchRequest};
use playdock_providers::{ComputeBackend, ProviderError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};
use crate::retry::{retry_idempotent, RetryPolicy};
use crate::settings::Settings;

pub const TAG_USER_ID: &str = "UserId";
pub const TAG_CREATED_AT: &str = "CreatedAt";
pub const TAG_PRODUCT: &str = "Product";
pub const TAG_NAME: &str = "Name";

#[derive(Clone, Debug, Default)]
pub struct InstanceConfig {
    pub user_id: String,
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub extra_tags: Vec<(String, String)>,
}

#[derive(Clone, Debug)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub arn: String,
    pub state: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Clone, Debug)]
pub struct InstanceDetails {
    pub instance_id: String,
    pub arn: String,
    pub state: String,
    pub instance_type: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub volumes: Vec<AttachedVolume>,
    pub tags: HashMap<String, String>,
}

impl InstanceDetails {
    pub fn volume_ids(&self) -> Vec<String> {
        self.volumes.iter().map(|v| v.volume_id.clone()).collect()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ProvisionedInstance {
    pub created: CreatedInstance,
    /// Full description once the instance reached `running` (None when not waited for).
    pub details: Option<InstanceDetails>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminationResult {
    pub instance_id: String,
    pub current_state: String,
    pub was_already_terminated: bool,
}

pub struct InstanceProvisioningManager {
    compute: Arc<dyn ComputeBackend>,
    instance_type: String,
    subnet_id: Option<String>,
    security_group_id: Option<String>,
    key_pair_name: Option<String>,
    product_tag: String,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl InstanceProvisioningManager {
    pub fn new(compute: Arc<dyn ComputeBackend>, settings: &Settings) -> Self {
        Self {
            compute,
            instance_type: settings.instance_type.clone(),
            subnet_id: settings.subnet_id.clone(),
            security_group_id: settings.security_group_id.clone(),
            key_pair_name: settings.key_pair_name.clone(),
            product_tag: settings.product_tag.clone(),
            poll_interval: settings.timings.instance_poll_interval,
            retry: RetryPolicy::from_timings(&settings.timings),
        }
    }

    pub fn compute(&self) -> &Arc<dyn ComputeBackend> {
        &self.compute
    }

    pub fn instance_arn(&self, instance_id: &str) -> String {
        self.compute.instance_arn(instance_id)
    }

    async fn describe(&self, instance_id: &str) -> std::result::Result<InstanceDescription, ProviderError> {
        retry_idempotent("describe_instance", self.retry, || {
            self.compute.describe_instance(instance_id)
        })
        .await
    }

    fn details_from(&self, d: InstanceDescription) -> InstanceDetails {
        InstanceDetails {
            arn: self.compute.instance_arn(&d.instance_id),
            instance_id: d.instance_id,
            state: d.state,
            instance_type: d.instance_type,
            public_ip: d.public_ip,
            private_ip: d.private_ip,
            volumes: d.volumes,
            tags: d.tags,
        }
    }

    pub async fn create_instance(&self, config: &InstanceConfig) -> Result<CreatedInstance> {
        let user_id = config.user_id.trim();
        if user_id.is_empty() {
            return Err(LifecycleError::MissingUserId);
        }
        let image_id = config
            .image_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(LifecycleError::MissingImageId)?;

        let mut tags = vec![
            (TAG_NAME.to_string(), format!("{}-{}", self.product_tag, user_id)),
            (TAG_USER_ID.to_string(), user_id.to_string()),
            (TAG_CREATED_AT.to_string(), Utc::now().to_rfc3339()),
            (TAG_PRODUCT.to_string(), self.product_tag.clone()),
        ];
        tags.extend(config.extra_tags.iter().cloned());

        let request = LaunchRequest {
            image_id: image_id.to_string(),
            instance_type: config
                .instance_type
                .clone()
                .unwrap_or_else(|| self.instance_type.clone()),
            subnet_id: self.subnet_id.clone(),
            security_group_ids: self.security_group_id.iter().cloned().collect(),
            key_name: self.key_pair_name.clone(),
            tags,
        };

        info!(
            user_id,
            image_id,
            instance_type = %request.instance_type,
            "[provisioning] creating instance"
        );
        let launched = self
            .compute
            .run_instance(&request)
            .await
            .map_err(LifecycleError::from_backend)?;
        info!(instance_id = %launched.instance_id, state = %launched.state, "[provisioning] instance created");

        Ok(CreatedInstance {
            arn: self.compute.instance_arn(&launched.instance_id),
            instance_id: launched.instance_id,
            state: launched.state,
            public_ip: launched.public_ip,
            private_ip: launched.private_ip,
        })
    }

    /// Poll until the instance reports `target`. With `missing_is_target`, a missing instance
    /// counts as having reached it (used for termination).
    async fn wait_for_state(
        &self,
        instance_id: &str,
        target: &str,
        max_wait: Duration,
        missing_is_target: bool,
    ) -> Result<String> {
        let started = Instant::now();
        let deadline = started + max_wait;
        loop {
            match self.describe(instance_id).await {
                Ok(d) if d.state == target => return Ok(d.state),
                Ok(d) => {
                    if target == "running" && matches!(d.state.as_str(), "shutting-down" | "terminated") {
                        return Err(LifecycleError::UnsupportedState {
                            instance_id: instance_id.to_string(),
                            state: d.state,
                        });
                    }
                    debug!(instance_id, state = %d.state, target, "[provisioning] waiting");
                }
                Err(e) if e.is_not_found() && missing_is_target => {
                    debug!(instance_id, "[provisioning] instance no longer listed; treating as {}", target);
                    return Ok(target.to_string());
                }
                Err(e) => return Err(LifecycleError::from_backend(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LifecycleError::WaiterTimedOut {
                    instance_id: instance_id.to_string(),
                    target: target.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn wait_for_instance_running(
        &self,
        instance_id: &str,
        max_wait: Duration,
    ) -> Result<InstanceDetails> {
        self.wait_for_state(instance_id, "running", max_wait, false)
            .await?;
        info!(instance_id, "[provisioning] instance is running");
        self.get_instance_details(instance_id).await
    }

    pub async fn create_and_wait(
        &self,
        config: &InstanceConfig,
        wait_for_running: bool,
        max_wait: Duration,
    ) -> Result<ProvisionedInstance> {
        let created = self
            .create_instance(config)
            .await
            .map_err(|e| LifecycleError::CreateAndWait {
                instance_id: None,
                source: Box::new(e),
            })?;

        if !wait_for_running {
            return Ok(ProvisionedInstance {
                created,
                details: None,
            });
        }

        let details = self
            .wait_for_instance_running(&created.instance_id, max_wait)
            .await
            .map_err(|e| LifecycleError::CreateAndWait {
                instance_id: Some(created.instance_id.clone()),
                source: Box::new(e),
            })?;
        Ok(ProvisionedInstance {
            created,
            details: Some(details),
        })
    }

    pub async fn get_instance_details(&self, instance_id: &str) -> Result<InstanceDetails> {
        let d = self
            .describe(instance_id)
            .await
            .map_err(LifecycleError::from_backend)?;
        Ok(self.details_from(d))
    }

    /// State-gated termination decision. Has no side effect on the instance.
    pub async fn can_terminate(&self, instance_id: &str, max_wait: Duration) -> Result<bool> {
        let state = match self.describe(instance_id).await {
            Ok(d) => d.state,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(LifecycleError::from_backend(e)),
        };

        match state.as_str() {
            "pending" => Err(LifecycleError::InstanceBusy(instance_id.to_string())),
            "stopping" => {
                info!(instance_id, "[provisioning] instance stopping; waiting for 'stopped' before terminating");
                self.wait_for_state(instance_id, "stopped", max_wait, false)
                    .await?;
                Ok(true)
            }
            "shutting-down" | "terminated" => Ok(false),
            "running" | "stopped" => Ok(true),
            _ => Err(LifecycleError::UnsupportedState {
                instance_id: instance_id.to_string(),
                state,
            }),
        }
    }

    pub async fn terminate_instance(
        &self,
        instance_id: &str,
        max_wait: Duration,
    ) -> Result<TerminationResult> {
        if !self.can_terminate(instance_id, max_wait).await? {
            info!(instance_id, "[provisioning] instance already terminated or terminating");
            return Ok(TerminationResult {
                instance_id: instance_id.to_string(),
                current_state: "terminated".to_string(),
                was_already_terminated: true,
            });
        }

        info!(instance_id, "[provisioning] terminating instance");
        match self.compute.terminate_instance(instance_id).await {
            Ok(state) => Ok(TerminationResult {
                instance_id: instance_id.to_string(),
                current_state: state,
                was_already_terminated: false,
            }),
            // Purged between the state check and the call.
            Err(e) if e.is_not_found() => Ok(TerminationResult {
                instance_id: instance_id.to_string(),
                current_state: "terminated".to_string(),
                was_already_terminated: true,
            }),
            Err(e) => Err(LifecycleError::from_backend(e)),
        }
    }

    /// Not-found counts as terminated: some backends purge records quickly.
    pub async fn wait_for_termination(
        &self,
        instance_id: &str,
        max_wait: Duration,
    ) -> Result<TerminationResult> {
        let state = self
            .wait_for_state(instance_id, "terminated", max_wait, true)
            .await?;
        Ok(TerminationResult {
            instance_id: instance_id.to_string(),
            current_state: state,
            was_already_terminated: false,
        })
    }

    pub async fn terminate_and_wait(
        &self,
        instance_id: &str,
        max_wait: Duration,
    ) -> Result<TerminationResult> {
        let res = self.terminate_instance(instance_id, max_wait).await?;
        if res.was_already_terminated {
            return Ok(res);
        }
        self.wait_for_termination(instance_id, max_wait).await
    }

    /// Capture an image without rebooting. Backend failures propagate unchanged.
    pub async fn snapshot_image(&self, instance_id: &str, user_id: &str) -> Result<String> {
        let name = format!("{}-{}-{}", self.product_tag, user_id, Utc::now().timestamp());
        let image_id = self
            .compute
            .create_image(instance_id, &name, true)
            .await
            .map_err(LifecycleError::Backend)?;
        info!(instance_id, image_id = %image_id, "[provisioning] image requested");
        Ok(image_id)
    }

    pub async fn tag_instance(&self, instance_id: &str, key: &str, value: &str) -> Result<()> {
        self.compute
            .create_tags(instance_id, &[(key.to_string(), value.to_string())])
            .await
            .map_err(|e| {
                warn!(instance_id, key, "[provisioning] tagging failed: {}", e);
                LifecycleError::from_backend(e)
            })
    }

    pub async fn detach_volume(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        self.compute
            .detach_volume(instance_id, volume_id)
            .await
            .map_err(LifecycleError::from_backend)
    }
}
