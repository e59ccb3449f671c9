use async_trait::async_trait;

pub use error::{ProviderError, ResourceKind};

/// Compute backend: instance lifecycle, tags, volumes and images.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Globally unique resource identifier for an instance id.
    fn instance_arn(&self, instance_id: &str) -> String;

    async fn run_instance(
        &self,
        request: &inventory::LaunchRequest,
    ) -> Result<inventory::LaunchedInstance, ProviderError>;

    /// Fails with `ProviderError::InstanceNotFound` once the provider has no record of it.
    async fn describe_instance(
        &self,
        instance_id: &str,
    ) -> Result<inventory::InstanceDescription, ProviderError>;

    /// Returns the state reported right after the termination request.
    async fn terminate_instance(&self, instance_id: &str) -> Result<String, ProviderError>;

    async fn create_tags(
        &self,
        instance_id: &str,
        tags: &[(String, String)],
    ) -> Result<(), ProviderError>;

    // Optional: volume detach. Default is a no-op for providers without attachable storage.
    async fn detach_volume(&self, _instance_id: &str, _volume_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Capture an image of the instance. Returns the new image id.
    async fn create_image(
        &self,
        instance_id: &str,
        name: &str,
        no_reboot: bool,
    ) -> Result<String, ProviderError>;
}

/// Remote command agent running on the instance. Scripts run asynchronously:
/// `send_command` returns before the script finishes.
#[async_trait]
pub trait CommandAgent: Send + Sync {
    async fn send_command(
        &self,
        instance_id: &str,
        script_lines: &[String],
        comment: Option<&str>,
    ) -> Result<String, ProviderError>;

    /// Fails with `ProviderError::InvocationDoesNotExist` while the invocation is not visible yet.
    async fn get_command_invocation(
        &self,
        command_id: &str,
        instance_id: &str,
    ) -> Result<inventory::CommandInvocation, ProviderError>;
}

/// Named configuration values (e.g. the machine image id).
#[async_trait]
pub trait ParameterStore: Send + Sync {
    async fn get_parameter(&self, name: &str) -> Result<String, ProviderError>;
}

pub mod inventory {
    use std::collections::HashMap;

    #[derive(Clone, Debug, Default)]
    pub struct LaunchRequest {
        pub image_id: String,
        pub instance_type: String,
        pub subnet_id: Option<String>,
        pub security_group_ids: Vec<String>,
        pub key_name: Option<String>,
        pub tags: Vec<(String, String)>,
    }

    #[derive(Clone, Debug)]
    pub struct LaunchedInstance {
        pub instance_id: String,
        pub state: String,
        pub public_ip: Option<String>,
        pub private_ip: Option<String>,
    }

    #[derive(Clone, Debug)]
    pub struct AttachedVolume {
        pub volume_id: String,
        pub device_name: String,
        pub is_root: bool,
    }

    #[derive(Clone, Debug)]
    pub struct InstanceDescription {
        pub instance_id: String,
        pub state: String,
        pub instance_type: Option<String>,
        pub public_ip: Option<String>,
        pub private_ip: Option<String>,
        pub volumes: Vec<AttachedVolume>,
        pub tags: HashMap<String, String>,
    }

    impl InstanceDescription {
        pub fn tag(&self, key: &str) -> Option<&str> {
            self.tags.get(key).map(|s| s.as_str())
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum InvocationStatus {
        Pending,
        InProgress,
        Delayed,
        Cancelling,
        Success,
        Failed,
        Cancelled,
        TimedOut,
    }

    impl InvocationStatus {
        pub fn is_terminal(&self) -> bool {
            matches!(
                self,
                InvocationStatus::Success
                    | InvocationStatus::Failed
                    | InvocationStatus::Cancelled
                    | InvocationStatus::TimedOut
            )
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                InvocationStatus::Pending => "Pending",
                InvocationStatus::InProgress => "InProgress",
                InvocationStatus::Delayed => "Delayed",
                InvocationStatus::Cancelling => "Cancelling",
                InvocationStatus::Success => "Success",
                InvocationStatus::Failed => "Failed",
                InvocationStatus::Cancelled => "Cancelled",
                InvocationStatus::TimedOut => "TimedOut",
            }
        }
    }

    #[derive(Clone, Debug)]
    pub struct CommandInvocation {
        pub command_id: String,
        pub instance_id: String,
        pub status: InvocationStatus,
        pub stdout: String,
        pub stderr: String,
    }
}

pub mod error {
    use std::fmt;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum ResourceKind {
        Subnet,
        SecurityGroup,
        KeyPair,
        Image,
    }

    impl fmt::Display for ResourceKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let s = match self {
                ResourceKind::Subnet => "subnet",
                ResourceKind::SecurityGroup => "security group",
                ResourceKind::KeyPair => "key pair",
                ResourceKind::Image => "image",
            };
            f.write_str(s)
        }
    }

    #[derive(Clone, Debug, thiserror::Error)]
    pub enum ProviderError {
        #[error("instance {0} not found")]
        InstanceNotFound(String),
        #[error("command invocation {command_id} not yet visible on {instance_id}")]
        InvocationDoesNotExist {
            command_id: String,
            instance_id: String,
        },
        #[error("parameter {0} not found")]
        ParameterNotFound(String),
        #[error("instance limit exceeded: {0}")]
        LimitExceeded(String),
        #[error("{kind} not found: {detail}")]
        MissingResource { kind: ResourceKind, detail: String },
        #[error("request throttled: {0}")]
        Throttled(String),
        #[error("backend unavailable: {0}")]
        Unavailable(String),
        #[error("{0}")]
        Other(String),
    }

    impl ProviderError {
        /// Failures worth retrying on idempotent calls.
        pub fn is_transient(&self) -> bool {
            matches!(self, ProviderError::Throttled(_) | ProviderError::Unavailable(_))
        }

        pub fn is_not_found(&self) -> bool {
            matches!(self, ProviderError::InstanceNotFound(_))
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;
