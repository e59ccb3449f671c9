use playdock_providers::{ProviderError, ResourceKind};

/// Error taxonomy used to decide retry/propagation policy and user-facing wording.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    ResourceNotFound,
    Configuration,
    Timeout,
    Conflict,
    Backend,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("userId is required")]
    MissingUserId,
    #[error("an image id is required to create an instance")]
    MissingImageId,
    #[error("instance {0} does not exist")]
    InstanceNotFound(String),
    #[error("instance {0} is still pending and cannot be terminated yet")]
    InstanceBusy(String),
    #[error("instance {instance_id} is in unsupported state '{state}'")]
    UnsupportedState { instance_id: String, state: String },
    #[error("instance {instance_id} did not reach '{target}' within {waited_secs}s")]
    WaiterTimedOut {
        instance_id: String,
        target: String,
        waited_secs: u64,
    },
    #[error("command {command_id} on {instance_id} did not finish within {timeout_ms}ms")]
    CommandTimedOut {
        command_id: String,
        instance_id: String,
        timeout_ms: u64,
    },
    #[error("command {command_id} on {instance_id} ended with {status}: {reason}")]
    CommandFailed {
        command_id: String,
        instance_id: String,
        status: String,
        reason: String,
    },
    #[error("instance limit exceeded: {0}")]
    BackendLimitExceeded(String),
    #[error("configuration error ({kind}): {detail}")]
    ConfigurationError { kind: ResourceKind, detail: String },
    #[error("an active stream already exists for user {0}")]
    StreamAlreadyActive(String),
    #[error("no active instance found for user {0}")]
    NoActiveInstance(String),
    #[error("a deployment is already in progress for user {0}")]
    DeploymentInProgress(String),
    #[error("execution {0} not found")]
    ExecutionNotFound(String),
    #[error("execution {0} already exists")]
    ExecutionAlreadyExists(String),
    #[error("instance {0} has no reachable address")]
    NoPublicAddress(String),
    #[error("failed to create instance {}", .instance_id.as_deref().unwrap_or("(not created)"))]
    CreateAndWait {
        instance_id: Option<String>,
        #[source]
        source: Box<LifecycleError>,
    },
    #[error("backend error: {0}")]
    Backend(#[source] ProviderError),
    #[error("registry error: {0}")]
    Registry(#[from] sqlx::Error),
    #[error("could not encode workflow output: {0}")]
    OutputEncoding(#[from] serde_json::Error),
}

impl LifecycleError {
    /// Map a backend failure to the lifecycle taxonomy.
    pub fn from_backend(err: ProviderError) -> Self {
        match err {
            ProviderError::InstanceNotFound(id) => LifecycleError::InstanceNotFound(id),
            ProviderError::LimitExceeded(detail) => LifecycleError::BackendLimitExceeded(detail),
            ProviderError::MissingResource { kind, detail } => {
                LifecycleError::ConfigurationError { kind, detail }
            }
            other => LifecycleError::Backend(other),
        }
    }

    /// Stable machine-readable code, distinct from the human-readable message.
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::MissingUserId => "MissingUserId",
            LifecycleError::MissingImageId => "MissingImageId",
            LifecycleError::InstanceNotFound(_) => "InstanceNotFound",
            LifecycleError::InstanceBusy(_) => "InstanceBusy",
            LifecycleError::UnsupportedState { .. } => "UnsupportedState",
            LifecycleError::WaiterTimedOut { .. } => "WaiterTimedOut",
            LifecycleError::CommandTimedOut { .. } => "CommandTimedOut",
            LifecycleError::CommandFailed { .. } => "CommandFailed",
            LifecycleError::BackendLimitExceeded(_) => "BackendLimitExceeded",
            LifecycleError::ConfigurationError { .. } => "ConfigurationError",
            LifecycleError::StreamAlreadyActive(_) => "StreamAlreadyActive",
            LifecycleError::NoActiveInstance(_) => "NoActiveInstance",
            LifecycleError::DeploymentInProgress(_) => "DeploymentInProgress",
            LifecycleError::ExecutionNotFound(_) => "ExecutionNotFound",
            LifecycleError::ExecutionAlreadyExists(_) => "ExecutionAlreadyExists",
            LifecycleError::NoPublicAddress(_) => "NoPublicAddress",
            LifecycleError::CreateAndWait { source, .. } => source.code(),
            LifecycleError::Backend(_) => "BackendError",
            LifecycleError::Registry(_) => "RegistryError",
            LifecycleError::OutputEncoding(_) => "OutputEncoding",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LifecycleError::MissingUserId | LifecycleError::MissingImageId => {
                ErrorCategory::Validation
            }
            LifecycleError::InstanceNotFound(_)
            | LifecycleError::NoActiveInstance(_)
            | LifecycleError::ExecutionNotFound(_) => ErrorCategory::ResourceNotFound,
            LifecycleError::BackendLimitExceeded(_) | LifecycleError::ConfigurationError { .. } => {
                ErrorCategory::Configuration
            }
            LifecycleError::WaiterTimedOut { .. } | LifecycleError::CommandTimedOut { .. } => {
                ErrorCategory::Timeout
            }
            LifecycleError::InstanceBusy(_)
            | LifecycleError::UnsupportedState { .. }
            | LifecycleError::StreamAlreadyActive(_)
            | LifecycleError::DeploymentInProgress(_)
            | LifecycleError::ExecutionAlreadyExists(_) => ErrorCategory::Conflict,
            LifecycleError::CommandFailed { .. }
            | LifecycleError::NoPublicAddress(_)
            | LifecycleError::Backend(_) => {
                ErrorCategory::Backend
            }
            LifecycleError::CreateAndWait { source, .. } => source.category(),
            LifecycleError::Registry(_) | LifecycleError::OutputEncoding(_) => ErrorCategory::Storage,
        }
    }
}

pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn backend_errors_map_to_taxonomy() {
        let e = LifecycleError::from_backend(ProviderError::LimitExceeded("vcpu".into()));
        assert_eq!(e.code(), "BackendLimitExceeded");
        assert_eq!(e.category(), ErrorCategory::Configuration);

        let e = LifecycleError::from_backend(ProviderError::MissingResource {
            kind: ResourceKind::KeyPair,
            detail: "gaming-key".into(),
        });
        assert_eq!(e.code(), "ConfigurationError");
        assert!(e.to_string().contains("key pair"));

        let e = LifecycleError::from_backend(ProviderError::InstanceNotFound("i-1".into()));
        assert_eq!(e.category(), ErrorCategory::ResourceNotFound);
    }

    #[test]
    fn create_and_wait_keeps_cause() {
        let e = LifecycleError::CreateAndWait {
            instance_id: Some("i-1".into()),
            source: Box::new(LifecycleError::WaiterTimedOut {
                instance_id: "i-1".into(),
                target: "running".into(),
                waited_secs: 300,
            }),
        };
        assert_eq!(e.code(), "WaiterTimedOut");
        assert_eq!(e.category(), ErrorCategory::Timeout);
        assert!(e.source().is_some());
        assert_ne!(e.to_string(), e.code());
    }

    #[test]
    fn output_encoding_failures_are_errors() {
        let mut keys = std::collections::BTreeMap::new();
        keys.insert(vec![1u8], "not a string key");
        let e: LifecycleError = serde_json::to_value(&keys).unwrap_err().into();
        assert_eq!(e.code(), "OutputEncoding");
        assert_eq!(e.category(), ErrorCategory::Storage);
    }
}
