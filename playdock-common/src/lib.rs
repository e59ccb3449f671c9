use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod bus;
pub mod status;

/// Prefix of the provisional instance id written before the provider assigns a real one.
pub const PLACEHOLDER_PREFIX: &str = "pending-";

pub fn placeholder_instance_id(execution_id: &str) -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, execution_id)
}

pub fn is_placeholder_instance_id(instance_id: &str) -> bool {
    instance_id.starts_with(PLACEHOLDER_PREFIX)
}

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "gaming_instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Deploying,   // Workflow is provisioning/configuring the instance
    Running,     // Streaming session is usable
    Terminating, // Termination requested at the provider
    Terminated,  // Destroyed (records are never hard-deleted)
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Deploying => "deploying",
            InstanceStatus::Running => "running",
            InstanceStatus::Terminating => "terminating",
            InstanceStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deploying" => Some(InstanceStatus::Deploying),
            "running" => Some(InstanceStatus::Running),
            "terminating" => Some(InstanceStatus::Terminating),
            "terminated" => Some(InstanceStatus::Terminated),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, InstanceStatus::Terminated)
    }
}

// --- Entities (SQLx Mapped) ---

/// One provisioned compute instance owned by a user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow)]
pub struct GamingInstance {
    pub instance_id: String,
    pub user_id: String,
    pub arn: String,
    pub status: InstanceStatus,
    pub execution_id: Option<String>,
    pub creation_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub terminated_at: Option<DateTime<Utc>>,
}

impl GamingInstance {
    /// Provisional record written when a deploy workflow starts.
    pub fn placeholder(user_id: &str, execution_id: &str, now: DateTime<Utc>) -> Self {
        let instance_id = placeholder_instance_id(execution_id);
        Self {
            arn: instance_id.clone(),
            instance_id,
            user_id: user_id.to_string(),
            status: InstanceStatus::Deploying,
            execution_id: Some(execution_id.to_string()),
            creation_time: now,
            last_modified_time: now,
            terminated_at: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        is_placeholder_instance_id(&self.instance_id)
    }
}

/// Connection record for an active remote-desktop endpoint, keyed by the owning instance ARN.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow)]
pub struct StreamingSession {
    pub instance_arn: String,
    pub user_id: String,
    pub session_id: String,
    pub host: String,
    pub port: i32,
    pub username: String,
    #[serde(skip_serializing)] // Only exposed through SessionCredentials
    pub password: String,
    pub streaming_link: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_roundtrip() {
        for s in [
            InstanceStatus::Deploying,
            InstanceStatus::Running,
            InstanceStatus::Terminating,
            InstanceStatus::Terminated,
        ] {
            assert_eq!(InstanceStatus::parse(s.as_str()), Some(s));
            assert_eq!(InstanceStatus::parse(&s.as_str().to_uppercase()), Some(s));
        }
        assert_eq!(InstanceStatus::parse("stopped"), None);
        assert!(!InstanceStatus::Terminated.is_active());
        assert!(InstanceStatus::Terminating.is_active());
    }

    #[test]
    fn placeholder_record_carries_execution() {
        let now = Utc::now();
        let rec = GamingInstance::placeholder("u1", "exec-1", now);
        assert_eq!(rec.instance_id, "pending-exec-1");
        assert!(rec.is_placeholder());
        assert_eq!(rec.execution_id.as_deref(), Some("exec-1"));
        assert_eq!(rec.status, InstanceStatus::Deploying);
        assert!(!is_placeholder_instance_id("i-0abc"));
    }
}
