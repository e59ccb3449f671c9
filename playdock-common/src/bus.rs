use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// -----------------------------------------------------------------------------
// Channels / Streams
// -----------------------------------------------------------------------------

pub const CHANNEL_ORCHESTRATOR_COMMANDS: &str = "orchestrator_events";

// -----------------------------------------------------------------------------
// Commands (CMD:*)
// -----------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    #[serde(rename = "CMD:DEPLOY")]
    Deploy,
    #[serde(rename = "CMD:TERMINATE")]
    Terminate,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Deploy => "CMD:DEPLOY",
            CommandType::Terminate => "CMD:TERMINATE",
        }
    }
}

/// Publishers may send only `type` and `user_id`; id and timestamp are filled on receipt.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommandEnvelope {
    #[serde(default = "Uuid::new_v4")]
    pub command_id: Uuid,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub user_id: String,
    #[serde(default = "Utc::now")]
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl CommandEnvelope {
    pub fn new(command_type: CommandType, user_id: &str) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command_type,
            user_id: user_id.to_string(),
            issued_at: Utc::now(),
            correlation_id: None,
        }
    }
}
