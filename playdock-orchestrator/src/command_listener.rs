//! Redis command bus: `CMD:DEPLOY` / `CMD:TERMINATE` envelopes on `orchestrator_events`.

use std::sync::Arc;

use futures_util::StreamExt;
use playdock_common::bus::{CommandEnvelope, CommandType, CHANNEL_ORCHESTRATOR_COMMANDS};
use playdock_common::status::WorkflowStarted;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::service::LifecycleService;

pub fn parse_command(payload: &str) -> Option<CommandEnvelope> {
    match serde_json::from_str::<CommandEnvelope>(payload) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            warn!("[bus] ignoring malformed command: {} ({})", payload, e);
            None
        }
    }
}

pub async fn dispatch(service: &LifecycleService, cmd: &CommandEnvelope) -> Result<WorkflowStarted> {
    match cmd.command_type {
        CommandType::Deploy => service.start_deploy_workflow(&cmd.user_id).await,
        CommandType::Terminate => service.start_terminate_workflow(&cmd.user_id).await,
    }
}

/// Subscribe and dispatch until the connection drops.
pub async fn run(redis_client: redis::Client, service: Arc<LifecycleService>) -> redis::RedisResult<()> {
    let mut pubsub = redis_client.get_async_pubsub().await?;
    pubsub.subscribe(CHANNEL_ORCHESTRATOR_COMMANDS).await?;
    info!("[bus] listening on Redis channel '{}'", CHANNEL_ORCHESTRATOR_COMMANDS);

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!("[bus] unreadable payload: {}", e);
                continue;
            }
        };
        let Some(cmd) = parse_command(&payload) else {
            continue;
        };
        info!(
            command_id = %cmd.command_id,
            user_id = %cmd.user_id,
            correlation_id = cmd.correlation_id.as_deref().unwrap_or(""),
            "[bus] received {}",
            cmd.command_type.as_str()
        );

        let service = service.clone();
        tokio::spawn(async move {
            match dispatch(&service, &cmd).await {
                Ok(started) => info!(
                    command_id = %cmd.command_id,
                    execution_id = %started.execution_id,
                    "[bus] {} accepted",
                    cmd.command_type.as_str()
                ),
                Err(e) => error!(
                    command_id = %cmd.command_id,
                    user_id = %cmd.user_id,
                    code = e.code(),
                    "[bus] {} rejected: {}",
                    cmd.command_type.as_str(),
                    e
                ),
            }
        });
    }
    warn!("[bus] subscription stream ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands_only() {
        let cmd = parse_command(r#"{"type":"CMD:DEPLOY","user_id":"u1"}"#).unwrap();
        assert_eq!(cmd.command_type, CommandType::Deploy);
        assert!(parse_command(r#"{"type":"CMD:PROVISION","user_id":"u1"}"#).is_none());
        assert!(parse_command("not json").is_none());
    }
}
