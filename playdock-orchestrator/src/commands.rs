//! Remote Command Executor: fire a script at an instance's command agent, then await it with a deadline.

use std::sync::Arc;
use std::time::Duration;

use playdock_providers::inventory::InvocationStatus;
use playdock_providers::{CommandAgent, ProviderError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, Result};
use crate::retry::{retry_idempotent, RetryPolicy};
use crate::settings::Timings;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub command_id: String,
    pub instance_id: String,
    pub stdout: String,
    pub stderr: String,
}

pub struct RemoteCommandExecutor {
    agent: Arc<dyn CommandAgent>,
    poll_interval: Duration,
    default_timeout: Duration,
    retry: RetryPolicy,
}

impl RemoteCommandExecutor {
    pub fn new(agent: Arc<dyn CommandAgent>, timings: &Timings) -> Self {
        Self {
            agent,
            poll_interval: timings.command_poll_interval,
            default_timeout: timings.command_timeout,
            retry: RetryPolicy::from_timings(timings),
        }
    }

    /// Submit a script. Returns as soon as the agent accepted it.
    pub async fn run_command(&self, instance_id: &str, script_lines: &[String]) -> Result<String> {
        self.run_command_with_comment(instance_id, script_lines, None)
            .await
    }

    pub async fn run_command_with_comment(
        &self,
        instance_id: &str,
        script_lines: &[String],
        comment: Option<&str>,
    ) -> Result<String> {
        let command_id = self
            .agent
            .send_command(instance_id, script_lines, comment)
            .await
            .map_err(LifecycleError::from_backend)?;
        info!(
            instance_id,
            command_id = %command_id,
            lines = script_lines.len(),
            "[command] submitted{}",
            comment.map(|c| format!(" ({})", c)).unwrap_or_default()
        );
        Ok(command_id)
    }

    /// Poll on a fixed interval until the invocation is terminal or `timeout` elapses.
    /// An invocation that is not visible yet is retried, not failed.
    pub async fn wait_for_command(
        &self,
        command_id: &str,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let deadline = Instant::now() + timeout;
        loop {
            let polled = retry_idempotent("get_command_invocation", self.retry, || {
                self.agent.get_command_invocation(command_id, instance_id)
            })
            .await;

            match polled {
                Ok(inv) if inv.status == InvocationStatus::Success => {
                    debug!(instance_id, command_id, "[command] succeeded");
                    return Ok(CommandOutput {
                        command_id: command_id.to_string(),
                        instance_id: instance_id.to_string(),
                        stdout: inv.stdout,
                        stderr: inv.stderr,
                    });
                }
                Ok(inv) if inv.status.is_terminal() => {
                    let reason = if inv.stderr.trim().is_empty() {
                        format!("command ended with status {}", inv.status.as_str())
                    } else {
                        inv.stderr.trim().to_string()
                    };
                    warn!(instance_id, command_id, status = inv.status.as_str(), "[command] failed: {}", reason);
                    return Err(LifecycleError::CommandFailed {
                        command_id: command_id.to_string(),
                        instance_id: instance_id.to_string(),
                        status: inv.status.as_str().to_string(),
                        reason,
                    });
                }
                Ok(inv) => {
                    debug!(instance_id, command_id, status = inv.status.as_str(), "[command] still running");
                }
                Err(ProviderError::InvocationDoesNotExist { .. }) => {
                    debug!(instance_id, command_id, "[command] invocation not visible yet");
                }
                Err(e) => return Err(LifecycleError::from_backend(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(instance_id, command_id, "[command] deadline exceeded");
                return Err(LifecycleError::CommandTimedOut {
                    command_id: command_id.to_string(),
                    instance_id: instance_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn run_and_wait(
        &self,
        instance_id: &str,
        script_lines: &[String],
        comment: Option<&str>,
    ) -> Result<CommandOutput> {
        let command_id = self
            .run_command_with_comment(instance_id, script_lines, comment)
            .await?;
        self.wait_for_command(&command_id, instance_id, self.default_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playdock_providers::mock::MockCommandAgent;

    fn timings() -> Timings {
        Timings {
            command_poll_interval: Duration::from_millis(1),
            command_timeout: Duration::from_secs(2),
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(2),
            ..Timings::default()
        }
    }

    fn lines(s: &[&str]) -> Vec<String> {
        s.iter().map(|l| l.to_string()).collect()
    }

    #[tokio::test]
    async fn invisible_invocation_is_retried_until_success() {
        let agent = Arc::new(MockCommandAgent::new().with_invisible_polls(3).with_polls_to_complete(2));
        let exec = RemoteCommandExecutor::new(agent.clone(), &timings());
        let out = exec
            .run_and_wait("i-1", &lines(&["Write-Output hello"]), Some("greet"))
            .await
            .unwrap();
        assert_eq!(out.stdout, "ok");
        assert_eq!(agent.sent_scripts(), vec![("i-1".to_string(), "Write-Output hello".to_string())]);
    }

    #[tokio::test]
    async fn failed_invocation_reports_reason() {
        let agent = Arc::new(MockCommandAgent::new());
        agent.fail_scripts_containing("boom");
        let exec = RemoteCommandExecutor::new(agent, &timings());
        let err = exec
            .run_and_wait("i-1", &lines(&["boom"]), None)
            .await
            .unwrap_err();
        match err {
            LifecycleError::CommandFailed { status, reason, .. } => {
                assert_eq!(status, "Failed");
                assert!(reason.contains("exited with code 1"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hanging_invocation_times_out() {
        let agent = Arc::new(MockCommandAgent::new());
        agent.hang_scripts_containing("sleep");
        let exec = RemoteCommandExecutor::new(agent, &timings());
        let id = exec.run_command("i-1", &lines(&["sleep 999"])).await.unwrap();
        let err = exec
            .wait_for_command(&id, "i-1", Duration::from_millis(15))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CommandTimedOut");
    }

    #[tokio::test]
    async fn unknown_command_times_out_instead_of_failing() {
        let exec = RemoteCommandExecutor::new(Arc::new(MockCommandAgent::new()), &timings());
        let err = exec
            .wait_for_command("nope", "i-1", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CommandTimedOut");
    }
}
