use std::future::Future;
use std::time::Duration;

use playdock_providers::ProviderError;
use tracing::warn;

use crate::settings::Timings;

/// Bounded exponential backoff for idempotent, side-effect-free backend calls (describe/poll).
/// Never wrap create/terminate/send-command in this.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_timings(t: &Timings) -> Self {
        Self {
            attempts: t.retry_attempts.max(1),
            base_delay: t.retry_base_delay,
            max_delay: t.retry_max_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

pub async fn retry_idempotent<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "[retry] {} failed (attempt {}/{}): {} - retrying in {:?}",
                    label,
                    attempt + 1,
                    policy.attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
