//! Commit confirmation
//!
//! The channel persists rows in the background, so after a drain pass the
//! relay polls the latest committed offset token until it equals the
//! watermark of the pass. The poll is bounded by a [`RetryPolicy`]; running
//! out of retries is fatal.

use crate::channel::IngestChannel;
use crate::context::BatchContext;
use crate::error::{RelayError, RelayResult};
use std::time::Duration;
use tracing::{debug, info};

/// Bounded retry schedule for offset polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    interval: Duration,
    max_interval: Option<Duration>,
}

impl RetryPolicy {
    /// Same pause before every retry
    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            max_interval: None,
        }
    }

    /// Pause doubles after every retry, capped at `max_interval`
    pub fn exponential(max_retries: u32, interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_retries,
            interval,
            max_interval: Some(max_interval),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Pause before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match self.max_interval {
            None => self.interval,
            Some(cap) => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.interval.saturating_mul(factor).min(cap)
            }
        }
    }

    /// Upper bound of the time spent sleeping before giving up
    pub fn total_wait(&self) -> Duration {
        (1..=self.max_retries).map(|retry| self.delay(retry)).sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(100, Duration::from_secs(1))
    }
}

/// A confirmed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub token: String,
    /// Polls needed after the first one
    pub retries: u32,
}

#[derive(Debug, Clone, Default)]
pub struct CommitConfirmer {
    policy: RetryPolicy,
}

impl CommitConfirmer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Wait until the channel reports `watermark` as its committed offset
    ///
    /// Tokens are compared as strings; a missing token counts as a mismatch.
    pub async fn confirm<C>(
        &self,
        channel: &mut C,
        watermark: u64,
        ctx: &mut BatchContext,
    ) -> RelayResult<Confirmation>
    where
        C: IngestChannel + ?Sized,
    {
        let expected = watermark.to_string();
        let mut retries = 0;
        let mut token = channel.latest_committed_offset().await?;

        loop {
            ctx.record_committed(token.clone());

            if let Some(token) = token.as_deref().filter(|t| *t == expected) {
                info!(offset = %token, retries, "Batch committed");
                return Ok(Confirmation {
                    token: token.to_string(),
                    retries,
                });
            }

            if retries >= self.policy.max_retries {
                return Err(RelayError::ConfirmationTimeout {
                    expected,
                    last_seen: token,
                    retries,
                    messages_read: ctx.messages_read(),
                });
            }

            debug!(
                "Offset needed: {} - offset from sink: {}",
                expected,
                token.as_deref().unwrap_or("none")
            );

            retries += 1;
            tokio::time::sleep(self.policy.delay(retries)).await;
            token = channel.latest_committed_offset().await?;
        }
    }
}
