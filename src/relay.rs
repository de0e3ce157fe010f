//! Batch cycle scheduler
//!
//! The relay runs one sequential loop: drain the queue, wait out the batching
//! window, and, if the drain submitted anything, block until the channel
//! confirms the pass and then settle the drained messages on the queue. A new drain never starts before the previous pass is
//! confirmed, which keeps every sequence id tied to exactly one batch.
//!
//! The loop only ends through an error. Whatever the reason, [`Relay::shutdown`]
//! releases the queue, the transport and the channel, in that order.

use crate::channel::IngestChannel;
use crate::confirm::{CommitConfirmer, Confirmation, RetryPolicy};
use crate::context::BatchContext;
use crate::drain::{DrainOutcome, Drainer};
use crate::error::{RelayError, RelayResult};
use crate::queue::QueueSource;
use crate::record::RowBuilder;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Phase of the batch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Draining,
    Confirming,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleState::Idle => write!(f, "idle"),
            CycleState::Draining => write!(f, "draining"),
            CycleState::Confirming => write!(f, "confirming"),
        }
    }
}

/// Timing and row layout of the relay
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Batching window slept after every drain pass
    pub idle_wait: Duration,
    pub retry: RetryPolicy,
    pub rows: RowBuilder,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            rows: RowBuilder::default(),
        }
    }
}

/// Result of one full cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub drained: DrainOutcome,
    /// `None` when the pass submitted nothing and confirmation was skipped
    pub confirmation: Option<Confirmation>,
}

/// Counters reported at teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySummary {
    pub messages_read: u64,
    pub next_sequence_id: u64,
    pub final_offset: Option<String>,
}

pub struct Relay<Q, C> {
    queue: Q,
    channel: C,
    drainer: Drainer,
    confirmer: CommitConfirmer,
    idle_wait: Duration,
    context: BatchContext,
    state: CycleState,
    cycles: u64,
}

impl<Q, C> Relay<Q, C>
where
    Q: QueueSource,
    C: IngestChannel,
{
    pub fn new(queue: Q, channel: C, settings: RelaySettings) -> Self {
        Self::with_context(queue, channel, settings, BatchContext::new())
    }

    pub fn with_context(
        queue: Q,
        channel: C,
        settings: RelaySettings,
        context: BatchContext,
    ) -> Self {
        Self {
            queue,
            channel,
            drainer: Drainer::new(settings.rows),
            confirmer: CommitConfirmer::new(settings.retry),
            idle_wait: settings.idle_wait,
            context,
            state: CycleState::Idle,
            cycles: 0,
        }
    }

    /// Build a relay whose sequence ids continue after the channel's committed offset
    pub async fn resume(queue: Q, mut channel: C, settings: RelaySettings) -> RelayResult<Self> {
        let committed = channel.latest_committed_offset().await?;
        let context = BatchContext::resume_after(committed.as_deref())?;
        info!(
            committed = committed.as_deref().unwrap_or("none"),
            next_sequence_id = context.next_sequence_id(),
            "Resuming sequence ids from channel offset"
        );
        Ok(Self::with_context(queue, channel, settings, context))
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn transition(&mut self, next: CycleState) {
        debug!(from = %self.state, to = %next, "Cycle transition");
        self.state = next;
    }

    /// Run one drain → idle wait → confirm cycle
    pub async fn run_cycle(&mut self) -> RelayResult<CycleReport> {
        self.transition(CycleState::Draining);
        let drained = self
            .drainer
            .drain(&mut self.queue, &mut self.channel, &mut self.context)
            .await?;

        if drained.did_work() {
            info!(
                rows = drained.submitted,
                watermark = drained.watermark,
                "Drained queue"
            );
        }

        // The batching window runs every cycle, before any confirmation
        self.transition(CycleState::Idle);
        tokio::time::sleep(self.idle_wait).await;

        let confirmation = if drained.did_work() {
            self.transition(CycleState::Confirming);
            let confirmation = self
                .confirmer
                .confirm(&mut self.channel, drained.watermark, &mut self.context)
                .await?;
            // Only a committed batch may leave the queue for good
            self.queue.acknowledge().await?;
            self.transition(CycleState::Idle);
            Some(confirmation)
        } else {
            None
        };

        self.cycles += 1;
        Ok(CycleReport {
            drained,
            confirmation,
        })
    }

    /// Cycle until an error ends the run
    pub async fn run(&mut self) -> RelayError {
        loop {
            if let Err(e) = self.run_cycle().await {
                self.state = CycleState::Idle;
                return e;
            }
        }
    }

    /// Release the queue, the transport and the channel, then report counters
    ///
    /// Every step runs even if an earlier one fails; failures are logged.
    pub async fn shutdown(&mut self) -> RelaySummary {
        debug!("Disconnecting from the queue");

        if let Err(e) = self.queue.close().await {
            warn!("Error closing queue: {}", e);
        }
        if let Err(e) = self.queue.disconnect().await {
            warn!("Error disconnecting queue transport: {}", e);
        }
        if let Err(e) = self.channel.close().await {
            warn!("Error closing ingest channel: {}", e);
        }

        let summary = RelaySummary {
            messages_read: self.context.messages_read(),
            next_sequence_id: self.context.next_sequence_id(),
            final_offset: self.context.last_committed().map(str::to_string),
        };

        info!("Total messages read from queue: {}", summary.messages_read);
        info!(
            "Final offset in sink: {}",
            summary.final_offset.as_deref().unwrap_or("none")
        );
        summary
    }
}
