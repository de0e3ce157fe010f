//! Batch drainer
//!
//! Empties the currently visible backlog of the queue into the ingestion
//! channel, one row per message, tagging each row with the next sequence id.

use crate::channel::IngestChannel;
use crate::context::BatchContext;
use crate::error::{RelayError, RelayResult};
use crate::queue::QueueSource;
use crate::record::RowBuilder;
use tracing::debug;

/// Result of one drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Rows accepted by the channel during this pass
    pub submitted: u64,

    /// Highest sequence id handed out so far, 0 before the first row
    pub watermark: u64,
}

impl DrainOutcome {
    pub fn did_work(&self) -> bool {
        self.submitted > 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct Drainer {
    rows: RowBuilder,
}

impl Drainer {
    pub fn new(rows: RowBuilder) -> Self {
        Self { rows }
    }

    /// Drain the queue until it reports no pending messages
    ///
    /// The first rejected row aborts the pass with a validation error; rows
    /// accepted before it stay counted in `ctx`.
    pub async fn drain<Q, C>(
        &self,
        queue: &mut Q,
        channel: &mut C,
        ctx: &mut BatchContext,
    ) -> RelayResult<DrainOutcome>
    where
        Q: QueueSource + ?Sized,
        C: IngestChannel + ?Sized,
    {
        let mut submitted = 0;

        while queue.pending_count().await? > 0 {
            let message = queue.receive().await?;
            ctx.record_read();

            debug!(
                size = message.payload().len(),
                "<msg>{}</msg>",
                String::from_utf8_lossy(message.payload())
            );

            let sequence_id = ctx.claim()?;
            let row = self.rows.build(message.payload());
            let response = channel.submit(row, &sequence_id.to_string()).await?;

            if let Some(error) = response.first_error() {
                return Err(RelayError::Validation {
                    sequence_id,
                    message: error.message.clone(),
                });
            }

            ctx.advance();
            submitted += 1;
        }

        Ok(DrainOutcome {
            submitted,
            watermark: ctx.watermark(),
        })
    }
}
