//! State threaded through the batch cycle

use crate::error::{RelayError, RelayResult};

/// Counters carried from one drain pass to the next confirmation and beyond
///
/// Sequence ids are handed out starting at `next_sequence_id` and never go
/// backwards for the lifetime of the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    next_sequence_id: u64,
    messages_read: u64,
    last_committed: Option<String>,
}

impl BatchContext {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Context whose first submitted row gets `next_sequence_id`
    pub fn starting_at(next_sequence_id: u64) -> Self {
        Self {
            next_sequence_id: next_sequence_id.max(1),
            messages_read: 0,
            last_committed: None,
        }
    }

    /// Continue after a committed offset token reported by the sink
    ///
    /// Tokens that are not integers are ignored and numbering starts at 1. A
    /// token at `u64::MAX` leaves no id to continue with and is an error.
    pub fn resume_after(committed: Option<&str>) -> RelayResult<Self> {
        let watermark = committed.and_then(|token| token.parse::<u64>().ok());
        let mut context = match watermark {
            Some(watermark) => {
                let next = watermark.checked_add(1).ok_or_else(|| {
                    RelayError::channel(format!(
                        "Committed offset {} leaves no sequence ids to continue with",
                        watermark
                    ))
                })?;
                Self::starting_at(next)
            }
            None => Self::new(),
        };
        context.last_committed = committed.map(str::to_string);
        Ok(context)
    }

    /// Sequence id the next submitted row will carry
    pub fn next_sequence_id(&self) -> u64 {
        self.next_sequence_id
    }

    /// Highest sequence id handed out so far, 0 if none
    pub fn watermark(&self) -> u64 {
        self.next_sequence_id - 1
    }

    pub fn messages_read(&self) -> u64 {
        self.messages_read
    }

    pub fn last_committed(&self) -> Option<&str> {
        self.last_committed.as_deref()
    }

    pub(crate) fn record_read(&mut self) {
        self.messages_read += 1;
    }

    /// Sequence id for the next row, as long as one is left after it
    pub(crate) fn claim(&self) -> RelayResult<u64> {
        if self.next_sequence_id == u64::MAX {
            return Err(RelayError::channel("Sequence ids exhausted"));
        }
        Ok(self.next_sequence_id)
    }

    /// Consume the current sequence id after a successful submission
    ///
    /// Only called for an id handed out by [`BatchContext::claim`].
    pub(crate) fn advance(&mut self) -> u64 {
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        id
    }

    pub(crate) fn record_committed(&mut self, token: Option<String>) {
        if token.is_some() {
            self.last_committed = token;
        }
    }
}

impl Default for BatchContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context() {
        let ctx = BatchContext::new();
        assert_eq!(ctx.next_sequence_id(), 1);
        assert_eq!(ctx.watermark(), 0);
        assert_eq!(ctx.messages_read(), 0);
        assert!(ctx.last_committed().is_none());
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut ctx = BatchContext::new();
        assert_eq!(ctx.advance(), 1);
        assert_eq!(ctx.advance(), 2);
        assert_eq!(ctx.next_sequence_id(), 3);
        assert_eq!(ctx.watermark(), 2);
    }

    #[test]
    fn test_resume_after_committed_token() {
        let ctx = BatchContext::resume_after(Some("41")).unwrap();
        assert_eq!(ctx.next_sequence_id(), 42);
        assert_eq!(ctx.last_committed(), Some("41"));

        let ctx = BatchContext::resume_after(None).unwrap();
        assert_eq!(ctx.next_sequence_id(), 1);

        let ctx = BatchContext::resume_after(Some("not-a-number")).unwrap();
        assert_eq!(ctx.next_sequence_id(), 1);
        assert_eq!(ctx.last_committed(), Some("not-a-number"));
    }

    #[test]
    fn test_record_committed_keeps_last_seen() {
        let mut ctx = BatchContext::new();
        ctx.record_committed(Some("3".to_string()));
        ctx.record_committed(None);
        assert_eq!(ctx.last_committed(), Some("3"));
    }

    #[test]
    fn test_resume_at_top_of_id_space_is_rejected() {
        let err = BatchContext::resume_after(Some(&u64::MAX.to_string())).unwrap_err();
        assert!(matches!(err, RelayError::Channel { .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_claim_refuses_last_id() {
        let ctx = BatchContext::resume_after(Some(&(u64::MAX - 2).to_string())).unwrap();
        assert_eq!(ctx.claim().unwrap(), u64::MAX - 1);

        let mut ctx = ctx;
        ctx.advance();
        assert!(ctx.claim().is_err());
        assert_eq!(ctx.watermark(), u64::MAX - 1);
    }
}
