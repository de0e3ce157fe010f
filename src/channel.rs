//! Ingestion channel abstraction
//!
//! Rows are submitted one at a time, each tagged with an offset token. The
//! channel persists them in the background and exposes the token of the
//! latest durably committed row. Polling that token is the only way to learn
//! that a submission is durable.

use crate::error::RelayResult;
use crate::record::Row;
use async_trait::async_trait;

/// A single row-level rejection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertError {
    /// Offset token of the rejected row
    pub offset_token: String,
    pub message: String,
}

/// Outcome of a row submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertValidationResponse {
    errors: Vec<InsertError>,
}

impl InsertValidationResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn rejected(offset_token: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![InsertError {
                offset_token: offset_token.into(),
                message: message.into(),
            }],
        }
    }

    pub fn push(&mut self, error: InsertError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&InsertError> {
        self.errors.first()
    }

    pub fn errors(&self) -> &[InsertError] {
        &self.errors
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngestChannel: Send {
    /// Submit one row tagged with its offset token
    async fn submit(&mut self, row: Row, offset_token: &str)
        -> RelayResult<InsertValidationResponse>;

    /// Token of the latest durably committed row, if any
    async fn latest_committed_offset(&mut self) -> RelayResult<Option<String>>;

    /// Flush what is pending and release the channel
    async fn close(&mut self) -> RelayResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_response() {
        let ok = InsertValidationResponse::ok();
        assert!(!ok.has_errors());
        assert!(ok.first_error().is_none());

        let mut rejected = InsertValidationResponse::rejected("2", "content too large");
        rejected.push(InsertError {
            offset_token: "2".to_string(),
            message: "second problem".to_string(),
        });
        assert!(rejected.has_errors());
        assert_eq!(rejected.errors().len(), 2);
        assert_eq!(
            rejected.first_error().map(|e| e.message.as_str()),
            Some("content too large")
        );
    }
}
