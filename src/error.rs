//! Error types for the relay
//!
//! Every failure the relay can hit maps onto one of five kinds: configuration
//! problems at startup, queue transport failures, rows rejected by the sink,
//! commit confirmation running out of retries, and I/O failures of the sink
//! channel itself. All of them are terminal for the run.

use std::error::Error as StdError;
use thiserror::Error;

/// Boxed error used as the `source` of transport and channel failures
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the relay
pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or malformed configuration, including credential material
    #[error("configuration error: {0}")]
    Config(String),

    /// Queue connection or access failure
    #[error("queue transport error [{code}]: {message}")]
    Transport {
        /// Transport-specific diagnostic code
        code: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The sink rejected a submitted row
    #[error("row {sequence_id} rejected by sink: {message}")]
    Validation { sequence_id: u64, message: String },

    /// The sink never reported the expected offset token
    #[error(
        "failed to receive required offset token {expected} after {retries} retries \
         (last seen: {}) at {messages_read} messages",
        .last_seen.as_deref().unwrap_or("none")
    )]
    ConfirmationTimeout {
        expected: String,
        last_seen: Option<String>,
        retries: u32,
        messages_read: u64,
    },

    /// The sink channel itself failed (storage, background flusher)
    #[error("sink channel error: {message}")]
    Channel {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
}

impl RelayError {
    pub fn config(message: impl Into<String>) -> Self {
        RelayError::Config(message.into())
    }

    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::Transport {
            code: code.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(
        code: impl Into<String>,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        RelayError::Transport {
            code: code.into(),
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn channel(message: impl Into<String>) -> Self {
        RelayError::Channel {
            message: message.into(),
            source: None,
        }
    }

    pub fn channel_with_source(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        RelayError::Channel {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::ConfirmationTimeout { .. } => 1,
            RelayError::Transport { .. } => 2,
            RelayError::Validation { .. } => 3,
            RelayError::Channel { .. } => 4,
            RelayError::Config(_) => 255,
        }
    }

    /// Render the causes below this error, outermost first
    pub fn causes(&self) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = self.source();
        while let Some(cause) = current {
            chain.push(cause.to_string());
            current = cause.source();
        }
        chain
    }

    /// Log the error with its diagnostic code and full causal chain
    pub fn report(&self) {
        match self {
            RelayError::Transport { code, message, .. } => {
                tracing::error!(code = %code, "Queue transport error: {}", message);
            }
            RelayError::ConfirmationTimeout {
                expected,
                last_seen,
                retries,
                messages_read,
            } => {
                tracing::error!(
                    expected = %expected,
                    last_seen = last_seen.as_deref().unwrap_or("none"),
                    retries,
                    messages_read,
                    "Sink did not confirm the batch"
                );
            }
            other => tracing::error!("{}", other),
        }

        for cause in self.causes() {
            tracing::error!("... caused by: {}", cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_exit_codes() {
        let timeout = RelayError::ConfirmationTimeout {
            expected: "1".to_string(),
            last_seen: Some("0".to_string()),
            retries: 100,
            messages_read: 1,
        };
        assert_eq!(timeout.exit_code(), 1);
        assert_eq!(RelayError::transport("2059", "down").exit_code(), 2);
        assert_eq!(
            RelayError::Validation {
                sequence_id: 2,
                message: "bad".to_string()
            }
            .exit_code(),
            3
        );
        assert_eq!(RelayError::channel("disk full").exit_code(), 4);
        assert_ne!(RelayError::config("missing").exit_code(), 0);
    }

    #[test]
    fn test_timeout_message_names_expected_and_seen() {
        let err = RelayError::ConfirmationTimeout {
            expected: "1".to_string(),
            last_seen: Some("0".to_string()),
            retries: 100,
            messages_read: 1,
        };
        let text = err.to_string();
        assert!(text.contains("offset token 1"));
        assert!(text.contains("last seen: 0"));

        let never = RelayError::ConfirmationTimeout {
            expected: "3".to_string(),
            last_seen: None,
            retries: 5,
            messages_read: 3,
        };
        assert!(never.to_string().contains("last seen: none"));
    }

    #[test]
    fn test_causal_chain() {
        let inner = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        let err = RelayError::transport_with_source("io:ConnectionReset", "event loop failed", inner);

        let causes = err.causes();
        assert_eq!(causes, vec!["peer reset".to_string()]);
        assert!(RelayError::transport("x", "y").causes().is_empty());
    }
}
