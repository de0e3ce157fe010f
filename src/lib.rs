//! MQ Stream Relay
//!
//! Relays messages from a queue into a table through a streaming ingestion
//! channel, in micro-batches with at-least-once delivery.
//!
//! Each cycle drains every visible message into the channel, one row per
//! message tagged with an increasing sequence id, waits out a batching window,
//! and then blocks until the channel reports the last sequence id of the pass
//! as its committed offset. Only then does the next drain begin.
//!
//! # Example Configuration
//!
//! ```toml
//! [relay]
//! batch_seconds = 30
//! debug = false
//!
//! [queue]
//! queue_manager = "QM1"
//! queue = "DEV.QUEUE.1"
//! broker_host = "localhost"
//! broker_port = 1883
//!
//! [sink]
//! host = "acme.ingest.example.com"
//! user = "RELAY_USER"
//! database = "MQ_DB"
//! schema = "PUBLIC"
//! table = "MQ_MESSAGES"
//! channel_name = "MQ_CHANNEL"
//! private_key_file = "./rsa_key.p8"
//! ```

pub mod channel;
pub mod config;
pub mod confirm;
pub mod context;
pub mod credentials;
pub mod drain;
pub mod error;
pub mod local_table;
pub mod mqtt;
pub mod queue;
pub mod record;
pub mod relay;

pub use channel::{IngestChannel, InsertError, InsertValidationResponse};
pub use config::RelayConfig;
pub use confirm::{CommitConfirmer, Confirmation, RetryPolicy};
pub use context::BatchContext;
pub use drain::{DrainOutcome, Drainer};
pub use error::{RelayError, RelayResult};
pub use local_table::LocalTableChannel;
pub use mqtt::MqttQueue;
pub use queue::{Message, QueueSource};
pub use record::{Row, RowBuilder};
pub use relay::{CycleState, Relay, RelaySettings, RelaySummary};
