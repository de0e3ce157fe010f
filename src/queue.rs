//! Queue source abstraction
//!
//! The relay needs to know how many messages are visible, take the next one,
//! settle what it took once the batch is committed downstream, and finally
//! release the queue handle and the transport behind it.

use crate::error::RelayResult;
use async_trait::async_trait;

/// One message read from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueSource: Send {
    /// Messages currently waiting on the queue
    async fn pending_count(&mut self) -> RelayResult<usize>;

    /// Take the next message, waiting for one if necessary
    async fn receive(&mut self) -> RelayResult<Message>;

    /// Settle every message received so far
    ///
    /// Called once the batch holding those messages is committed. Messages
    /// not settled before the process stops are delivered again.
    async fn acknowledge(&mut self) -> RelayResult<()>;

    /// Stop consuming; messages keep accumulating on the queue
    async fn close(&mut self) -> RelayResult<()>;

    /// Tear down the transport connection
    async fn disconnect(&mut self) -> RelayResult<()>;
}
