//! MQTT-backed queue source
//!
//! The queue manager name becomes the broker session (client id) and the
//! queue name the topic that session consumes. A background task drives the
//! MQTT event loop and forwards every publish to the relay; the number of
//! forwarded but not yet received publishes is what the drainer sees as the
//! queue depth.
//!
//! Publishes are acknowledged by hand, and only after the batch holding them
//! is committed. Until then the broker keeps them and redelivers them to the
//! next session, and stops pushing once its in-flight window for the session
//! is full.
//!
//! Connection failures are forwarded to the drainer as transport errors. The
//! session is not re-established.

use crate::config::QueueConfig;
use crate::error::{RelayError, RelayResult};
use crate::queue::{Message, QueueSource};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the client's outgoing request queue
const REQUEST_CAPACITY: usize = 16;

type Delivery = RelayResult<Publish>;

pub struct MqttQueue {
    queue_manager: String,
    queue: String,
    client: Option<AsyncClient>,
    deliveries: UnboundedReceiver<Delivery>,
    /// Received publishes waiting for their batch to commit
    unacked: Vec<Publish>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttQueue {
    /// Open a session on the broker and start consuming from the queue
    pub async fn connect(config: &QueueConfig) -> RelayResult<Self> {
        info!(
            "Connecting to queue manager {} at {}:{}",
            config.queue_manager(),
            config.broker_host,
            config.broker_port
        );

        let (client, event_loop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);

        info!("Accessing queue: {}", config.queue());
        client
            .subscribe(config.queue(), QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                RelayError::transport_with_source(
                    "subscribe",
                    format!("Failed to access queue {}", config.queue()),
                    e,
                )
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(drive_event_loop(event_loop, tx));

        info!("Connected to queue: {}", config.queue());

        Ok(Self::from_parts(
            config.queue_manager(),
            config.queue(),
            Some(client),
            rx,
            Some(handle),
        ))
    }

    fn from_parts(
        queue_manager: &str,
        queue: &str,
        client: Option<AsyncClient>,
        deliveries: UnboundedReceiver<Delivery>,
        event_loop: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            queue_manager: queue_manager.to_string(),
            queue: queue.to_string(),
            client,
            deliveries,
            unacked: Vec::new(),
            event_loop,
        }
    }
}

fn mqtt_options(config: &QueueConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.queue_manager(),
        &config.broker_host,
        config.broker_port,
    );

    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    // Keep the session so messages queue up on the broker between runs
    options.set_clean_session(false);
    options.set_manual_acks(true);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    options
}

/// Diagnostic code for a connection failure
fn reason_code(err: &ConnectionError) -> String {
    match err {
        ConnectionError::ConnectionRefused(code) => format!("connection_refused:{:?}", code),
        ConnectionError::Io(io) => format!("io:{:?}", io.kind()),
        ConnectionError::NetworkTimeout => "network_timeout".to_string(),
        ConnectionError::FlushTimeout => "flush_timeout".to_string(),
        ConnectionError::MqttState(_) => "state".to_string(),
        _ => "connection".to_string(),
    }
}

/// Forward publishes until the connection fails or the session is closed
///
/// Forwarding never waits on the relay, so the loop keeps polling and the
/// keep alive goes out even while a batch is being confirmed.
async fn drive_event_loop(mut event_loop: EventLoop, tx: UnboundedSender<Delivery>) {
    info!("MQTT event loop started");
    let mut disconnecting = false;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Received message: topic={}, size={}, pkid={}",
                    publish.topic,
                    publish.payload.len(),
                    publish.pkid
                );
                // Once the relay stopped consuming, the publish stays unacked
                // and is redelivered to the next session
                let _ = tx.send(Ok(publish));
            }
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                info!("MQTT connected: session_present={}", connack.session_present);
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                info!("MQTT subscription acknowledged: {:?}", suback.return_codes);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT disconnected by broker");
                let _ = tx.send(Err(RelayError::transport(
                    "disconnect",
                    "Broker closed the session",
                )));
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                disconnecting = true;
            }
            Ok(_) => {}
            Err(e) if disconnecting => {
                debug!("MQTT session closed: {}", e);
                break;
            }
            Err(e) => {
                error!("MQTT event loop error: {}", e);
                let code = reason_code(&e);
                let _ = tx.send(Err(RelayError::transport_with_source(
                    code,
                    "Queue connection lost",
                    e,
                )));
                break;
            }
        }
    }

    info!("MQTT event loop stopped");
}

#[async_trait]
impl QueueSource for MqttQueue {
    async fn pending_count(&mut self) -> RelayResult<usize> {
        Ok(self.deliveries.len())
    }

    async fn receive(&mut self) -> RelayResult<Message> {
        match self.deliveries.recv().await {
            Some(Ok(publish)) => {
                let message = Message::new(publish.payload.to_vec());
                self.unacked.push(publish);
                Ok(message)
            }
            Some(Err(e)) => Err(e),
            None => Err(RelayError::transport(
                "closed",
                format!("Queue {} is no longer being consumed", self.queue),
            )),
        }
    }

    async fn acknowledge(&mut self) -> RelayResult<()> {
        if self.unacked.is_empty() {
            return Ok(());
        }
        let Some(client) = &self.client else {
            return Err(RelayError::transport(
                "disconnected",
                format!(
                    "Cannot acknowledge {} messages on {} after disconnect",
                    self.unacked.len(),
                    self.queue
                ),
            ));
        };

        for publish in &self.unacked {
            client.ack(publish).await.map_err(|e| {
                RelayError::transport_with_source(
                    "ack",
                    format!("Failed to acknowledge message {} on {}", publish.pkid, self.queue),
                    e,
                )
            })?;
        }
        debug!("Acknowledged {} messages on {}", self.unacked.len(), self.queue);
        self.unacked.clear();
        Ok(())
    }

    /// Stop taking deliveries. The subscription stays with the persistent
    /// session, so the broker keeps queueing for the next run.
    async fn close(&mut self) -> RelayResult<()> {
        debug!("Closing queue: {}", self.queue);
        self.deliveries.close();
        if !self.unacked.is_empty() {
            info!(
                "{} unconfirmed messages on {} will be redelivered",
                self.unacked.len(),
                self.queue
            );
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> RelayResult<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        debug!("Disconnecting from queue manager {}", self.queue_manager);
        let result = client.disconnect().await;

        if let Some(handle) = self.event_loop.take() {
            // The event loop ends once the disconnect goes out; don't wait on a dead broker
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!("MQTT event loop did not stop after disconnect");
            }
        }

        result.map_err(|e| {
            RelayError::transport_with_source(
                "disconnect",
                format!("Failed to disconnect from {}", self.queue_manager),
                e,
            )
        })
    }
}

impl Drop for MqttQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::Request;
    use std::io;

    fn publish(pkid: u16, payload: &str) -> Publish {
        let mut publish = Publish::new("Q", QoS::AtLeastOnce, payload);
        publish.pkid = pkid;
        publish
    }

    #[test]
    fn test_mqtt_options_from_queue_config() {
        let config = QueueConfig {
            queue_manager: Some("QM7".to_string()),
            broker_host: "broker".to_string(),
            broker_port: 1884,
            keep_alive_secs: 15,
            ..Default::default()
        };

        let options = mqtt_options(&config);
        assert_eq!(options.client_id(), "QM7");
        assert_eq!(options.broker_address(), ("broker".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert!(!options.clean_session());
        assert!(options.manual_acks());
    }

    #[test]
    fn test_reason_codes() {
        let io_err = ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert_eq!(reason_code(&io_err), "io:ConnectionRefused");
        assert_eq!(reason_code(&ConnectionError::NetworkTimeout), "network_timeout");
    }

    #[tokio::test]
    async fn test_buffered_messages_drive_pending_count() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue = MqttQueue::from_parts("QM1", "Q", None, rx, None);

        assert_eq!(queue.pending_count().await.unwrap(), 0);
        tx.send(Ok(publish(1, "one"))).unwrap();
        tx.send(Ok(publish(2, "two"))).unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 2);

        assert_eq!(queue.receive().await.unwrap().payload(), b"one");
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        tx.send(Err(RelayError::transport("io:ConnectionReset", "lost")))
            .unwrap();
        drop(tx);
        assert_eq!(queue.receive().await.unwrap().payload(), b"two");
        assert!(matches!(
            queue.receive().await,
            Err(RelayError::Transport { ref code, .. }) if code == "io:ConnectionReset"
        ));
        assert!(matches!(queue.receive().await, Err(RelayError::Transport { .. })));

        queue.close().await.unwrap();
        queue.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_messages_are_acked_only_when_acknowledged() {
        let (request_tx, request_rx) = flume::unbounded();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue =
            MqttQueue::from_parts("QM1", "Q", Some(AsyncClient::from_senders(request_tx)), rx, None);

        tx.send(Ok(publish(7, "a"))).unwrap();
        tx.send(Ok(publish(8, "b"))).unwrap();
        queue.receive().await.unwrap();
        queue.receive().await.unwrap();
        assert!(request_rx.is_empty());

        queue.acknowledge().await.unwrap();
        let acked: Vec<u16> = request_rx
            .drain()
            .map(|request| match request {
                Request::PubAck(ack) => ack.pkid,
                other => panic!("unexpected request: {other:?}"),
            })
            .collect();
        assert_eq!(acked, vec![7, 8]);

        // Nothing left to settle
        queue.acknowledge().await.unwrap();
        assert!(request_rx.is_empty());
    }

    #[tokio::test]
    async fn test_close_keeps_the_subscription() {
        let (request_tx, request_rx) = flume::unbounded();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queue =
            MqttQueue::from_parts("QM1", "Q", Some(AsyncClient::from_senders(request_tx)), rx, None);

        tx.send(Ok(publish(3, "unconfirmed"))).unwrap();
        queue.receive().await.unwrap();

        queue.close().await.unwrap();

        assert!(request_rx.is_empty(), "close must not unsubscribe or ack");
        assert!(tx.send(Ok(publish(4, "late"))).is_err());

        queue.disconnect().await.unwrap();
        assert!(matches!(request_rx.try_recv(), Ok(Request::Disconnect(_))));
    }
}
