use crate::{
    config::BrokerConfig,
    error::{MifloraError, Result},
    metrics::MEASUREMENT,
};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

/// Upper bound for handing one line to the broker
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound for the initial broker handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for flushing queued requests and the disconnect on close
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityOfService {
    /// QoS 0
    AtMostOnce,
    /// QoS 1
    AtLeastOnce,
    /// QoS 2
    ExactlyOnce,
}

impl From<QualityOfService> for QoS {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => Self::AtMostOnce,
            QualityOfService::AtLeastOnce => Self::AtLeastOnce,
            QualityOfService::ExactlyOnce => Self::ExactlyOnce,
        }
    }
}

/// Sink for formatted metric lines
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Hand `payload` to the broker under `topic`
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: &[u8],
    ) -> Result<()>;

    /// Flush and release the connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Topic all metric lines are published to
#[must_use]
pub fn topic_for(topic_prefix: &str) -> String {
    format!("{topic_prefix}{MEASUREMENT}")
}

/// Matches broker acknowledgements to the publishes waiting for them
///
/// Publishes are queued in the order they were handed to the client and get
/// their packet id once the event loop has written them. QoS 0 publishes
/// complete as soon as they are written.
#[derive(Debug, Default)]
struct AckTracker {
    unsent: VecDeque<(QoS, oneshot::Sender<()>)>,
    in_flight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn enqueue(&mut self, qos: QoS, acked: oneshot::Sender<()>) {
        self.unsent.push_back((qos, acked));
    }

    /// Returns `true` once the disconnect has been written
    fn observe(&mut self, event: &Event) -> bool {
        match event {
            // a retransmission after reconnect keeps its packet id
            Event::Outgoing(Outgoing::Publish(pkid)) if !self.in_flight.contains_key(pkid) => {
                match self.unsent.pop_front() {
                    Some((QoS::AtMostOnce, acked)) => {
                        let _ = acked.send(());
                    }
                    Some((_, acked)) => {
                        self.in_flight.insert(*pkid, acked);
                    }
                    None => warn!("Wrote publish {} nobody waits for", pkid),
                }
            }
            Event::Incoming(Packet::PubAck(ack)) => self.acknowledge(ack.pkid),
            Event::Incoming(Packet::PubComp(comp)) => self.acknowledge(comp.pkid),
            Event::Outgoing(Outgoing::Disconnect) => return true,
            _ => {}
        }
        false
    }

    fn acknowledge(&mut self, pkid: u16) {
        match self.in_flight.remove(&pkid) {
            // the waiter may have timed out already
            Some(acked) => {
                let _ = acked.send(());
            }
            None => debug!("Acknowledgement for unknown publish {}", pkid),
        }
    }
}

/// [`Publisher`] backed by an MQTT broker
///
/// A publish completes once the broker acknowledged it.
pub struct MqttPublisher {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    driver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    /// Connect to the broker and wait for its acknowledgement
    ///
    /// After the handshake the connection is driven by a background task that
    /// reconnects on its own.
    ///
    /// # Errors
    ///
    /// Returns [`MifloraError::Validation`] if the broker refuses the connection
    /// or does not answer within [`CONNECT_TIMEOUT`].
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((username, password)) = &config.credentials {
            options.set_credentials(username, password);
        }
        if config.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        info!(
            "Connecting to MQTT broker {}:{}{}",
            config.host,
            config.port,
            if config.tls { " (TLS)" } else { "" }
        );
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tokio::time::timeout(CONNECT_TIMEOUT, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                MifloraError::Validation(format!(
                    "broker {}:{} did not answer within {}ms",
                    config.host,
                    config.port,
                    CONNECT_TIMEOUT.as_millis()
                ))
            })??;
        info!("Connected to MQTT broker");

        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&acks)));

        Ok(Self {
            client,
            acks,
            driver: tokio::sync::Mutex::new(Some(driver)),
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                debug!("ConnAck: {:?}", ack.code);
                return Ok(());
            }
            Ok(event) => trace!("MQTT event before ConnAck: {:?}", event),
            Err(e) => {
                return Err(MifloraError::Validation(format!(
                    "can't connect to broker: {e}"
                )))
            }
        }
    }
}

/// Poll the connection until the disconnect has been written
async fn drive(mut eventloop: EventLoop, acks: Arc<Mutex<AckTracker>>) {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                trace!("MQTT event: {:?}", event);
                let disconnected = acks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .observe(&event);
                if disconnected {
                    debug!("Disconnect sent to broker");
                    return;
                }
            }
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        qos: QualityOfService,
        retain: bool,
        payload: &[u8],
    ) -> Result<()> {
        let (acked_tx, acked_rx) = oneshot::channel();
        {
            // held until queued so the driver cannot see the write first
            let mut acks = self.acks.lock().unwrap_or_else(PoisonError::into_inner);
            self.client
                .try_publish(topic, qos.into(), retain, payload.to_vec())
                .map_err(|e| MifloraError::Publish(e.to_string()))?;
            acks.enqueue(qos.into(), acked_tx);
        }

        acked_rx.await.map_err(|_| {
            MifloraError::Publish("connection closed before the broker acknowledged".to_string())
        })
    }

    /// Send a disconnect after everything queued so far and wait for it to be written
    ///
    /// Gives up after [`CLOSE_TIMEOUT`].
    async fn close(&self) -> Result<()> {
        let requested = self
            .client
            .disconnect()
            .await
            .map_err(|e| MifloraError::Publish(e.to_string()));

        let Some(mut driver) = self.driver.lock().await.take() else {
            return requested;
        };

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut driver).await.is_err() {
            warn!(
                "MQTT connection not closed within {}ms, dropping it",
                CLOSE_TIMEOUT.as_millis()
            );
            driver.abort();
        }
        requested
    }
}

/// [`Publisher`] that writes every payload as one line to standard output
#[derive(Debug, Default)]
pub struct StdoutPublisher;

#[async_trait]
impl Publisher for StdoutPublisher {
    async fn publish(
        &self,
        _topic: &str,
        _qos: QualityOfService,
        _retain: bool,
        payload: &[u8],
    ) -> Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(payload).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Counters of the publisher stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishStats {
    /// Lines the broker accepted
    pub published: u64,
    /// Lines dropped after a failed or timed-out publish
    pub dropped: u64,
}

/// Publisher stage: hand every line to `publisher` until the line channel closes
///
/// Lines go out in order, with QoS 1 and without retain. A line that fails or
/// takes longer than [`PUBLISH_TIMEOUT`] is logged and dropped.
pub async fn run_publisher<P: Publisher + ?Sized>(
    mut lines: mpsc::Receiver<String>,
    publisher: &P,
    topic: &str,
) -> PublishStats {
    let mut stats = PublishStats::default();

    while let Some(line) = lines.recv().await {
        let outcome = tokio::time::timeout(
            PUBLISH_TIMEOUT,
            publisher.publish(topic, QualityOfService::AtLeastOnce, false, line.as_bytes()),
        )
        .await;

        match outcome {
            Ok(Ok(())) => stats.published += 1,
            Ok(Err(e)) => {
                error!("Dropping line {:?}: {}", line, e);
                stats.dropped += 1;
            }
            Err(_) => {
                error!(
                    "Dropping line {:?}: publish took longer than {}ms",
                    line,
                    PUBLISH_TIMEOUT.as_millis()
                );
                stats.dropped += 1;
            }
        }
    }

    debug!(
        "Line channel closed after {} published, {} dropped",
        stats.published, stats.dropped
    );
    stats
}
