use amiquip::{
    Connection, ConsumerMessage, ConsumerOptions, Exchange, Publish, QueueDeclareOptions,
    Result as AmiquipResult,
};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task;

use crate::communication::ManualOverride;
use crate::errors::MonitoringError;
use crate::global_variables::{QUEUE_MANUAL_OVERRIDES, QUEUE_SIGNAL_SNAPSHOTS};
use crate::monitoring::publisher::SnapshotPublisher;
use crate::shared_data::NetworkSnapshot;

/// Publishes snapshots as JSON on the snapshot queue, one connection per
/// snapshot.
#[derive(Debug, Clone)]
pub struct AmqpPublisher {
    url: String,
}

impl AmqpPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl SnapshotPublisher for AmqpPublisher {
    fn publish(&mut self, snapshot: &NetworkSnapshot) -> Result<(), MonitoringError> {
        let payload = serde_json::to_string(snapshot)?;
        let mut connection = Connection::insecure_open(&self.url)?;
        let channel = connection.open_channel(None)?;
        channel.queue_declare(QUEUE_SIGNAL_SNAPSHOTS, QueueDeclareOptions::default())?;
        let exchange = Exchange::direct(&channel);
        exchange.publish(Publish::new(payload.as_bytes(), QUEUE_SIGNAL_SNAPSHOTS))?;
        connection.close()?;
        Ok(())
    }
}

// Listens to the "manual_overrides" queue and forwards each override to the
// control loop. Returns once the loop stops accepting overrides.
pub async fn listen_manual_overrides(
    url: String,
    overrides: mpsc::Sender<ManualOverride>,
) -> Result<(), MonitoringError> {
    let result = task::spawn_blocking(move || -> AmiquipResult<()> {
        let mut connection = Connection::insecure_open(&url)?;
        let channel = connection.open_channel(None)?;
        let queue = channel.queue_declare(QUEUE_MANUAL_OVERRIDES, QueueDeclareOptions::default())?;
        let consumer = queue.consume(ConsumerOptions::default())?;
        info!("Waiting for manual overrides on '{}'", QUEUE_MANUAL_OVERRIDES);

        for message in consumer.receiver() {
            match message {
                ConsumerMessage::Delivery(delivery) => {
                    let parsed = std::str::from_utf8(&delivery.body)
                        .ok()
                        .and_then(|body| serde_json::from_str::<ManualOverride>(body).ok());
                    consumer.ack(delivery)?;
                    match parsed {
                        Some(request) => {
                            if overrides.blocking_send(request).is_err() {
                                info!("Control loop stopped, closing override listener");
                                break;
                            }
                        }
                        None => warn!("Discarding malformed manual override"),
                    }
                }
                other => {
                    info!("Manual override consumer ended: {:?}", other);
                    break;
                }
            }
        }
        connection.close()
    })
    .await?;
    result?;
    Ok(())
}
