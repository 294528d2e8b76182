//! AMQP hit-stream consumer.

use crate::error::Error;
use crate::store::HitStore;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use serde::Deserialize;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One hit event off the bus.
#[derive(Debug, Deserialize)]
pub struct HitMessage {
    pub ip: IpAddr,
    pub timestamp: DateTime<Utc>,
}

/// Consumes hit messages and forwards them to the hit store.
///
/// Deliveries are auto-acknowledged; a hit is low-value and the counters are
/// additive, so at-most-once is acceptable. No single bad message or store
/// failure may stop the loop.
pub struct Ingestor {
    channel: Channel,
    queue: String,
    hits: HitStore,
}

impl Ingestor {
    /// Open a channel on the shared connection and declare the queue.
    pub async fn new(conn: &Connection, queue: &str, hits: HitStore) -> Result<Self, Error> {
        let channel = conn.create_channel().await?;

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Self {
            channel,
            queue: queue.to_string(),
            hits,
        })
    }

    /// Consume until the stream ends or a stop token arrives.
    pub async fn run(self, mut stop: mpsc::Receiver<()>) -> Result<(), Error> {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(queue = %self.queue, "ingestor started");

        loop {
            tokio::select! {
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.handle(delivery).await,
                        Some(Err(e)) => warn!(error = %e, "delivery failed"),
                        None => break,
                    }
                }
                _ = stop.recv() => break,
            }
        }

        let _ = self.channel.close(200, "shutdown").await;
        info!("ingestor stopped");

        Ok(())
    }

    async fn handle(&self, delivery: Delivery) {
        let content_type = delivery.properties.content_type();
        if content_type.as_ref().map(|ct| ct.as_str()) != Some("application/json") {
            warn!(
                content_type = content_type.as_ref().map(|ct| ct.as_str()).unwrap_or(""),
                "unexpected mime, dropping"
            );
            return;
        }

        let message: HitMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to parse hit message, dropping");
                return;
            }
        };

        if let Err(e) = self.hits.add(message.ip, message.timestamp).await {
            warn!(error = %e, ip = %message.ip, "failed to record hit");
        }
    }
}
