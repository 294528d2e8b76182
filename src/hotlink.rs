//! AMQP referer-stream consumer.
//!
//! Sibling of the hit ingestor on its own queue: each referred request is
//! published as `{"url", "accept", "timestamp"}` and accumulated per URL in
//! the hotlink store.

use crate::error::Error;
use crate::store::HotlinkStore;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One referer event off the bus.
#[derive(Debug, Deserialize)]
pub struct HotlinkMessage {
    pub url: String,
    #[serde(default)]
    pub accept: String,
    pub timestamp: DateTime<Utc>,
}

/// Consumes referer messages and forwards them to the hotlink store.
/// Same delivery contract as the hit ingestor: auto-ack, and no single bad
/// message or store failure may stop the loop.
pub struct HotlinkIngestor {
    channel: Channel,
    queue: String,
    hotlink: HotlinkStore,
}

impl HotlinkIngestor {
    /// Open a channel on the shared connection and declare the queue.
    pub async fn new(
        conn: &Connection,
        queue: &str,
        hotlink: HotlinkStore,
    ) -> Result<Self, Error> {
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
            hotlink,
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

        info!(queue = %self.queue, "hotlink ingestor started");

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
        info!("hotlink ingestor stopped");

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

        let message: HotlinkMessage = match serde_json::from_slice(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to parse referer message, dropping");
                return;
            }
        };

        if let Err(e) = self
            .hotlink
            .add(&message.url, &message.accept, message.timestamp)
            .await
        {
            warn!(error = %e, url = %message.url, "failed to record referer");
        }
    }
}
