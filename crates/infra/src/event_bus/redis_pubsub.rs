//! Redis pub/sub-backed event bus (optional).
//!
//! Job events go to `<prefix>:job_events`, pipeline-wide events (pause,
//! resume, quarantine) to `<prefix>:system_events`. Pub/sub is not durable:
//! observers that were offline re-read the job store.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tracing::debug;

use im2_events::{EventBus, PipelineEvent, Subscription};

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for JSON-encoded [`PipelineEvent`]s.
#[derive(Debug, Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    job_channel: String,
    system_channel: String,
}

impl RedisPubSubEventBus {
    pub fn new(redis_url: impl AsRef<str>, prefix: &str) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            job_channel: format!("{prefix}:job_events"),
            system_channel: format!("{prefix}:system_events"),
        })
    }

    /// Channel an event is published on.
    pub fn channel_for(&self, event: &PipelineEvent) -> &str {
        if event.kind.is_job_event() {
            &self.job_channel
        } else {
            &self.system_channel
        }
    }
}

impl EventBus<PipelineEvent> for RedisPubSubEventBus {
    type Error = RedisBusError;

    fn publish(&self, message: PipelineEvent) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let _: i64 = conn
            .publish(self.channel_for(&message), payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        Ok(())
    }

    fn subscribe(&self) -> Subscription<PipelineEvent> {
        let (tx, rx) = mpsc::channel();

        let client = self.client.clone();
        let channels = [self.job_channel.clone(), self.system_channel.clone()];

        // Forward pub/sub messages until the subscription is dropped.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(err) => {
                    debug!(error = %err, "redis subscription could not connect");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if pubsub.subscribe(&channels[..]).is_err() {
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(_) => return,
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let event: PipelineEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(err) => {
                        debug!(error = %err, "skipping undecodable pipeline event");
                        continue;
                    }
                };

                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
