use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use async_trait::async_trait;
use chrono::Local;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::error::PipelineError;
use crate::model::{AuditKind, AuditLogMessage, AuditRecord};

/// Topic names shared by all stages
pub mod topics {
    pub const LOCATION_UPDATE: &str = "location.update";
    pub const LOCATION_MATCHED: &str = "location.matched";
    pub const POLLUTION_MATCHED: &str = "pollution.matched";
    pub const TOLL_CALCULATED: &str = "toll.calculated";
    pub const LOGS: &str = "logs";
}

/// Outbound side of the message bus
#[async_trait]
pub trait Publisher: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// NATS connection used by the stage binaries
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| PipelineError::Fatal(format!("cannot reach bus at {}: {}", url, e)))?;
        info!("Connected to NATS at {}", url);
        Ok(Self { client })
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Subscriber, PipelineError> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| PipelineError::Fatal(format!("cannot subscribe to {}: {}", topic, e)))?;
        info!("Subscribed to {}", topic);
        Ok(subscriber)
    }
}

#[async_trait]
impl Publisher for NatsBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload.into())
            .await?;
        Ok(())
    }
}

/// Publisher that keeps every message in memory, for wiring stages
/// together without a broker
#[derive(Default)]
pub struct MemoryBus {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads published on `topic`, oldest first
    pub async fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published
            .lock()
            .await
            .push((topic.to_string(), payload));
        Ok(())
    }
}

/// Writes `received` / `sent` records to the `logs` topic.
///
/// This is a side channel: failing to write an audit record is logged and
/// never affects the message being processed.
pub struct AuditLog<P> {
    publisher: Arc<P>,
    sender: &'static str,
    framework: String,
}

impl<P> Clone for AuditLog<P> {
    fn clone(&self) -> Self {
        Self {
            publisher: Arc::clone(&self.publisher),
            sender: self.sender,
            framework: self.framework.clone(),
        }
    }
}

impl<P: Publisher> AuditLog<P> {
    pub fn new(publisher: Arc<P>, sender: &'static str, framework: impl Into<String>) -> Self {
        Self {
            publisher,
            sender,
            framework: framework.into(),
        }
    }

    pub async fn record(&self, message_id: i64, kind: AuditKind) {
        let message = AuditLogMessage {
            data: AuditRecord {
                message_id,
                sender: self.sender.to_string(),
                framework: self.framework.clone(),
                kind,
                timestamp: Local::now().to_rfc3339(),
            },
        };

        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode audit record for {}: {}", message_id, e);
                return;
            }
        };

        match self.publisher.publish(topics::LOGS, payload).await {
            Ok(()) => debug!("Audit {:?} for message {} logged", kind, message_id),
            Err(e) => warn!("Audit record for message {} not published: {}", message_id, e),
        }
    }
}
