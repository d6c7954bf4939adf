//! Record change notifications.
//!
//! Delivery is fire-and-forget: a sink must never fail the record operation
//! that triggered it.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};

/// Kind of record change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WebhookEvent {
    /// A record was inserted.
    #[serde(rename = "record.created")]
    RecordCreated,
    /// A record was updated.
    #[serde(rename = "record.updated")]
    RecordUpdated,
    /// A record was deleted.
    #[serde(rename = "record.deleted")]
    RecordDeleted,
}

impl WebhookEvent {
    /// Event name as delivered.
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::RecordCreated => "record.created",
            WebhookEvent::RecordUpdated => "record.updated",
            WebhookEvent::RecordDeleted => "record.deleted",
        }
    }
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookDelivery {
    /// Target URL.
    pub url: String,
    /// Event kind.
    pub event: WebhookEvent,
    /// JSON body.
    pub payload: JsonValue,
}

/// Receives record change notifications.
pub trait WebhookSink: Send + Sync {
    /// Queue a notification. Must not block on delivery.
    fn notify(&self, url: &str, event: WebhookEvent, payload: JsonValue);
}

/// Sink that only logs events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWebhookSink;

impl WebhookSink for TracingWebhookSink {
    fn notify(&self, url: &str, event: WebhookEvent, payload: JsonValue) {
        tracing::info!(url, event = %event, payload = %payload, "webhook event");
    }
}

/// Sink that hands events to a bounded channel for a delivery task.
///
/// Events are dropped with a warning when the channel is full or closed.
pub struct ChannelWebhookSink {
    sender: SyncSender<WebhookDelivery>,
}

impl ChannelWebhookSink {
    /// Create a sink and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, Receiver<WebhookDelivery>) {
        let (sender, receiver) = std::sync::mpsc::sync_channel(capacity);
        (Self { sender }, receiver)
    }
}

impl WebhookSink for ChannelWebhookSink {
    fn notify(&self, url: &str, event: WebhookEvent, payload: JsonValue) {
        let delivery = WebhookDelivery {
            url: url.to_string(),
            event,
            payload,
        };
        match self.sender.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(d)) => {
                tracing::warn!(url = %d.url, event = %d.event, "webhook queue full, dropping event");
            }
            Err(TrySendError::Disconnected(d)) => {
                tracing::warn!(url = %d.url, event = %d.event, "webhook receiver closed, dropping event");
            }
        }
    }
}
