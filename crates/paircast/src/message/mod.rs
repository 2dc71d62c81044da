//! Message layer: schema registry, handler dispatch, history and queued
//! retry for application payloads.
//!
//! Every registry here is owned by the layer instance, never process-wide,
//! so independent sessions in one process cannot observe each other's
//! handlers or history.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use paircast_token::now_ms;
use paircast_transport::TransportError;

pub const DEFAULT_HISTORY_CAP: usize = 100;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The payload unit carried on the data channel for application traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// Delivery seam between the layer and whatever owns the data channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn is_open(&self) -> bool;
    async fn deliver(&self, frame: Bytes) -> Result<(), TransportError>;
}

/// Handler invoked for each incoming message of a registered kind.
pub type MessageHandler = Arc<dyn Fn(&ApplicationMessage) -> Result<(), String> + Send + Sync>;

/// Optional validation applied by [`MessageLayer::create_message`]: required
/// top-level payload fields first, then a custom predicate.
pub struct MessageSchema {
    pub required: Vec<String>,
    pub validate: Option<Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>>,
}

impl MessageSchema {
    pub fn required_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: fields.into_iter().map(Into::into).collect(),
            validate: None,
        }
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validate = Some(Arc::new(predicate));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("schema validation failed for '{kind}': {reason}")]
    SchemaValidation { kind: String, reason: String },
    #[error("channel not ready; message {id} queued")]
    NotReady { id: Uuid },
    #[error("failed to parse incoming frame: {0}")]
    Parse(String),
}

/// One handler's failure during fan-out; siblings still ran.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerFailure {
    pub kind: String,
    pub reason: String,
}

/// Outcome of dispatching one incoming message.
#[derive(Debug)]
pub struct DispatchReport {
    pub message: ApplicationMessage,
    pub handled: usize,
    pub failures: Vec<HandlerFailure>,
}

/// Outcome of one retry sweep over the queue.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub sent: usize,
    pub requeued: usize,
    pub dropped: usize,
}

#[derive(Clone, Copy)]
pub struct MessageLayerConfig {
    pub history_cap: usize,
    pub max_retries: u32,
}

impl Default for MessageLayerConfig {
    fn default() -> Self {
        Self {
            history_cap: DEFAULT_HISTORY_CAP,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

struct QueuedMessage {
    message: ApplicationMessage,
    /// Failed delivery attempts so far.
    retries: u32,
}

pub struct MessageLayer {
    config: MessageLayerConfig,
    schemas: Mutex<HashMap<String, MessageSchema>>,
    handlers: Mutex<HashMap<String, Vec<MessageHandler>>>,
    wildcard: Mutex<Vec<MessageHandler>>,
    history: Mutex<VecDeque<ApplicationMessage>>,
    queue: Mutex<VecDeque<QueuedMessage>>,
}

impl Default for MessageLayer {
    fn default() -> Self {
        Self::new(MessageLayerConfig::default())
    }
}

impl MessageLayer {
    pub fn new(config: MessageLayerConfig) -> Self {
        Self {
            config,
            schemas: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            wildcard: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn register_schema(&self, kind: impl Into<String>, schema: MessageSchema) {
        self.schemas.lock().insert(kind.into(), schema);
    }

    /// Registers a handler for one exact message kind.
    pub fn on(&self, kind: impl Into<String>, handler: MessageHandler) {
        self.handlers.lock().entry(kind.into()).or_default().push(handler);
    }

    /// Registers a handler invoked for every message kind.
    pub fn on_any(&self, handler: MessageHandler) {
        self.wildcard.lock().push(handler);
    }

    /// Builds a message, stamping id and timestamp, after validating the
    /// payload against the kind's registered schema, if any.
    pub fn create_message(
        &self,
        kind: impl Into<String>,
        payload: Value,
    ) -> Result<ApplicationMessage, MessageError> {
        let kind = kind.into();
        self.validate(&kind, &payload)?;
        Ok(ApplicationMessage {
            id: Uuid::new_v4(),
            kind,
            payload,
            timestamp_ms: now_ms(),
        })
    }

    fn validate(&self, kind: &str, payload: &Value) -> Result<(), MessageError> {
        let schemas = self.schemas.lock();
        let Some(schema) = schemas.get(kind) else {
            return Ok(());
        };
        for field in &schema.required {
            if payload.get(field).is_none() {
                return Err(MessageError::SchemaValidation {
                    kind: kind.to_string(),
                    reason: format!("missing required field '{field}'"),
                });
            }
        }
        if let Some(predicate) = &schema.validate {
            predicate(payload).map_err(|reason| MessageError::SchemaValidation {
                kind: kind.to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    /// Sends one message through the sink, or queues it when the channel is
    /// not open. The `NotReady` error tells the caller the message was
    /// queued, not dropped; a failed delivery is re-enqueued the same way.
    pub async fn send(
        &self,
        message: ApplicationMessage,
        sink: &dyn MessageSink,
    ) -> Result<(), MessageError> {
        let id = message.id;
        if !sink.is_open() {
            self.enqueue(message, 0);
            return Err(MessageError::NotReady { id });
        }
        let frame = serde_json::to_vec(&message).map_err(|err| MessageError::Parse(err.to_string()))?;
        match sink.deliver(Bytes::from(frame)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(target: "paircast::message", message = %id, error = %err, "send failed, message queued for retry");
                self.enqueue(message, 1);
                Err(MessageError::NotReady { id })
            }
        }
    }

    fn enqueue(&self, message: ApplicationMessage, retries: u32) {
        self.queue.lock().push_back(QueuedMessage { message, retries });
    }

    /// Parses, validates, records and dispatches one incoming frame.
    pub fn process_incoming(&self, raw: &[u8]) -> Result<DispatchReport, MessageError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|err| MessageError::Parse(err.to_string()))?;
        self.process_incoming_value(value)
    }

    /// [`Self::process_incoming`] for a frame already parsed as JSON.
    pub fn process_incoming_value(&self, value: Value) -> Result<DispatchReport, MessageError> {
        let message: ApplicationMessage =
            serde_json::from_value(value).map_err(|err| MessageError::Parse(err.to_string()))?;
        self.validate(&message.kind, &message.payload)?;

        {
            let mut history = self.history.lock();
            if history.len() >= self.config.history_cap {
                history.pop_front();
            }
            history.push_back(message.clone());
        }

        // Snapshot the handler lists so user callbacks run without any
        // registry lock held.
        let exact: Vec<MessageHandler> = self
            .handlers
            .lock()
            .get(&message.kind)
            .cloned()
            .unwrap_or_default();
        let wildcard: Vec<MessageHandler> = self.wildcard.lock().clone();

        let mut handled = 0;
        let mut failures = Vec::new();
        for handler in exact.iter().chain(wildcard.iter()) {
            match handler(&message) {
                Ok(()) => handled += 1,
                Err(reason) => {
                    warn!(
                        target: "paircast::message",
                        message = %message.id,
                        kind = %message.kind,
                        %reason,
                        "handler failed"
                    );
                    failures.push(HandlerFailure {
                        kind: message.kind.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(DispatchReport {
            message,
            handled,
            failures,
        })
    }

    /// Pure history lookup; never invoked automatically so at-most-once
    /// delivery stays an explicit caller decision.
    pub fn is_duplicate(&self, id: Uuid) -> bool {
        self.history.lock().iter().any(|message| message.id == id)
    }

    pub fn history(&self) -> Vec<ApplicationMessage> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drains the retry queue through the sink. Entries that fail again go
    /// back with an incremented count; entries reaching the max-retry
    /// threshold are dropped with a terminal log line.
    pub async fn retry_queued(&self, sink: &dyn MessageSink) -> RetryReport {
        let drained: Vec<QueuedMessage> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        let mut report = RetryReport::default();
        for mut entry in drained {
            let delivered = match serde_json::to_vec(&entry.message) {
                Ok(frame) => sink.deliver(Bytes::from(frame)).await.is_ok(),
                Err(_) => false,
            };
            if delivered {
                report.sent += 1;
                continue;
            }
            entry.retries += 1;
            if entry.retries >= self.config.max_retries {
                warn!(
                    target: "paircast::message",
                    message = %entry.message.id,
                    retries = entry.retries,
                    "dropping message after exhausting retries"
                );
                report.dropped += 1;
            } else {
                report.requeued += 1;
                self.queue.lock().push_back(entry);
            }
        }
        report
    }
}
