//! The distinguished `Outbound` queue (spec.md §4.4): critical sends are
//! parked here and dispatched by [`OutboundListener`], which performs the
//! actual wire delivery and lets `pb-queue`'s retry/dead-letter policy
//! govern recovery. Failure classes that are "non-retryable at the HTTP
//! layer" (`AccessDenied`, `MessageNotAcknowledged`) are still retried here
//! up to `max_attempts` — that policy lives in the queue, not in this
//! listener.

use async_trait::async_trait;
use pb_common::diagnostics::{DiagnosticContext, DiagnosticEvent, DiagnosticEventType};
use pb_common::{Message, Principal, SharedDiagnosticSink};
use pb_queue::{DeliveryContext, ListenerError, MessageListener};
use reqwest::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::wire;

pub const OUTBOUND_QUEUE_NAME: &str = "Outbound";

/// Receives messages rejected locally (i.e. not delivered inline) and
/// applies a local handler directly, without a network hop. Also the entry
/// point for messages arriving over the wire (spec.md §4.4 `HandleIncoming`).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, principal: Option<Principal>) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

pub struct OutboundListener {
    client: Client,
    self_base_uri: String,
    bypass_local: bool,
    handler: Arc<dyn MessageHandler>,
    sink: SharedDiagnosticSink,
}

impl OutboundListener {
    pub fn new(
        client: Client,
        self_base_uri: impl Into<String>,
        bypass_local: bool,
        handler: Arc<dyn MessageHandler>,
        sink: SharedDiagnosticSink,
    ) -> Self {
        Self { client, self_base_uri: self_base_uri.into(), bypass_local, handler, sink }
    }
}

#[async_trait]
impl MessageListener for OutboundListener {
    async fn message_received(
        &self,
        message: Message,
        principal: Option<Principal>,
        context: &DeliveryContext,
        _cancel: CancellationToken,
    ) -> Result<(), ListenerError> {
        let destination = message.headers().destination().unwrap_or_default().to_string();
        let message_id = message.headers().message_id().map(|s| s.to_string());

        if self.bypass_local && destination == self.self_base_uri {
            return match self.handler.handle(message, principal).await {
                Ok(()) => {
                    context.acknowledge();
                    Ok(())
                }
                Err(HandlerError(reason)) => Err(ListenerError(reason)),
            };
        }

        match wire::deliver_message(&self.client, &destination, &message).await {
            Ok(()) => {
                context.acknowledge();
                self.sink.emit(DiagnosticEvent {
                    event_type: DiagnosticEventType::MessageDelivered,
                    source: "pb-transport".to_string(),
                    context: DiagnosticContext::default()
                        .with_destination(destination)
                        .with_message_id(message_id.unwrap_or_default()),
                });
                Ok(())
            }
            Err(err) => {
                warn!(destination = %destination, error = %err, "outbound delivery attempt failed");
                self.sink.emit(DiagnosticEvent {
                    event_type: DiagnosticEventType::MessageDeliveryFailed,
                    source: "pb-transport".to_string(),
                    context: DiagnosticContext::default()
                        .with_destination(destination)
                        .with_message_id(message_id.unwrap_or_default())
                        .with_exception(err.to_string()),
                });
                Err(ListenerError(err.to_string()))
            }
        }
    }
}
