//! Diagnostic events (spec.md §6) emitted by every component to an
//! external sink. The default sink logs via `tracing`; callers may plug in
//! their own by implementing [`DiagnosticSink`].

use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct DiagnosticContext {
    pub message_id: Option<String>,
    pub queue: Option<String>,
    pub topic: Option<String>,
    pub destination: Option<String>,
    pub http_status: Option<u16>,
    pub exception: Option<String>,
}

impl DiagnosticContext {
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticEventType {
    ComponentInitialized,
    MessageEnqueued,
    MessageDelivered,
    MessageDeliveryFailed,
    MessageNotAcknowledged,
    MessageAcknowledged,
    DeadLetter,
    SubscriptionRenewed,
    SubscriptionFailed,
    EndpointNotFound,
    TransportFailure,
}

impl DiagnosticEventType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::ComponentInitialized => "ComponentInitialized",
            Self::MessageEnqueued => "MessageEnqueued",
            Self::MessageDelivered => "MessageDelivered",
            Self::MessageDeliveryFailed => "MessageDeliveryFailed",
            Self::MessageNotAcknowledged => "MessageNotAcknowledged",
            Self::MessageAcknowledged => "MessageAcknowledged",
            Self::DeadLetter => "DeadLetter",
            Self::SubscriptionRenewed => "SubscriptionRenewed",
            Self::SubscriptionFailed => "SubscriptionFailed",
            Self::EndpointNotFound => "EndpointNotFound",
            Self::TransportFailure => "TransportFailure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiagnosticEvent {
    pub event_type: DiagnosticEventType,
    pub source: String,
    pub context: DiagnosticContext,
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Default sink: logs every event through `tracing`, at `warn` for failure
/// classes and `info` otherwise.
pub struct TracingDiagnosticSink;

impl DiagnosticSink for TracingDiagnosticSink {
    fn emit(&self, event: DiagnosticEvent) {
        let is_failure = matches!(
            event.event_type,
            DiagnosticEventType::MessageDeliveryFailed
                | DiagnosticEventType::MessageNotAcknowledged
                | DiagnosticEventType::DeadLetter
                | DiagnosticEventType::SubscriptionFailed
                | DiagnosticEventType::EndpointNotFound
                | DiagnosticEventType::TransportFailure
        );

        if is_failure {
            warn!(
                event = event.event_type.as_str(),
                source = %event.source,
                message_id = event.context.message_id.as_deref(),
                queue = event.context.queue.as_deref(),
                topic = event.context.topic.as_deref(),
                destination = event.context.destination.as_deref(),
                http_status = event.context.http_status,
                exception = event.context.exception.as_deref(),
                "diagnostic event"
            );
        } else {
            info!(
                event = event.event_type.as_str(),
                source = %event.source,
                message_id = event.context.message_id.as_deref(),
                queue = event.context.queue.as_deref(),
                topic = event.context.topic.as_deref(),
                destination = event.context.destination.as_deref(),
                "diagnostic event"
            );
        }
    }
}

pub type SharedDiagnosticSink = Arc<dyn DiagnosticSink>;

pub fn default_sink() -> SharedDiagnosticSink {
    Arc::new(TracingDiagnosticSink)
}
