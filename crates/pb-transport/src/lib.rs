//! Send / publish / subscribe protocol and wire dispatch (spec.md §4.4, C5).
//!
//! [`Bus`] is the facade: it owns the distinguished `Outbound` queue (a
//! `pb-queue::Queue` whose listener performs wire delivery), the message
//! journal, and the subscription registry, and exposes the four operations
//! spec.md names: `send`, `publish`, `subscribe`, `handle_incoming`.

pub mod endpoint;
pub mod error;
pub mod outbound;
pub mod subscribe;
pub mod wire;

pub use endpoint::{Credentials, Endpoint, EndpointTable};
pub use error::{Result, TransportError};
pub use outbound::{HandlerError, MessageHandler};

use chrono::Utc;
use pb_common::diagnostics::{DiagnosticContext, DiagnosticEvent, DiagnosticEventType};
use pb_common::{Headers, Importance, Message, Principal, SecurityTokenService, SharedDiagnosticSink};
use pb_journal::{Journal, JournalCategory};
use pb_queue::{Queue, QueueOptions};
use pb_subscriptions::SubscriptionRegistry;
use reqwest::Client;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// Result of a [`Bus::publish`] call: per-subscriber failures never cancel
/// delivery to other subscribers, so they are collected here instead of
/// short-circuiting the whole operation.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, TransportError)>,
}

impl PublishOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Bus {
    self_base_uri: String,
    client: Client,
    outbound: Arc<dyn Queue>,
    journal: Arc<dyn Journal>,
    registry: Arc<dyn SubscriptionRegistry>,
    handler: Arc<dyn MessageHandler>,
    endpoints: EndpointTable,
    bypass_local: bool,
    sink: SharedDiagnosticSink,
}

impl Bus {
    /// Creates the transport, including the `Outbound` queue whose listener
    /// is this transport's own wire-delivery routine (spec.md §4.4).
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        self_base_uri: impl Into<String>,
        pool: Pool<Sqlite>,
        outbound_options: QueueOptions,
        token_service: Arc<dyn SecurityTokenService>,
        journal: Arc<dyn Journal>,
        registry: Arc<dyn SubscriptionRegistry>,
        handler: Arc<dyn MessageHandler>,
        endpoints: EndpointTable,
        bypass_local: bool,
        sink: SharedDiagnosticSink,
    ) -> Result<Arc<Self>> {
        let self_base_uri = self_base_uri.into();
        let client = Client::builder().build().map_err(|e| TransportError::TransportFailure(e.to_string()))?;

        let listener = Arc::new(outbound::OutboundListener::new(
            client.clone(),
            self_base_uri.clone(),
            bypass_local,
            handler.clone(),
            sink.clone(),
        ));
        let outbound: Arc<dyn Queue> = pb_queue::sqlite::SqliteQueue::create(
            pool,
            outbound::OUTBOUND_QUEUE_NAME,
            listener,
            outbound_options,
            token_service,
            sink.clone(),
        )
        .await?;

        sink.emit(DiagnosticEvent {
            event_type: DiagnosticEventType::ComponentInitialized,
            source: "pb-transport".to_string(),
            context: DiagnosticContext::default(),
        });

        Ok(Arc::new(Self {
            self_base_uri,
            client,
            outbound,
            journal,
            registry,
            handler,
            endpoints,
            bypass_local,
            sink,
        }))
    }

    /// spec.md §4.4 `Send`: critical messages are parked on `Outbound` and
    /// delivered asynchronously with retry; everything else is delivered
    /// inline.
    pub async fn send(&self, message: Message, principal: Option<Principal>) -> Result<()> {
        if message.headers().destination().is_none() {
            return Err(TransportError::MissingDestination);
        }
        if message.headers().is_expired() {
            return Err(TransportError::Expired);
        }

        self.journal.append(message.clone(), JournalCategory::Sent).await?;

        if message.headers().importance() == Importance::Critical {
            self.outbound.enqueue(message, principal).await?;
            Ok(())
        } else {
            let destination = message.headers().destination().unwrap().to_string();
            self.deliver_inline(&destination, &message, principal).await
        }
    }

    /// spec.md §4.4 `Publish`: fan out to every current subscriber of
    /// `topic`, each with a freshly generated `MessageId` and `Destination`
    /// rewritten to that subscriber.
    pub async fn publish(&self, message: Message, topic: impl Into<String>) -> Result<PublishOutcome> {
        let topic = topic.into();
        self.journal.append(message.clone(), JournalCategory::Published).await?;

        let subscribers = self.registry.get_subscribers(&topic).await?;
        let mut outcome = PublishOutcome::default();

        for subscriber in subscribers {
            let mut headers = message.headers().clone();
            headers.set_message_id(Uuid::new_v4().to_string());
            headers.set_destination(subscriber.clone());
            headers.set_topic(topic.clone());
            let per_subscriber = message.with_headers(headers);

            let result = if per_subscriber.headers().importance() == Importance::Critical {
                self.outbound.enqueue(per_subscriber, None).await.map_err(TransportError::from)
            } else {
                self.deliver_inline(&subscriber, &per_subscriber, None).await
            };

            match result {
                Ok(()) => outcome.delivered.push(subscriber),
                Err(err) => outcome.failed.push((subscriber, err)),
            }
        }

        Ok(outcome)
    }

    /// Runs the subscription renewal loop against `endpoint_name` until
    /// `cancel` fires or a fatal failure class is hit (spec.md §4.4
    /// `Subscribe`). Intended to be spawned as an independent task.
    pub async fn subscribe(&self, endpoint_name: &str, topic: impl Into<String>, ttl: Option<Duration>, cancel: CancellationToken) {
        let topic = topic.into();
        let Some(endpoint) = self.endpoints.by_name(endpoint_name) else {
            self.sink.emit(DiagnosticEvent {
                event_type: DiagnosticEventType::EndpointNotFound,
                source: "pb-transport".to_string(),
                context: DiagnosticContext::default().with_topic(topic),
            });
            return;
        };

        subscribe::run_subscribe_loop(
            self.client.clone(),
            endpoint.base_uri.clone(),
            topic,
            self.self_base_uri.clone(),
            ttl,
            cancel,
            self.sink.clone(),
        )
        .await;
    }

    /// spec.md §4.4 `HandleIncoming`: journal the receipt, route to the
    /// application handler, and return whether the host should answer
    /// `202 Accepted` or `422 Unprocessable Entity`.
    pub async fn handle_incoming(&self, message: Message, principal: Option<Principal>) -> Result<()> {
        self.journal.append(message.clone(), JournalCategory::Received).await?;
        self.handler
            .handle(message, principal)
            .await
            .map_err(|HandlerError(reason)| TransportError::TransportFailure(reason))
    }

    async fn deliver_inline(&self, destination: &str, message: &Message, principal: Option<Principal>) -> Result<()> {
        if self.bypass_local && destination == self.self_base_uri {
            return self
                .handler
                .handle(message.clone(), principal)
                .await
                .map_err(|HandlerError(reason)| TransportError::TransportFailure(reason));
        }

        let result = wire::deliver_message(&self.client, destination, message).await;
        match &result {
            Ok(()) => {
                self.sink.emit(DiagnosticEvent {
                    event_type: DiagnosticEventType::MessageDelivered,
                    source: "pb-transport".to_string(),
                    context: DiagnosticContext::default().with_destination(destination.to_string()),
                });
            }
            Err(err) => {
                self.sink.emit(DiagnosticEvent {
                    event_type: DiagnosticEventType::MessageDeliveryFailed,
                    source: "pb-transport".to_string(),
                    context: DiagnosticContext::default()
                        .with_destination(destination.to_string())
                        .with_exception(err.to_string()),
                });
            }
        }
        result
    }

    pub fn self_base_uri(&self) -> &str {
        &self.self_base_uri
    }
}

/// Issues a message-scoped security token bound to `principal`, expiring no
/// later than `message.Expires` — used by hosts building a [`Message`] from
/// an inbound request before handing it to [`Bus::send`]/[`Bus::publish`].
pub fn stamp_security_token(
    headers: &mut Headers,
    token_service: &dyn SecurityTokenService,
    principal: &Principal,
) {
    let expires_at = headers.expires();
    headers.set_security_token(token_service.issue(principal, expires_at));
}

pub fn now_stamped_sent(headers: &mut Headers) {
    headers.set_sent(Utc::now());
    info!(message_id = headers.message_id(), "message stamped Sent");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_common::diagnostics::default_sink;
    use pb_common::HmacTokenService;
    use pb_journal::sqlite::SqliteJournal;
    use pb_subscriptions::sqlite::SqliteSubscriptionRegistry;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingHandler {
        received: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, message: Message, _principal: Option<Principal>) -> std::result::Result<(), HandlerError> {
            self.received.lock().unwrap().push(message.headers().message_id().unwrap_or_default().to_string());
            Ok(())
        }
    }

    async fn test_bus(self_base_uri: &str, bypass_local: bool) -> (Arc<Bus>, Arc<RecordingHandler>) {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let journal = Arc::new(SqliteJournal::create(pool.clone()).await.unwrap()) as Arc<dyn Journal>;
        let registry = SqliteSubscriptionRegistry::create(pool.clone()).await.unwrap();
        let handler = Arc::new(RecordingHandler { received: Mutex::new(Vec::new()) });
        let bus = Bus::create(
            self_base_uri.to_string(),
            pool,
            QueueOptions::default(),
            Arc::new(HmacTokenService::new(b"k".to_vec())),
            journal,
            registry,
            handler.clone(),
            EndpointTable::new([]),
            bypass_local,
            default_sink(),
        )
        .await
        .unwrap();
        (bus, handler)
    }

    fn message_to(destination: &str, importance: Importance) -> Message {
        let mut headers = Headers::new();
        headers.set_message_id(Uuid::new_v4().to_string());
        headers.set_destination(destination.to_string());
        headers.set_importance(importance);
        Message::new(headers, b"payload".to_vec())
    }

    #[tokio::test]
    async fn send_normal_importance_delivers_inline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/message/.*"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let (bus, _handler) = test_bus("http://self/", false).await;
        let message = message_to(&server.uri(), Importance::Normal);
        bus.send(message, None).await.unwrap();
    }

    #[tokio::test]
    async fn send_critical_importance_enqueues_and_retries_until_delivered() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        Mock::given(method("POST"))
            .and(path_regex(r"^/message/.*"))
            .respond_with(move |_: &wiremock::Request| {
                let n = calls_clone.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    ResponseTemplate::new(503)
                } else {
                    ResponseTemplate::new(202)
                }
            })
            .mount(&server)
            .await;

        let (bus, _handler) = test_bus("http://self/", false).await;
        let message = message_to(&server.uri(), Importance::Critical);
        bus.send(message, None).await.unwrap();

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn send_missing_destination_is_rejected() {
        let (bus, _handler) = test_bus("http://self/", false).await;
        let mut headers = Headers::new();
        headers.set_message_id("m1");
        let message = Message::new(headers, b"p".to_vec());
        assert_eq!(bus.send(message, None).await.unwrap_err(), TransportError::MissingDestination);
    }

    #[tokio::test]
    async fn publish_fans_out_to_every_subscriber_with_distinct_message_ids() {
        let server_a = MockServer::start().await;
        let server_b = MockServer::start().await;
        for server in [&server_a, &server_b] {
            Mock::given(method("POST"))
                .and(path_regex(r"^/message/.*"))
                .respond_with(ResponseTemplate::new(202))
                .mount(server)
                .await;
        }

        let (bus, _handler) = test_bus("http://self/", false).await;
        bus.registry.add_subscription("orders", &server_a.uri(), None).await.unwrap();
        bus.registry.add_subscription("orders", &server_b.uri(), None).await.unwrap();

        let mut headers = Headers::new();
        headers.set_message_id("original");
        let message = Message::new(headers, b"payload".to_vec());
        let outcome = bus.publish(message, "orders").await.unwrap();

        assert_eq!(outcome.delivered.len(), 2);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn publish_aggregates_per_subscriber_failures() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/message/.*"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;

        let (bus, _handler) = test_bus("http://self/", false).await;
        bus.registry.add_subscription("orders", &failing.uri(), None).await.unwrap();

        let mut headers = Headers::new();
        headers.set_message_id("original");
        let message = Message::new(headers, b"payload".to_vec());
        let outcome = bus.publish(message, "orders").await.unwrap();

        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.failed.len(), 1);
    }

    #[tokio::test]
    async fn handle_incoming_journals_and_routes_to_handler() {
        let (bus, handler) = test_bus("http://self/", false).await;
        let mut headers = Headers::new();
        headers.set_message_id("inbound-1");
        let message = Message::new(headers, b"payload".to_vec());
        bus.handle_incoming(message, None).await.unwrap();
        assert_eq!(handler.received.lock().unwrap().as_slice(), &["inbound-1".to_string()]);
    }

    #[tokio::test]
    async fn send_to_self_with_bypass_invokes_handler_without_network() {
        let (bus, handler) = test_bus("http://self-base/", true).await;
        let message = message_to("http://self-base/", Importance::Normal);
        bus.send(message.clone(), None).await.unwrap();
        assert_eq!(
            handler.received.lock().unwrap().as_slice(),
            &[message.headers().message_id().unwrap().to_string()]
        );
    }
}
