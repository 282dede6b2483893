//! The subscription renewal loop (spec.md §4.4).
//!
//! ```text
//! loop until cancelled:
//!     try: sendSubscriptionRequest(endpoint, topic, ttl)
//!          if ttl == 0: return    // non-expiring; nothing more to do
//!          sleep(renewalInterval)
//!     on EndpointNotFound, InvalidRequest: emit SubscriptionFailed; return    // fatal
//!     on NameResolutionFailed, ConnectionRefused, ResourceNotFound, TransportFailure:
//!          sleep(retryInterval); continue    // transient
//! ```

use pb_common::diagnostics::{DiagnosticContext, DiagnosticEvent, DiagnosticEventType};
use pb_common::SharedDiagnosticSink;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::wire;

/// Fixed backoff between transient-failure retries.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Floor applied to `ttl / 2` when computing the renewal interval.
pub const RENEWAL_FLOOR: Duration = Duration::from_secs(5);

pub fn renewal_interval(ttl: Duration) -> Duration {
    std::cmp::max(ttl / 2, RENEWAL_FLOOR)
}

/// Runs the renewal loop until `cancel` fires or a fatal failure class is
/// hit. Intended to be driven by a caller-managed task
/// (`tokio::spawn(run_subscribe_loop(...))`).
pub async fn run_subscribe_loop(
    client: Client,
    publisher_base: String,
    topic: String,
    self_base_uri: String,
    ttl: Option<Duration>,
    cancel: CancellationToken,
    sink: SharedDiagnosticSink,
) {
    let ttl_seconds = ttl.map(|d| d.as_secs());

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match wire::send_subscription_request(&client, &publisher_base, &topic, &self_base_uri, ttl_seconds).await
        {
            Ok(()) => {
                sink.emit(DiagnosticEvent {
                    event_type: DiagnosticEventType::SubscriptionRenewed,
                    source: "pb-transport".to_string(),
                    context: DiagnosticContext::default().with_topic(topic.clone()).with_destination(publisher_base.clone()),
                });
                info!(topic = %topic, publisher = %publisher_base, "subscription request sent");

                match ttl {
                    None => return,
                    Some(ttl) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(renewal_interval(ttl)) => {}
                        }
                    }
                }
            }
            Err(err) if err.is_subscribe_fatal() => {
                warn!(topic = %topic, publisher = %publisher_base, error = %err, "subscription request failed fatally");
                sink.emit(DiagnosticEvent {
                    event_type: DiagnosticEventType::SubscriptionFailed,
                    source: "pb-transport".to_string(),
                    context: DiagnosticContext::default()
                        .with_topic(topic)
                        .with_destination(publisher_base)
                        .with_exception(err.to_string()),
                });
                return;
            }
            Err(TransportError::AccessDenied | TransportError::MessageNotAcknowledged) => {
                // Not named transient in spec.md's state machine, but also
                // not in the fatal list; treat as transient and retry,
                // matching the spec's "Authorization: retried only if
                // credentials may change" guidance (§7) since we cannot
                // tell from here whether they will.
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }
            }
            Err(_transient) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_interval_is_half_ttl_above_floor() {
        assert_eq!(renewal_interval(Duration::from_secs(20)), Duration::from_secs(10));
    }

    #[test]
    fn renewal_interval_floors_at_five_seconds() {
        assert_eq!(renewal_interval(Duration::from_secs(4)), RENEWAL_FLOOR);
    }
}
