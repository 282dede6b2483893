//! Wire-level HTTP delivery and status classification (spec.md §4.4, §6).

use pb_common::Message;
use reqwest::Client;

use crate::error::{Result, TransportError};

/// POSTs `message` to `{destination_base}/message/{urlEncode(messageId)}`,
/// carrying each header as an HTTP header and mapping `ContentType` to the
/// HTTP `Content-Type` header.
pub async fn deliver_message(client: &Client, destination_base: &str, message: &Message) -> Result<()> {
    let message_id = message.headers().message_id().unwrap_or_default();
    let url = format!(
        "{}/message/{}",
        destination_base.trim_end_matches('/'),
        urlencoding::encode(message_id)
    );

    let mut request = client.post(&url).body(message.content().clone());
    for (name, value) in message.headers().iter() {
        if name.eq_ignore_ascii_case("ContentType") {
            request = request.header(reqwest::header::CONTENT_TYPE, value);
        } else {
            request = request.header(name, value);
        }
    }

    send_and_classify(request).await
}

/// POSTs an empty-body subscription request to
/// `{publisher_base}/topic/{urlEncode(topic)}/subscriber?uri={self_base_uri}[&ttl={seconds}]`.
pub async fn send_subscription_request(
    client: &Client,
    publisher_base: &str,
    topic: &str,
    self_base_uri: &str,
    ttl_seconds: Option<u64>,
) -> Result<()> {
    let mut url = format!(
        "{}/topic/{}/subscriber?uri={}",
        publisher_base.trim_end_matches('/'),
        urlencoding::encode(topic),
        urlencoding::encode(self_base_uri)
    );
    if let Some(ttl) = ttl_seconds {
        url.push_str(&format!("&ttl={}", ttl));
    }

    let request = client.post(&url).body(Vec::new());
    send_and_classify(request).await
}

/// DELETEs a subscription: `{publisher_base}/topic/{urlEncode(topic)}/subscriber?uri={self_base_uri}`.
pub async fn send_unsubscribe_request(
    client: &Client,
    publisher_base: &str,
    topic: &str,
    self_base_uri: &str,
) -> Result<()> {
    let url = format!(
        "{}/topic/{}/subscriber?uri={}",
        publisher_base.trim_end_matches('/'),
        urlencoding::encode(topic),
        urlencoding::encode(self_base_uri)
    );
    let request = client.delete(&url);
    send_and_classify(request).await
}

async fn send_and_classify(request: reqwest::RequestBuilder) -> Result<()> {
    match request.send().await {
        Ok(response) => classify_status(response.status().as_u16()),
        Err(err) => Err(classify_request_error(&err)),
    }
}

fn classify_status(status: u16) -> Result<()> {
    match status {
        200..=299 => Ok(()),
        401 => Err(TransportError::AccessDenied),
        404 => Err(TransportError::ResourceNotFound),
        422 => Err(TransportError::MessageNotAcknowledged),
        400..=499 => Err(TransportError::InvalidRequest { status }),
        500..=599 => Err(TransportError::TransportFailure(format!("server returned {status}"))),
        other => Err(TransportError::TransportFailure(format!("unexpected status {other}"))),
    }
}

/// Distinguishes DNS failure from a plain refused connection by inspecting
/// the error's source chain, since `reqwest::Error::is_connect` covers both.
fn classify_request_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::TransportFailure(format!("request timed out: {err}"));
    }
    if err.is_connect() {
        let chain = format!("{err:#}").to_ascii_lowercase();
        if chain.contains("dns") || chain.contains("resolve") || chain.contains("resolution") {
            return TransportError::NameResolutionFailed(err.to_string());
        }
        return TransportError::ConnectionRefused(err.to_string());
    }
    TransportError::TransportFailure(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_success() {
        assert!(classify_status(202).is_ok());
    }

    #[test]
    fn classifies_access_denied() {
        assert_eq!(classify_status(401).unwrap_err(), TransportError::AccessDenied);
    }

    #[test]
    fn classifies_not_found() {
        assert_eq!(classify_status(404).unwrap_err(), TransportError::ResourceNotFound);
    }

    #[test]
    fn classifies_not_acknowledged() {
        assert_eq!(classify_status(422).unwrap_err(), TransportError::MessageNotAcknowledged);
    }

    #[test]
    fn classifies_other_client_error_as_invalid_request() {
        assert_eq!(classify_status(400).unwrap_err(), TransportError::InvalidRequest { status: 400 });
    }

    #[test]
    fn classifies_server_error_as_transport_failure() {
        assert!(matches!(classify_status(503), Err(TransportError::TransportFailure(_))));
    }
}
