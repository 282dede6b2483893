//! The wire protocol (spec.md §6): axum handlers translating HTTP requests
//! directly into `pb-transport`/`pb-journal`/`pb-subscriptions` calls. None
//! of `pb-transport`'s types depend on axum — only this binary does.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{body::Bytes, Json};
use pb_common::{Headers, Message, Principal};
use pb_journal::{Filter, JournalCategory};
use pb_transport::TransportError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::AppState;

fn headers_from_http(http_headers: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in http_headers.iter() {
        if let Ok(value) = value.to_str() {
            let canonical = if name.as_str().eq_ignore_ascii_case("content-type") {
                "ContentType"
            } else {
                name.as_str()
            };
            headers.insert(canonical, value);
        }
    }
    headers
}

fn resolve_principal(state: &AppState, headers: &Headers) -> Option<Principal> {
    headers.security_token().and_then(|token| match state.token_service.validate(token) {
        Ok(principal) => Some(principal),
        Err(err) => {
            warn!(error = %err, "rejected message with invalid security token");
            None
        }
    })
}

fn status_for_error(err: &TransportError) -> StatusCode {
    match err {
        TransportError::AccessDenied => StatusCode::UNAUTHORIZED,
        TransportError::ResourceNotFound | TransportError::EndpointNotFound(_) => StatusCode::NOT_FOUND,
        TransportError::MessageNotAcknowledged => StatusCode::UNPROCESSABLE_ENTITY,
        TransportError::InvalidRequest { status } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
        }
        TransportError::MissingDestination | TransportError::Expired => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    http_headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut headers = headers_from_http(&http_headers);
    headers.set_message_id(message_id);
    let principal = resolve_principal(&state, &headers);
    let message = Message::new(headers, body);

    match state.bus.handle_incoming(message, principal).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            warn!(error = %err, "inbound message not acknowledged");
            status_for_error(&err).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriberQuery {
    uri: String,
    ttl: Option<u64>,
}

pub async fn post_subscriber(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    Query(query): Query<SubscriberQuery>,
) -> Response {
    let ttl = query.ttl.map(Duration::from_secs);
    match state.registry.add_subscription(&topic, &query.uri, ttl).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            warn!(error = %err, "failed to add subscription");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn delete_subscriber(
    State(state): State<Arc<AppState>>,
    Path(topic): Path<String>,
    Query(query): Query<SubscriberQuery>,
) -> Response {
    match state.registry.remove_subscription(&topic, &query.uri).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            warn!(error = %err, "failed to remove subscription");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JournalQuery {
    start: Option<i64>,
    count: Option<u32>,
    category: Option<String>,
    topic: Option<String>,
}

pub async fn get_journal(State(state): State<Arc<AppState>>, Query(query): Query<JournalQuery>) -> Response {
    let start = query.start.map(pb_journal::Position::from).unwrap_or_else(pb_journal::Position::beginning);
    let count = query.count.unwrap_or(50).max(1);

    let mut filter = Filter::new();
    if let Some(category) = &query.category {
        match category.parse::<JournalCategory>() {
            Ok(category) => filter = filter.with_categories([category]),
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        }
    }
    if let Some(topic) = &query.topic {
        filter = filter.with_topics([topic.clone()]);
    }
    let filter = if query.category.is_some() || query.topic.is_some() { Some(&filter) } else { None };

    match state.journal.read(start, count, filter).await {
        Ok(page) => Json(serde_json::json!({
            "entries": page.entries.iter().map(|e| serde_json::json!({
                "position": e.position.to_string(),
                "timestamp": e.timestamp.to_rfc3339(),
                "category": e.category.to_string(),
                "messageId": e.message.headers().message_id(),
            })).collect::<Vec<_>>(),
            "next": page.next.to_string(),
            "endOfJournal": page.end_of_journal,
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to read journal");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
