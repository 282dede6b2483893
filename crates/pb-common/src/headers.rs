//! Case-insensitive, order-preserving header map with an RFC-822-style wire
//! and storage encoding.
//!
//! Recognized field names (matched case-insensitively, stored in canonical
//! casing): `MessageId`, `MessageName`, `Origination`, `Destination`,
//! `ReplyTo`, `RelatedTo`, `Sent`, `Received`, `Published`, `Expires`,
//! `Topic`, `ContentType`, `Importance`, `SecurityToken`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::fmt;
use std::str::FromStr;

pub const MESSAGE_ID: &str = "MessageId";
pub const MESSAGE_NAME: &str = "MessageName";
pub const ORIGINATION: &str = "Origination";
pub const DESTINATION: &str = "Destination";
pub const REPLY_TO: &str = "ReplyTo";
pub const RELATED_TO: &str = "RelatedTo";
pub const SENT: &str = "Sent";
pub const RECEIVED: &str = "Received";
pub const PUBLISHED: &str = "Published";
pub const EXPIRES: &str = "Expires";
pub const TOPIC: &str = "Topic";
pub const CONTENT_TYPE: &str = "ContentType";
pub const IMPORTANCE: &str = "Importance";
pub const SECURITY_TOKEN: &str = "SecurityToken";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Importance {
    Low,
    #[default]
    Normal,
    Critical,
}

impl fmt::Display for Importance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Importance::Low => "Low",
            Importance::Normal => "Normal",
            Importance::Critical => "Critical",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Importance {
    type Err = HeaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            s if s.eq_ignore_ascii_case("low") => Ok(Importance::Low),
            s if s.eq_ignore_ascii_case("normal") => Ok(Importance::Normal),
            s if s.eq_ignore_ascii_case("critical") => Ok(Importance::Critical),
            other => Err(HeaderError::InvalidValue {
                name: IMPORTANCE.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header line has no colon separator: {0:?}")]
    MissingColon(String),

    #[error("header line starts with a colon: {0:?}")]
    EmptyName(String),

    #[error("invalid value {value:?} for header {name}")]
    InvalidValue { name: String, value: String },
}

/// Case-insensitive, insertion-ordered header map.
///
/// Lookups are case-insensitive; the original casing used on first insert is
/// preserved for encoding. A second `insert` with a different casing of the
/// same name overwrites the value in place, keeping the original casing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: IndexMap<String, String>,
    /// lowercased name -> canonical-cased name actually stored in `entries`
    index: IndexMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let lower = name.to_ascii_lowercase();
        if let Some(canonical) = self.index.get(&lower).cloned() {
            self.entries.insert(canonical, value);
        } else {
            self.index.insert(lower, name.clone());
            self.entries.insert(name, value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        let canonical = self.index.get(&lower)?;
        self.entries.get(canonical).map(|s| s.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let lower = name.to_ascii_lowercase();
        let canonical = self.index.shift_remove(&lower)?;
        self.entries.shift_remove(&canonical)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // --- typed accessors for the recognized fields -------------------------

    pub fn message_id(&self) -> Option<&str> {
        self.get(MESSAGE_ID)
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.insert(MESSAGE_ID, id);
    }

    pub fn message_name(&self) -> Option<&str> {
        self.get(MESSAGE_NAME)
    }

    pub fn origination(&self) -> Option<&str> {
        self.get(ORIGINATION)
    }

    pub fn destination(&self) -> Option<&str> {
        self.get(DESTINATION)
    }

    pub fn set_destination(&mut self, uri: impl Into<String>) {
        self.insert(DESTINATION, uri);
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.get(REPLY_TO)
    }

    pub fn related_to(&self) -> Option<&str> {
        self.get(RELATED_TO)
    }

    pub fn topic(&self) -> Option<&str> {
        self.get(TOPIC)
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.insert(TOPIC, topic);
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(CONTENT_TYPE)
    }

    pub fn security_token(&self) -> Option<&str> {
        self.get(SECURITY_TOKEN)
    }

    pub fn set_security_token(&mut self, token: impl Into<String>) {
        self.insert(SECURITY_TOKEN, token);
    }

    pub fn importance(&self) -> Importance {
        self.get(IMPORTANCE)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    pub fn set_importance(&mut self, importance: Importance) {
        self.insert(IMPORTANCE, importance.to_string());
    }

    fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        self.get(name).and_then(|v| DateTime::parse_from_rfc3339(v).ok()).map(|d| d.with_timezone(&Utc))
    }

    fn set_timestamp(&mut self, name: &str, value: DateTime<Utc>) {
        self.insert(name, value.to_rfc3339());
    }

    pub fn sent(&self) -> Option<DateTime<Utc>> {
        self.timestamp(SENT)
    }

    pub fn set_sent(&mut self, value: DateTime<Utc>) {
        self.set_timestamp(SENT, value);
    }

    pub fn received(&self) -> Option<DateTime<Utc>> {
        self.timestamp(RECEIVED)
    }

    pub fn set_received(&mut self, value: DateTime<Utc>) {
        self.set_timestamp(RECEIVED, value);
    }

    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.timestamp(PUBLISHED)
    }

    pub fn set_published(&mut self, value: DateTime<Utc>) {
        self.set_timestamp(PUBLISHED, value);
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.timestamp(EXPIRES)
    }

    pub fn set_expires(&mut self, value: DateTime<Utc>) {
        self.set_timestamp(EXPIRES, value);
    }

    pub fn is_expired(&self) -> bool {
        self.expires().map(|e| e < Utc::now()).unwrap_or(false)
    }

    /// Encode as the RFC-822-style blob used in storage (`§4.1`): one header
    /// per line, continuation lines of a multi-line value indented by four
    /// spaces, terminated by a blank line. `#`-prefixed lines are reserved
    /// and never emitted by the encoder.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.iter() {
            let mut lines = value.split('\n');
            if let Some(first) = lines.next() {
                out.push_str(name);
                out.push_str(": ");
                out.push_str(first);
                out.push('\n');
            }
            for cont in lines {
                out.push_str("    ");
                out.push_str(cont);
                out.push('\n');
            }
        }
        out.push('\n');
        out
    }

    /// Decode the RFC-822-style blob produced by [`Headers::encode`].
    ///
    /// `#`-prefixed lines are ignored. A line with no colon, or a colon at
    /// position zero, is rejected. Continuation lines (any leading
    /// whitespace) are unescaped by stripping that leading whitespace and
    /// appending as a new line in the value.
    pub fn decode(blob: &str) -> Result<Self, HeaderError> {
        let mut headers = Headers::new();
        let mut current: Option<(String, String)> = None;

        for raw_line in blob.split('\n') {
            let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);

            if line.is_empty() {
                break;
            }
            if line.starts_with('#') {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                let cont = line.trim_start();
                match &mut current {
                    Some((_, value)) => {
                        value.push('\n');
                        value.push_str(cont);
                    }
                    None => return Err(HeaderError::MissingColon(line.to_string())),
                }
                continue;
            }

            if let Some((name, value)) = current.take() {
                headers.insert(name, value);
            }

            let colon = line.find(':').ok_or_else(|| HeaderError::MissingColon(line.to_string()))?;
            if colon == 0 {
                return Err(HeaderError::EmptyName(line.to_string()));
            }
            let name = line[..colon].to_string();
            let value = line[colon + 1..].trim_start().to_string();
            current = Some((name, value));
        }

        if let Some((name, value)) = current.take() {
            headers.insert(name, value);
        }

        Ok(headers)
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_simple_headers() {
        let mut h = Headers::new();
        h.set_message_id("abc-123");
        h.insert("MessageName", "OrderPlaced");
        let encoded = h.encode();
        let decoded = Headers::decode(&encoded).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn round_trips_multiline_values() {
        let mut h = Headers::new();
        h.insert("X-Note", "line one\nline two\nline three");
        let encoded = h.encode();
        assert!(encoded.contains("    line two\n"));
        let decoded = Headers::decode(&encoded).unwrap();
        assert_eq!(decoded.get("X-Note"), Some("line one\nline two\nline three"));
    }

    #[test]
    fn round_trips_mixed_case_and_empty_values() {
        let mut h = Headers::new();
        h.insert("ReplyTo", "");
        h.insert("oRiGiNaTiOn", "http://a/");
        let decoded = Headers::decode(&h.encode()).unwrap();
        assert_eq!(decoded.get("replyto"), Some(""));
        assert_eq!(decoded.get("ORIGINATION"), Some("http://a/"));
    }

    #[test]
    fn case_insensitive_overwrite_preserves_first_casing() {
        let mut h = Headers::new();
        h.insert("MessageId", "1");
        h.insert("messageid", "2");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("MESSAGEID"), Some("2"));
        assert!(h.iter().any(|(k, _)| k == "MessageId"));
    }

    #[test]
    fn decode_rejects_missing_colon() {
        assert!(Headers::decode("NotAHeader\n\n").is_err());
    }

    #[test]
    fn decode_rejects_leading_colon() {
        assert!(Headers::decode(": value\n\n").is_err());
    }

    #[test]
    fn decode_ignores_comment_lines() {
        let decoded = Headers::decode("# reserved\nMessageId: x\n\n").unwrap();
        assert_eq!(decoded.message_id(), Some("x"));
    }

    #[test]
    fn decode_accepts_tab_continuation() {
        let decoded = Headers::decode("X-Note: a\n\tb\n\n").unwrap();
        assert_eq!(decoded.get("X-Note"), Some("a\nb"));
    }

    #[test]
    fn importance_default_is_normal() {
        let h = Headers::new();
        assert_eq!(h.importance(), Importance::Normal);
    }

    #[test]
    fn expiry_in_past_is_detected() {
        let mut h = Headers::new();
        h.set_expires(Utc::now() - chrono::Duration::seconds(5));
        assert!(h.is_expired());
    }
}
