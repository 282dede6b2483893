use crate::headers::Headers;
use bytes::Bytes;

/// An immutable envelope of headers and opaque content.
///
/// `Message` has no public mutators once built; callers that need to change
/// a message (e.g. rewriting `Destination` for a fan-out target) build a new
/// one from the old one's headers, as [`Message::with_headers`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    headers: Headers,
    content: Bytes,
}

impl Message {
    pub fn new(headers: Headers, content: impl Into<Bytes>) -> Self {
        Self {
            headers,
            content: content.into(),
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Build a copy of this message with different headers but the same
    /// content, used when fanning a publication out to multiple subscribers.
    pub fn with_headers(&self, headers: Headers) -> Self {
        Self {
            headers,
            content: self.content.clone(),
        }
    }
}
