use thiserror::Error;

/// Failure taxonomy for a single wire delivery attempt (spec.md §4.4, §7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("message has no Destination header")]
    MissingDestination,

    #[error("message has already expired")]
    Expired,

    #[error("401: access denied")]
    AccessDenied,

    #[error("404: resource not found")]
    ResourceNotFound,

    #[error("422: message not acknowledged by recipient")]
    MessageNotAcknowledged,

    #[error("{status}: invalid request")]
    InvalidRequest { status: u16 },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("name resolution failed: {0}")]
    NameResolutionFailed(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("endpoint {0:?} is not configured")]
    EndpointNotFound(String),

    #[error("queue error: {0}")]
    Queue(#[from] pb_queue::QueueError),

    #[error("journal error: {0}")]
    Journal(#[from] pb_journal::JournalError),

    #[error("subscription registry error: {0}")]
    Subscription(#[from] pb_subscriptions::SubscriptionError),
}

impl TransportError {
    /// The classes spec.md §4.4's subscribe loop treats as fatal: terminate
    /// the renewal loop and emit `SubscriptionFailed`.
    pub fn is_subscribe_fatal(&self) -> bool {
        matches!(self, TransportError::EndpointNotFound(_) | TransportError::InvalidRequest { .. })
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
