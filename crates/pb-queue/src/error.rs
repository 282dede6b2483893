use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(String),

    #[error("queue is closed")]
    Closed,

    #[error("in-memory dispatch handoff buffer is saturated")]
    QueueFull,

    #[error("security token error: {0}")]
    Token(#[from] pb_common::TokenError),
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
