use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubscriptionError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for SubscriptionError {
    fn from(e: sqlx::Error) -> Self {
        SubscriptionError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SubscriptionError>;
