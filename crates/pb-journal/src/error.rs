use thiserror::Error;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("database error: {0}")]
    Database(String),

    #[error("stored headers could not be decoded: {0}")]
    HeaderDecode(#[from] pb_common::HeaderError),

    #[error("corrupt journal row: {0}")]
    CorruptRow(String),
}

impl From<sqlx::Error> for JournalError {
    fn from(e: sqlx::Error) -> Self {
        JournalError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;
