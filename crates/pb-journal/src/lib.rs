//! Append-only, paginated, filterable message journal (spec.md §4.3).

pub mod error;
pub mod sqlite;

pub use error::{JournalError, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pb_common::Message;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Opaque, totally ordered token identifying a journal entry.
///
/// `Position(0)` is the sentinel "before the first entry" value returned by
/// [`Journal::get_beginning_of_journal`] on an empty journal; real entries
/// are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(i64);

impl Position {
    pub fn beginning() -> Self {
        Position(0)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl From<i64> for Position {
    fn from(value: i64) -> Self {
        Position(value)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid journal position: {0:?}")]
pub struct PositionParseError(String);

impl FromStr for Position {
    type Err = PositionParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<i64>().map(Position).map_err(|_| PositionParseError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalCategory {
    Sent,
    Received,
    Published,
}

impl fmt::Display for JournalCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JournalCategory::Sent => "Sent",
            JournalCategory::Received => "Received",
            JournalCategory::Published => "Published",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognized journal category: {0:?}")]
pub struct CategoryParseError(String);

impl FromStr for JournalCategory {
    type Err = CategoryParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Sent" => Ok(JournalCategory::Sent),
            "Received" => Ok(JournalCategory::Received),
            "Published" => Ok(JournalCategory::Published),
            other => Err(CategoryParseError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub position: Position,
    pub timestamp: DateTime<Utc>,
    pub category: JournalCategory,
    pub message: Message,
}

/// Conjunctive filter over category and topic. An empty (`None`) dimension
/// imposes no restriction on that dimension.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    categories: Option<HashSet<JournalCategory>>,
    topics: Option<HashSet<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = JournalCategory>) -> Self {
        self.categories = Some(categories.into_iter().collect());
        self
    }

    pub fn with_topics(mut self, topics: impl IntoIterator<Item = String>) -> Self {
        self.topics = Some(topics.into_iter().collect());
        self
    }

    pub fn categories(&self) -> Option<&HashSet<JournalCategory>> {
        self.categories.as_ref()
    }

    pub fn topics(&self) -> Option<&HashSet<String>> {
        self.topics.as_ref()
    }
}

/// One page of a [`Journal::read`] call.
#[derive(Debug, Clone)]
pub struct ReadPage {
    pub entries: Vec<JournalEntry>,
    /// Position to pass as `start` on the next call to continue reading.
    pub next: Position,
    /// True when fewer entries than requested were available, i.e. there is
    /// nothing more to read as of this call.
    pub end_of_journal: bool,
}

#[async_trait]
pub trait Journal: Send + Sync {
    async fn append(&self, message: Message, category: JournalCategory) -> Result<Position>;

    /// Returns up to `count` entries with `position > start`, matching
    /// `filter` if given. Repeatable: identical arguments return identical
    /// entries in identical order.
    async fn read(&self, start: Position, count: u32, filter: Option<&Filter>) -> Result<ReadPage>;

    async fn get_beginning_of_journal(&self) -> Result<Position>;
}
