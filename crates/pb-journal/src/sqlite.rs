use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pb_common::{Headers, Message};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::str::FromStr;

use crate::{Filter, Journal, JournalCategory, JournalEntry, JournalError, Position, ReadPage, Result};

/// SQLite-backed journal. `position` is the table's autoincrement rowid
/// surrogate, which already satisfies the "strictly monotonic, totally
/// ordered" requirement (spec.md §4.3) without any extra bookkeeping.
pub struct SqliteJournal {
    pool: Pool<Sqlite>,
}

impl SqliteJournal {
    pub async fn create(pool: Pool<Sqlite>) -> Result<Self> {
        create_schema(&pool).await?;
        Ok(Self { pool })
    }
}

async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS message_journal (
            position INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            category TEXT NOT NULL,
            topic TEXT,
            headers TEXT NOT NULL,
            content BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_journal_category ON message_journal (category)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_journal_topic ON message_journal (topic)")
        .execute(pool)
        .await?;

    Ok(())
}

#[async_trait]
impl Journal for SqliteJournal {
    async fn append(&self, message: Message, category: JournalCategory) -> Result<Position> {
        let topic = message.headers().topic().map(|s| s.to_string());
        let headers_blob = message.headers().encode();
        let content = message.content().to_vec();
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO message_journal (timestamp, category, topic, headers, content) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(category.to_string())
        .bind(topic)
        .bind(headers_blob)
        .bind(content)
        .execute(&self.pool)
        .await?;

        Ok(Position::from(result.last_insert_rowid()))
    }

    async fn read(&self, start: Position, count: u32, filter: Option<&Filter>) -> Result<ReadPage> {
        // Fetch one extra row so `end_of_journal` can be determined without
        // a second query.
        let limit = count as i64 + 1;
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT position, timestamp, category, headers, content FROM message_journal WHERE position > ",
        );
        qb.push_bind(start.value());

        if let Some(filter) = filter {
            if let Some(categories) = filter.categories() {
                if categories.is_empty() {
                    qb.push(" AND 0");
                } else {
                    qb.push(" AND category IN (");
                    let mut sep = qb.separated(", ");
                    for c in categories {
                        sep.push_bind(c.to_string());
                    }
                    qb.push_unseparated(")");
                }
            }
            if let Some(topics) = filter.topics() {
                if topics.is_empty() {
                    qb.push(" AND 0");
                } else {
                    qb.push(" AND topic IN (");
                    let mut sep = qb.separated(", ");
                    for t in topics {
                        sep.push_bind(t.clone());
                    }
                    qb.push_unseparated(")");
                }
            }
        }

        qb.push(" ORDER BY position ASC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;

        let end_of_journal = rows.len() as i64 <= count as i64;
        let take = rows.len().min(count as usize);

        let mut entries = Vec::with_capacity(take);
        for row in rows.into_iter().take(take) {
            let position = Position::from(row.get::<i64, _>("position"));
            let timestamp_ms: i64 = row.get("timestamp");
            let timestamp = Utc.timestamp_millis_opt(timestamp_ms).single().unwrap_or_else(Utc::now);
            let category_raw: String = row.get("category");
            let category = JournalCategory::from_str(&category_raw)
                .map_err(|_| JournalError::CorruptRow(format!("unknown category {category_raw:?}")))?;
            let headers_blob: String = row.get("headers");
            let headers = Headers::decode(&headers_blob)?;
            let content: Vec<u8> = row.get("content");

            entries.push(JournalEntry {
                position,
                timestamp,
                category,
                message: Message::new(headers, content),
            });
        }

        let next = entries.last().map(|e| e.position).unwrap_or(start);
        Ok(ReadPage { entries, next, end_of_journal })
    }

    async fn get_beginning_of_journal(&self) -> Result<Position> {
        Ok(Position::beginning())
    }
}
