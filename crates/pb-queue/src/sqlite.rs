use async_trait::async_trait;
use chrono::Utc;
use pb_common::diagnostics::{DiagnosticContext, DiagnosticEvent, DiagnosticEventType};
use pb_common::{Headers, Message, Principal, SecurityTokenService, SharedDiagnosticSink};
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{DeliveryContext, ListenerError, MessageListener, Queue, QueueError, QueueOptions, Result};

/// SQLite-backed durable queue. One background "intake" task claims pending
/// rows and spawns a dispatch task per row, bounded by a semaphore sized to
/// `QueueOptions::concurrency_limit`; each dispatch task keeps its row across
/// retries rather than releasing it back to the claim pool.
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    options: QueueOptions,
    token_service: Arc<dyn SecurityTokenService>,
    sink: SharedDiagnosticSink,
    handoff: mpsc::Sender<()>,
    cancel: CancellationToken,
    intake: Mutex<Option<JoinHandle<()>>>,
}

struct ClaimedRow {
    seq: i64,
    headers_blob: String,
    content: Vec<u8>,
    attempts: u32,
}

impl SqliteQueue {
    pub async fn create(
        pool: Pool<Sqlite>,
        queue_name: impl Into<String>,
        listener: Arc<dyn MessageListener>,
        options: QueueOptions,
        token_service: Arc<dyn SecurityTokenService>,
        sink: SharedDiagnosticSink,
    ) -> Result<Arc<Self>> {
        let queue_name = queue_name.into();
        create_schema(&pool).await?;
        let recovered = reset_stale_claims(&pool, &queue_name).await?;
        if recovered > 0 {
            info!(queue = %queue_name, count = recovered, "recovered pending messages on queue creation");
        }

        let capacity = options.handoff_buffer.unwrap_or(65_536).max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();

        let intake_handle = tokio::spawn(intake_loop(
            pool.clone(),
            queue_name.clone(),
            options.clone(),
            listener,
            token_service.clone(),
            sink.clone(),
            rx,
            cancel.clone(),
        ));
        // Kick the intake loop once so rows left over from a previous
        // process (recovered above) get picked up without waiting for the
        // fallback tick.
        let _ = tx.try_send(());

        sink.emit(DiagnosticEvent {
            event_type: DiagnosticEventType::ComponentInitialized,
            source: "pb-queue".to_string(),
            context: DiagnosticContext::default().with_queue(queue_name.clone()),
        });

        Ok(Arc::new(Self {
            pool,
            queue_name,
            options,
            token_service,
            sink,
            handoff: tx,
            cancel,
            intake: Mutex::new(Some(intake_handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn enqueue(&self, message: Message, principal: Option<Principal>) -> Result<()> {
        let mut headers = message.headers().clone();
        let message_id = headers
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        headers.set_message_id(message_id.clone());

        if let Some(principal) = &principal {
            let expires_at = headers.expires().or_else(|| {
                self.options
                    .ttl
                    .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                    .map(|d| Utc::now() + d)
            });
            let token = self.token_service.issue(principal, expires_at);
            headers.set_security_token(token);
        }

        let headers_blob = headers.encode();
        let content = message.content().to_vec();

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT seq FROM queue_messages WHERE message_id = ? AND queue_name = ?")
            .bind(&message_id)
            .bind(&self.queue_name)
            .fetch_optional(&mut *tx)
            .await?;
        if existing.is_some() {
            tx.rollback().await.ok();
            debug!(message_id = %message_id, queue = %self.queue_name, "duplicate enqueue ignored");
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO queue_messages (message_id, queue_name, headers, content, attempts) \
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(&message_id)
        .bind(&self.queue_name)
        .bind(&headers_blob)
        .bind(&content)
        .execute(&mut *tx)
        .await?;

        if self.handoff.try_send(()).is_err() {
            tx.rollback().await.ok();
            return Err(QueueError::QueueFull);
        }

        tx.commit().await?;

        self.sink.emit(DiagnosticEvent {
            event_type: DiagnosticEventType::MessageEnqueued,
            source: "pb-queue".to_string(),
            context: DiagnosticContext::default()
                .with_message_id(message_id)
                .with_queue(self.queue_name.clone()),
        });
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.intake.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn create_schema(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id TEXT NOT NULL,
            queue_name TEXT NOT NULL,
            headers TEXT NOT NULL,
            content BLOB NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            acknowledged INTEGER,
            abandoned INTEGER,
            claimed_at INTEGER,
            UNIQUE(queue_name, message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_dispatch \
         ON queue_messages (queue_name, acknowledged, abandoned, claimed_at, seq)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Releases claims left behind by a process that crashed mid-dispatch, so
/// those rows are eligible for claim again. Non-durable queues are created
/// fresh each run so this is a no-op for them in practice.
async fn reset_stale_claims(pool: &Pool<Sqlite>, queue_name: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE queue_messages SET claimed_at = NULL \
         WHERE queue_name = ? AND acknowledged IS NULL AND abandoned IS NULL AND claimed_at IS NOT NULL",
    )
    .bind(queue_name)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

async fn claim_next(pool: &Pool<Sqlite>, queue_name: &str) -> Result<Option<ClaimedRow>> {
    loop {
        let row = sqlx::query(
            "SELECT seq, headers, content, attempts FROM queue_messages \
             WHERE queue_name = ? AND acknowledged IS NULL AND abandoned IS NULL AND claimed_at IS NULL \
             ORDER BY seq ASC LIMIT 1",
        )
        .bind(queue_name)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let seq: i64 = row.get("seq");

        let updated = sqlx::query("UPDATE queue_messages SET claimed_at = ? WHERE seq = ? AND claimed_at IS NULL")
            .bind(Utc::now().timestamp_millis())
            .bind(seq)
            .execute(pool)
            .await?;
        if updated.rows_affected() == 0 {
            // another worker claimed it between the select and the update
            continue;
        }

        return Ok(Some(ClaimedRow {
            seq,
            headers_blob: row.get("headers"),
            content: row.get("content"),
            attempts: row.get::<i64, _>("attempts") as u32,
        }));
    }
}

async fn set_attempts(pool: &Pool<Sqlite>, seq: i64, attempts: u32) -> Result<()> {
    sqlx::query("UPDATE queue_messages SET attempts = ? WHERE seq = ?")
        .bind(attempts as i64)
        .bind(seq)
        .execute(pool)
        .await?;
    Ok(())
}

async fn ack_row(pool: &Pool<Sqlite>, seq: i64) -> Result<()> {
    sqlx::query("UPDATE queue_messages SET acknowledged = ? WHERE seq = ?")
        .bind(Utc::now().timestamp_millis())
        .bind(seq)
        .execute(pool)
        .await?;
    Ok(())
}

async fn abandon_row(pool: &Pool<Sqlite>, seq: i64) -> Result<()> {
    sqlx::query("UPDATE queue_messages SET abandoned = ? WHERE seq = ?")
        .bind(Utc::now().timestamp_millis())
        .bind(seq)
        .execute(pool)
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn intake_loop(
    pool: Pool<Sqlite>,
    queue_name: String,
    options: QueueOptions,
    listener: Arc<dyn MessageListener>,
    token_service: Arc<dyn SecurityTokenService>,
    sink: SharedDiagnosticSink,
    mut rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(options.concurrency_limit.max(1) as usize));
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = rx.recv() => {
                if maybe.is_none() {
                    break;
                }
            }
            _ = ticker.tick() => {}
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            match claim_next(&pool, &queue_name).await {
                Ok(Some(row)) => {
                    let pool = pool.clone();
                    let queue_name = queue_name.clone();
                    let options = options.clone();
                    let listener = listener.clone();
                    let token_service = token_service.clone();
                    let sink = sink.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        dispatch_row(pool, queue_name, options, listener, token_service, sink, row, cancel).await;
                    });
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(queue = %queue_name, error = %err, "failed to claim pending message");
                    break;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_row(
    pool: Pool<Sqlite>,
    queue_name: String,
    options: QueueOptions,
    listener: Arc<dyn MessageListener>,
    token_service: Arc<dyn SecurityTokenService>,
    sink: SharedDiagnosticSink,
    row: ClaimedRow,
    cancel: CancellationToken,
) {
    let headers = match Headers::decode(&row.headers_blob) {
        Ok(h) => h,
        Err(err) => {
            warn!(queue = %queue_name, error = %err, "dropping message with unparseable headers");
            let _ = abandon_row(&pool, row.seq).await;
            return;
        }
    };

    let message_id = headers.message_id().map(|s| s.to_string());
    let principal = headers
        .security_token()
        .and_then(|token| token_service.validate(token).ok());
    let content = row.content;
    let mut attempts = row.attempts;

    loop {
        attempts += 1;
        if let Err(err) = set_attempts(&pool, row.seq, attempts).await {
            warn!(queue = %queue_name, error = %err, "failed to record attempt");
            return;
        }

        let message = Message::new(headers.clone(), content.clone());
        let context = DeliveryContext::new();
        let outcome = listener
            .message_received(message, principal.clone(), &context, cancel.clone())
            .await;
        let acknowledged = context.is_acknowledged() || (options.auto_acknowledge && outcome.is_ok());

        let mut diag_context = DiagnosticContext::default().with_queue(queue_name.clone());
        if let Some(id) = &message_id {
            diag_context = diag_context.with_message_id(id.clone());
        }

        if acknowledged {
            if let Err(err) = ack_row(&pool, row.seq).await {
                warn!(queue = %queue_name, error = %err, "failed to acknowledge message");
            }
            sink.emit(DiagnosticEvent {
                event_type: DiagnosticEventType::MessageAcknowledged,
                source: "pb-queue".to_string(),
                context: diag_context,
            });
            return;
        }

        let diag_context = match &outcome {
            Err(ListenerError(reason)) => diag_context.with_exception(reason.clone()),
            Ok(()) => diag_context,
        };
        sink.emit(DiagnosticEvent {
            event_type: DiagnosticEventType::MessageNotAcknowledged,
            source: "pb-queue".to_string(),
            context: diag_context.clone(),
        });

        if attempts >= options.max_attempts || cancel.is_cancelled() {
            if let Err(err) = abandon_row(&pool, row.seq).await {
                warn!(queue = %queue_name, error = %err, "failed to abandon message");
            }
            sink.emit(DiagnosticEvent {
                event_type: DiagnosticEventType::DeadLetter,
                source: "pb-queue".to_string(),
                context: diag_context,
            });
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(options.retry_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_common::HmacTokenService;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    async fn test_pool() -> Pool<Sqlite> {
        SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap()
    }

    struct CountingListener {
        calls: AtomicU32,
        acknowledge: bool,
    }

    #[async_trait]
    impl MessageListener for CountingListener {
        async fn message_received(
            &self,
            _message: Message,
            _principal: Option<Principal>,
            context: &DeliveryContext,
            _cancel: CancellationToken,
        ) -> std::result::Result<(), ListenerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.acknowledge {
                context.acknowledge();
            }
            Ok(())
        }
    }

    struct FailingListener {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageListener for FailingListener {
        async fn message_received(
            &self,
            _message: Message,
            _principal: Option<Principal>,
            _context: &DeliveryContext,
            _cancel: CancellationToken,
        ) -> std::result::Result<(), ListenerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ListenerError("simulated failure".to_string()))
        }
    }

    async fn pending_count(pool: &Pool<Sqlite>, queue: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) as c FROM queue_messages WHERE queue_name = ? AND acknowledged IS NULL AND abandoned IS NULL")
            .bind(queue)
            .fetch_one(pool)
            .await
            .unwrap()
            .get("c")
    }

    #[tokio::test]
    async fn delivers_and_acknowledges() {
        let pool = test_pool().await;
        let listener = Arc::new(CountingListener { calls: AtomicU32::new(0), acknowledge: true });
        let queue = SqliteQueue::create(
            pool.clone(),
            "orders",
            listener.clone(),
            QueueOptions::default(),
            Arc::new(HmacTokenService::new(b"k".to_vec())),
            pb_common::diagnostics::default_sink(),
        )
        .await
        .unwrap();

        let mut headers = Headers::new();
        headers.set_message_id("m1");
        queue.enqueue(Message::new(headers, b"payload".to_vec()), None).await.unwrap();

        for _ in 0..50 {
            if listener.calls.load(Ordering::SeqCst) >= 1 && pending_count(&pool, "orders").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pending_count(&pool, "orders").await, 0);
        queue.close().await;
    }

    #[tokio::test]
    async fn retries_then_abandons_after_max_attempts() {
        let pool = test_pool().await;
        let listener = Arc::new(FailingListener { calls: AtomicU32::new(0) });
        let options = QueueOptions {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            ..QueueOptions::default()
        };
        let queue = SqliteQueue::create(
            pool.clone(),
            "retry-q",
            listener.clone(),
            options,
            Arc::new(HmacTokenService::new(b"k".to_vec())),
            pb_common::diagnostics::default_sink(),
        )
        .await
        .unwrap();

        let mut headers = Headers::new();
        headers.set_message_id("m2");
        queue.enqueue(Message::new(headers, b"payload".to_vec()), None).await.unwrap();

        for _ in 0..100 {
            if listener.calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(listener.calls.load(Ordering::SeqCst), 3);

        let row = sqlx::query("SELECT attempts, abandoned FROM queue_messages WHERE message_id = ?")
            .bind("m2")
            .fetch_one(&pool)
            .await
            .unwrap();
        let attempts: i64 = row.get("attempts");
        let abandoned: Option<i64> = row.get("abandoned");
        assert_eq!(attempts, 3);
        assert!(abandoned.is_some());
        queue.close().await;
    }

    #[tokio::test]
    async fn auto_acknowledge_commits_successful_listener() {
        let pool = test_pool().await;
        let listener = Arc::new(CountingListener { calls: AtomicU32::new(0), acknowledge: false });
        let options = QueueOptions { auto_acknowledge: true, ..QueueOptions::default() };
        let queue = SqliteQueue::create(
            pool.clone(),
            "auto-ack",
            listener.clone(),
            options,
            Arc::new(HmacTokenService::new(b"k".to_vec())),
            pb_common::diagnostics::default_sink(),
        )
        .await
        .unwrap();

        let mut headers = Headers::new();
        headers.set_message_id("m3");
        queue.enqueue(Message::new(headers, b"payload".to_vec()), None).await.unwrap();

        for _ in 0..50 {
            if pending_count(&pool, "auto-ack").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pending_count(&pool, "auto-ack").await, 0);
        queue.close().await;
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_idempotent() {
        let pool = test_pool().await;
        let listener = Arc::new(CountingListener { calls: AtomicU32::new(0), acknowledge: true });
        let queue = SqliteQueue::create(
            pool.clone(),
            "dedup-q",
            listener.clone(),
            QueueOptions::default(),
            Arc::new(HmacTokenService::new(b"k".to_vec())),
            pb_common::diagnostics::default_sink(),
        )
        .await
        .unwrap();

        let mut headers = Headers::new();
        headers.set_message_id("dup-1");
        queue.enqueue(Message::new(headers.clone(), b"a".to_vec()), None).await.unwrap();
        queue.enqueue(Message::new(headers, b"b".to_vec()), None).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM queue_messages WHERE message_id = 'dup-1'")
            .fetch_one(&pool)
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 1);
        queue.close().await;
    }

    #[tokio::test]
    async fn crash_recovery_redispatches_stale_claims() {
        let pool = test_pool().await;
        create_schema(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO queue_messages (message_id, queue_name, headers, content, attempts, claimed_at) \
             VALUES ('m-crashed', 'recover-q', 'MessageId: m-crashed\n\n', X'70', 1, 123456)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let listener = Arc::new(CountingListener { calls: AtomicU32::new(0), acknowledge: true });
        let queue = SqliteQueue::create(
            pool.clone(),
            "recover-q",
            listener.clone(),
            QueueOptions::default(),
            Arc::new(HmacTokenService::new(b"k".to_vec())),
            pb_common::diagnostics::default_sink(),
        )
        .await
        .unwrap();

        for _ in 0..50 {
            if listener.calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        queue.close().await;
    }
}
