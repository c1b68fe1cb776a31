// Visibility-timeout work queue over Postgres.
//
// A received message stays hidden until `visible_at`; if its consumer dies
// without deleting it, it reappears and is redelivered. Every receive rotates
// the receipt, so only the current lease holder can extend or delete.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use graphcrawl_common::{CrawlTask, QueueKind};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("undecodable message {id}: {reason}")]
    Decode { id: i64, reason: String },

    /// The message was redelivered to someone else since we received it.
    #[error("lease on message {0} lost")]
    LeaseLost(i64),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A leased queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub queue: QueueKind,
    pub body: String,
    pub receipt: Uuid,
    /// Deliveries so far, including this one.
    pub receive_count: i32,
}

impl Message {
    pub fn task(&self) -> Result<CrawlTask> {
        serde_json::from_str(&self.body).map_err(|e| QueueError::Decode {
            id: self.id,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Lease the next visible message, waiting up to `max_wait` for one.
    async fn receive(&self, queue: QueueKind, max_wait: Duration) -> Result<Option<Message>>;

    /// Push the message's visibility `by` into the future from now.
    async fn extend_visibility(&self, message: &Message, by: Duration) -> Result<()>;

    /// Acknowledge the message; it will not be redelivered.
    async fn delete(&self, message: &Message) -> Result<()>;

    async fn send(&self, queue: QueueKind, task: &CrawlTask) -> Result<()>;
}

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: i64,
    queue: String,
    body: String,
    receipt: Uuid,
    receive_count: i32,
}

impl TryFrom<MessageRow> for Message {
    type Error = QueueError;

    fn try_from(row: MessageRow) -> Result<Self> {
        let queue = row.queue.parse().map_err(|reason| QueueError::Decode {
            id: row.id,
            reason,
        })?;
        Ok(Message {
            id: row.id,
            queue,
            body: row.body,
            receipt: row.receipt,
            receive_count: row.receive_count,
        })
    }
}

pub struct PgQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub async fn connect(database_url: &str, visibility_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, visibility_timeout))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn try_claim(&self, queue: QueueKind) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE crawl_messages
            SET visible_at = now() + make_interval(secs => $2),
                receipt = $3,
                receive_count = receive_count + 1
            WHERE id = (
                SELECT id FROM crawl_messages
                WHERE queue = $1 AND visible_at <= now()
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, queue, body, receipt, receive_count
            "#,
        )
        .bind(queue.as_str())
        .bind(self.visibility_timeout.as_secs_f64())
        .bind(Uuid::new_v4())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Message::try_from).transpose()
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn receive(&self, queue: QueueKind, max_wait: Duration) -> Result<Option<Message>> {
        let started = Instant::now();
        loop {
            if let Some(message) = self.try_claim(queue).await? {
                debug!(id = message.id, queue = %queue, receive_count = message.receive_count, "Message received");
                return Ok(Some(message));
            }
            let elapsed = started.elapsed();
            if elapsed >= max_wait {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(max_wait - elapsed)).await;
        }
    }

    async fn extend_visibility(&self, message: &Message, by: Duration) -> Result<()> {
        let result = sqlx::query(
            "UPDATE crawl_messages
             SET visible_at = now() + make_interval(secs => $3)
             WHERE id = $1 AND receipt = $2",
        )
        .bind(message.id)
        .bind(message.receipt)
        .bind(by.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(message.id));
        }
        Ok(())
    }

    async fn delete(&self, message: &Message) -> Result<()> {
        let result = sqlx::query("DELETE FROM crawl_messages WHERE id = $1 AND receipt = $2")
            .bind(message.id)
            .bind(message.receipt)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::LeaseLost(message.id));
        }
        Ok(())
    }

    async fn send(&self, queue: QueueKind, task: &CrawlTask) -> Result<()> {
        let body = serde_json::to_string(task).map_err(|e| QueueError::Decode {
            id: 0,
            reason: e.to_string(),
        })?;
        sqlx::query("INSERT INTO crawl_messages (queue, body) VALUES ($1, $2)")
            .bind(queue.as_str())
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
