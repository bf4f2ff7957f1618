use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_core::config::TopicConfig;
use herald_core::event::{
    DeadLetter, Event, EventState, EventStats, FailOutcome, NewEvent, Notification, TopicRecord,
    UnknownEventState,
};
use herald_core::retry::{FailureDecision, decide};
use herald_core::store::{EventStore, StoreError};
use sqlx::{FromRow, PgPool};
use std::time::Duration;

/// The channel notifications are sent on unless configured otherwise.
pub const DEFAULT_CHANNEL: &str = "herald_events";

/// Intervals are clamped to about a century so they always fit a postgres interval.
const MAX_INTERVAL_MS: u128 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Columns of an event row, in the order [`PgEventRow`] expects them.
const EVENT_COLUMNS: &str = "e.id, e.topic_id, e.idempotency_key, e.state, e.message, e.headers, \
                             e.attempts, e.next_attempt_at, e.created_at, e.updated_at";

/// A postgres backed event store.
///
/// Claims rely on `FOR UPDATE SKIP LOCKED`, so any number of processes can share the tables.
/// Publish notifications come from a trigger installed by [`setup_trigger`](Self::setup_trigger).
/// Without it, events are only picked up by the topics' backlog reconcilers.
#[derive(Clone, Debug)]
pub struct PgEventStore {
    pool: PgPool,
    channel: String,
}

/// Failures specific to the postgres store. They reach the engine as
/// [`StoreError::Unexpected`].
#[derive(Debug, thiserror::Error)]
pub enum PgStoreError {
    /// A query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A row holds a state the engine does not know.
    #[error("invalid event row: {0}")]
    InvalidRow(#[from] UnknownEventState),
}

impl From<PgStoreError> for StoreError {
    fn from(error: PgStoreError) -> Self {
        StoreError::unexpected(error)
    }
}

fn db_error(error: sqlx::Error) -> StoreError {
    PgStoreError::Database(error).into()
}

fn interval_ms(duration: Duration) -> f64 {
    duration.as_millis().min(MAX_INTERVAL_MS) as f64
}

fn to_millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

fn from_millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// Postgres representation of a topic.
#[derive(Debug, FromRow)]
struct PgTopicRow {
    id: i64,
    name: String,
    max_retries: i32,
    initial_backoff_ms: i64,
    max_backoff_ms: i64,
    backoff_multiplier: f64,
    dlq_enabled: bool,
    dlq_max_age_ms: i64,
}

impl From<PgTopicRow> for TopicRecord {
    fn from(row: PgTopicRow) -> Self {
        TopicRecord {
            id: row.id,
            config: TopicConfig {
                name: row.name,
                max_retries: row.max_retries.max(0) as u32,
                initial_backoff: from_millis(row.initial_backoff_ms),
                max_backoff: from_millis(row.max_backoff_ms),
                backoff_multiplier: row.backoff_multiplier,
                dlq_enabled: row.dlq_enabled,
                dlq_max_age: from_millis(row.dlq_max_age_ms),
            },
        }
    }
}

/// Postgres representation of an event.
#[derive(Debug, FromRow)]
struct PgEventRow {
    id: i64,
    topic_id: i64,
    idempotency_key: String,
    state: String,
    message: Vec<u8>,
    headers: Vec<u8>,
    attempts: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PgEventRow> for Event {
    type Error = StoreError;

    fn try_from(row: PgEventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            id: row.id,
            topic_id: row.topic_id,
            idempotency_key: row.idempotency_key,
            state: row
                .state
                .parse::<EventState>()
                .map_err(PgStoreError::InvalidRow)?,
            message: row.message,
            headers: row.headers,
            attempts: row.attempts.max(0) as u32,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// An active event locked for a failure report, with its topic's policy.
#[derive(Debug, FromRow)]
struct PgFailingRow {
    attempts: i32,
    idempotency_key: String,
    #[sqlx(flatten)]
    topic: PgTopicRow,
}

#[derive(Debug, FromRow)]
struct PgStatsRow {
    pending: i64,
    active: i64,
    succeeded: i64,
    failed: i64,
    dead_letters: i64,
    stuck: i64,
}

#[derive(Debug, FromRow)]
struct PgDeadLetterRow {
    topic_id: i64,
    idempotency_key: String,
    event_id: i64,
    error_message: String,
    created_at: DateTime<Utc>,
}

impl From<PgDeadLetterRow> for DeadLetter {
    fn from(row: PgDeadLetterRow) -> Self {
        DeadLetter {
            topic_id: row.topic_id,
            idempotency_key: row.idempotency_key,
            event_id: row.event_id,
            error_message: row.error_message,
            created_at: row.created_at,
        }
    }
}

impl PgEventStore {
    /// Creates a store notifying on [`DEFAULT_CHANNEL`].
    pub fn new(pool: PgPool) -> Self {
        Self::with_channel(pool, DEFAULT_CHANNEL)
    }

    /// Creates a store notifying on a custom channel.
    pub fn with_channel(pool: PgPool, channel: impl Into<String>) -> Self {
        log::debug!("Creating a new PgEventStore");
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Exposes the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The notification channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Installs the trigger that notifies the store's channel on every event insert.
    ///
    /// Run the [`Migrator`](crate::migrations::Migrator) first. Calling this again replaces the
    /// trigger, e.g. after changing the channel.
    pub async fn setup_trigger(&self) -> Result<(), sqlx::Error> {
        sqlx::query("DROP TRIGGER IF EXISTS herald_events_notify_trigger ON herald_events")
            .execute(&self.pool)
            .await?;

        // The channel is a trigger argument, so it cannot be bound
        let create_trigger = format!(
            r#"
            CREATE TRIGGER herald_events_notify_trigger
            AFTER INSERT ON herald_events
            FOR EACH ROW
            EXECUTE FUNCTION herald_notify_event('{}')
            "#,
            self.channel.replace('\'', "''")
        );
        sqlx::query(&create_trigger).execute(&self.pool).await?;

        log::info!("Notify trigger installed on channel '{}'", self.channel);
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn create_or_update_topic(&self, config: &TopicConfig) -> Result<TopicRecord, StoreError> {
        let row: PgTopicRow = sqlx::query_as(
            r#"
            INSERT INTO herald_topics (
                name, max_retries, initial_backoff_ms, max_backoff_ms,
                backoff_multiplier, dlq_enabled, dlq_max_age_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE SET
                max_retries = EXCLUDED.max_retries,
                initial_backoff_ms = EXCLUDED.initial_backoff_ms,
                max_backoff_ms = EXCLUDED.max_backoff_ms,
                backoff_multiplier = EXCLUDED.backoff_multiplier,
                dlq_enabled = EXCLUDED.dlq_enabled,
                dlq_max_age_ms = EXCLUDED.dlq_max_age_ms,
                updated_at = NOW()
            RETURNING id, name, max_retries, initial_backoff_ms, max_backoff_ms,
                      backoff_multiplier, dlq_enabled, dlq_max_age_ms
            "#,
        )
        .bind(&config.name)
        .bind(i32::try_from(config.max_retries).unwrap_or(i32::MAX))
        .bind(to_millis(config.initial_backoff))
        .bind(to_millis(config.max_backoff))
        .bind(config.backoff_multiplier)
        .bind(config.dlq_enabled)
        .bind(to_millis(config.dlq_max_age))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        log::debug!("Topic '{}' stored with id {}", row.name, row.id);
        Ok(row.into())
    }

    async fn publish_event(&self, event: NewEvent) -> Result<i64, StoreError> {
        let result: Result<i64, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO herald_events (topic_id, idempotency_key, message, headers)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(event.topic_id)
        .bind(&event.idempotency_key)
        .bind(&event.message)
        .bind(&event.headers)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(id) => Ok(id),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::DuplicateEvent(event.idempotency_key))
            }
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(StoreError::NotFound)
            }
            Err(e) => Err(db_error(e)),
        }
    }

    async fn claim_next_event(&self, topic_id: i64) -> Result<Event, StoreError> {
        let query = format!(
            r#"
            WITH next AS (
                SELECT id FROM herald_events
                WHERE topic_id = $1
                  AND state = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE herald_events e
            SET state = 'active', updated_at = NOW()
            FROM next
            WHERE e.id = next.id
            RETURNING {}
            "#,
            EVENT_COLUMNS
        );

        let row: Option<PgEventRow> = sqlx::query_as(&query)
            .bind(topic_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.ok_or(StoreError::NotFound)?.try_into()
    }

    async fn complete_event(&self, event_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE herald_events
            SET state = 'succeeded', updated_at = NOW()
            WHERE id = $1 AND state = 'active'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail_event(
        &self,
        event_id: i64,
        error_message: &str,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let row: Option<PgFailingRow> = sqlx::query_as(
            r#"
            SELECT e.attempts, e.idempotency_key,
                   t.id, t.name, t.max_retries, t.initial_backoff_ms, t.max_backoff_ms,
                   t.backoff_multiplier, t.dlq_enabled, t.dlq_max_age_ms
            FROM herald_events e
            JOIN herald_topics t ON t.id = e.topic_id
            WHERE e.id = $1 AND e.state = 'active'
            FOR UPDATE OF e
            "#,
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let row = row.ok_or(StoreError::NotFound)?;

        let attempts = row.attempts.max(0) as u32;
        let topic = TopicRecord::from(row.topic);
        let outcome = match decide(&topic.config, attempts) {
            FailureDecision::Retry { delay } => {
                sqlx::query(
                    r#"
                    UPDATE herald_events
                    SET state = 'pending',
                        attempts = attempts + 1,
                        next_attempt_at = NOW() + $2::float8 * INTERVAL '1 millisecond',
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(event_id)
                .bind(interval_ms(delay))
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
                FailOutcome::Retrying
            }
            FailureDecision::DeadLetter => {
                sqlx::query(
                    "UPDATE herald_events SET state = 'failed', updated_at = NOW() WHERE id = $1",
                )
                .bind(event_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;

                sqlx::query(
                    r#"
                    INSERT INTO herald_dead_letters (topic_id, idempotency_key, event_id, error_message)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (topic_id, idempotency_key) DO UPDATE SET
                        event_id = EXCLUDED.event_id,
                        error_message = EXCLUDED.error_message,
                        created_at = NOW()
                    "#,
                )
                .bind(topic.id)
                .bind(&row.idempotency_key)
                .bind(event_id)
                .bind(error_message)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
                FailOutcome::DeadLettered
            }
            FailureDecision::Fail => {
                sqlx::query(
                    "UPDATE herald_events SET state = 'failed', updated_at = NOW() WHERE id = $1",
                )
                .bind(event_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
                FailOutcome::Failed
            }
        };

        tx.commit().await.map_err(db_error)?;
        Ok(outcome)
    }

    async fn discard_event(&self, event_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM herald_events WHERE id = $1 AND state = 'active'")
            .bind(event_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_event_stats(
        &self,
        topic_id: i64,
        stuck_threshold: Duration,
    ) -> Result<EventStats, StoreError> {
        let row: PgStatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'pending') AS pending,
                COUNT(*) FILTER (WHERE state = 'active') AS active,
                COUNT(*) FILTER (WHERE state = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE state = 'failed') AS failed,
                COUNT(*) FILTER (
                    WHERE state = 'active'
                      AND updated_at <= NOW() - $2::float8 * INTERVAL '1 millisecond'
                ) AS stuck,
                (SELECT COUNT(*) FROM herald_dead_letters WHERE topic_id = $1) AS dead_letters
            FROM herald_events
            WHERE topic_id = $1
            "#,
        )
        .bind(topic_id)
        .bind(interval_ms(stuck_threshold))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(EventStats {
            pending: row.pending as u64,
            active: row.active as u64,
            succeeded: row.succeeded as u64,
            failed: row.failed as u64,
            dead_letters: row.dead_letters as u64,
            stuck: row.stuck as u64,
        })
    }

    async fn clear_stuck_events(
        &self,
        topic_id: i64,
        max_count: u32,
        older_than: Duration,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            WITH stuck AS (
                SELECT id FROM herald_events
                WHERE topic_id = $1
                  AND state = 'active'
                  AND updated_at <= NOW() - $3::float8 * INTERVAL '1 millisecond'
                ORDER BY updated_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE herald_events e
            SET state = 'pending', next_attempt_at = NULL, updated_at = NOW()
            FROM stuck
            WHERE e.id = stuck.id
            "#,
        )
        .bind(topic_id)
        .bind(i64::from(max_count))
        .bind(interval_ms(older_than))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn cleanup_old_dead_letters(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM herald_dead_letters d
            USING herald_topics t
            WHERE d.topic_id = t.id
              AND d.created_at <= NOW() - LEAST(t.dlq_max_age_ms, $1)::float8 * INTERVAL '1 millisecond'
            "#,
        )
        // Stored ages keep the configured value; the comparison is clamped to a valid interval
        .bind(MAX_INTERVAL_MS as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn retry_dead_letter(
        &self,
        topic_id: i64,
        idempotency_key: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let event_id: Option<i64> = sqlx::query_scalar(
            r#"
            DELETE FROM herald_dead_letters
            WHERE topic_id = $1 AND idempotency_key = $2
            RETURNING event_id
            "#,
        )
        .bind(topic_id)
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;
        let event_id = event_id.ok_or(StoreError::NotFound)?;

        sqlx::query(
            r#"
            UPDATE herald_events
            SET state = 'pending', attempts = 0, next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(event_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        // Delivered on commit, like the insert trigger
        let notification = Notification {
            id: event_id,
            topic: topic_id,
        };
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.channel)
            .bind(notification.to_payload())
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        topic_id: i64,
        limit: u32,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let rows: Vec<PgDeadLetterRow> = sqlx::query_as(
            r#"
            SELECT topic_id, idempotency_key, event_id, error_message, created_at
            FROM herald_dead_letters
            WHERE topic_id = $1
            ORDER BY created_at, event_id
            LIMIT $2
            "#,
        )
        .bind(topic_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(DeadLetter::from).collect())
    }
}
