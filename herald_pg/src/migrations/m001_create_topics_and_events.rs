//! Migration 001: topics and events.

use super::Migration;

/// Creates `herald_topics` and `herald_events`.
pub struct CreateTopicsAndEvents;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS herald_topics (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(255) NOT NULL UNIQUE,
        max_retries INTEGER NOT NULL,
        initial_backoff_ms BIGINT NOT NULL,
        max_backoff_ms BIGINT NOT NULL,
        backoff_multiplier DOUBLE PRECISION NOT NULL,
        dlq_enabled BOOLEAN NOT NULL,
        dlq_max_age_ms BIGINT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS herald_events (
        id BIGSERIAL PRIMARY KEY,
        topic_id BIGINT NOT NULL REFERENCES herald_topics(id) ON DELETE CASCADE,
        idempotency_key TEXT NOT NULL,
        state VARCHAR(16) NOT NULL DEFAULT 'pending'
            CHECK (state IN ('pending', 'active', 'succeeded', 'failed')),
        message BYTEA NOT NULL,
        headers BYTEA NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT herald_events_topic_key UNIQUE (topic_id, idempotency_key)
    )
    "#,
    // Claim order: oldest eligible pending event first
    r#"
    CREATE INDEX IF NOT EXISTS idx_herald_events_pending
    ON herald_events (topic_id, id)
    WHERE state = 'pending'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_herald_events_active
    ON herald_events (topic_id, updated_at)
    WHERE state = 'active'
    "#,
];

impl Migration for CreateTopicsAndEvents {
    fn version(&self) -> i64 {
        1
    }

    fn name(&self) -> &'static str {
        "create_topics_and_events"
    }

    fn statements(&self) -> &'static [&'static str] {
        STATEMENTS
    }
}
