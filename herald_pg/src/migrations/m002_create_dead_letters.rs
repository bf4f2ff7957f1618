//! Migration 002: dead letters.
//!
//! Dead letters are keyed by topic and idempotency key since keys are only unique within a
//! topic.

use super::Migration;

/// Creates `herald_dead_letters`.
pub struct CreateDeadLetters;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS herald_dead_letters (
        topic_id BIGINT NOT NULL REFERENCES herald_topics(id) ON DELETE CASCADE,
        idempotency_key TEXT NOT NULL,
        event_id BIGINT NOT NULL REFERENCES herald_events(id) ON DELETE CASCADE,
        error_message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (topic_id, idempotency_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_herald_dead_letters_created_at
    ON herald_dead_letters (created_at)
    "#,
];

impl Migration for CreateDeadLetters {
    fn version(&self) -> i64 {
        2
    }

    fn name(&self) -> &'static str {
        "create_dead_letters"
    }

    fn statements(&self) -> &'static [&'static str] {
        STATEMENTS
    }
}
