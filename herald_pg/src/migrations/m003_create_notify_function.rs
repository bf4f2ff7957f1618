//! Migration 003: notification trigger function.
//!
//! The function notifies the channel given as the trigger's first argument with
//! `{"id": <event id>, "topic": <topic id>}`. The trigger itself is installed by
//! `PgEventStore::setup_trigger` since the channel is chosen at runtime.

use super::Migration;

/// Creates the `herald_notify_event()` trigger function.
pub struct CreateNotifyFunction;

const STATEMENTS: &[&str] = &[r#"
    CREATE OR REPLACE FUNCTION herald_notify_event()
    RETURNS TRIGGER AS $$
    BEGIN
        PERFORM pg_notify(
            TG_ARGV[0],
            json_build_object('id', NEW.id, 'topic', NEW.topic_id)::text
        );
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#];

impl Migration for CreateNotifyFunction {
    fn version(&self) -> i64 {
        3
    }

    fn name(&self) -> &'static str {
        "create_notify_function"
    }

    fn statements(&self) -> &'static [&'static str] {
        STATEMENTS
    }
}
