#![allow(dead_code)]

use herald_pg::Migrator;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

/// Connects to `DATABASE_URL`. Returns `None` when it is not set so the tests can be skipped.
pub async fn get_pg_pool() -> Option<PgPool> {
    let _ = env_logger::builder().is_test(true).try_init();
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        log::warn!("DATABASE_URL is not set, skipping postgres test");
        return None;
    };
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database_url)
        .await
        .expect("Failed to create Postgres pool");
    Some(pool)
}

/// Drops every herald object.
pub async fn teardown(pool: &PgPool) {
    for statement in [
        "DROP TABLE IF EXISTS herald_dead_letters CASCADE",
        "DROP TABLE IF EXISTS herald_events CASCADE",
        "DROP TABLE IF EXISTS herald_topics CASCADE",
        "DROP TABLE IF EXISTS _herald_migrations CASCADE",
        "DROP FUNCTION IF EXISTS herald_notify_event CASCADE",
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .expect("Failed to drop herald objects");
    }
}

/// Connects and recreates the schema from scratch.
pub async fn fresh_pool() -> Option<PgPool> {
    let pool = get_pg_pool().await?;
    teardown(&pool).await;
    Migrator::new(pool.clone())
        .run()
        .await
        .expect("Failed to run migrations");
    Some(pool)
}
