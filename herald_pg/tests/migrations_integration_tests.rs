mod common;

use herald_pg::migrations::{MigrationError, Migrator};
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_fresh_database_is_at_version_zero() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    assert_eq!(migrator.current_version().await.unwrap(), 0);
    assert_eq!(migrator.pending().await.unwrap().len(), 3);
    assert!(migrator.applied().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_run_applies_every_migration_once() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    assert_eq!(migrator.run().await.unwrap(), 3);
    assert_eq!(migrator.current_version().await.unwrap(), 3);
    assert!(migrator.pending().await.unwrap().is_empty());

    // Idempotent
    assert_eq!(migrator.run().await.unwrap(), 0);

    let applied = migrator.applied().await.unwrap();
    let names: Vec<&str> = applied.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "create_topics_and_events",
            "create_dead_letters",
            "create_notify_function"
        ]
    );

    let tables: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM information_schema.tables
        WHERE table_name IN ('herald_topics', 'herald_events', 'herald_dead_letters')
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tables, 3);
}

#[tokio::test]
#[serial]
async fn test_tampered_migration_is_detected() {
    let Some(pool) = common::get_pg_pool().await else {
        return;
    };
    common::teardown(&pool).await;

    let migrator = Migrator::new(pool.clone());
    migrator.run().await.unwrap();
    sqlx::query("UPDATE _herald_migrations SET checksum = 'tampered' WHERE version = 2")
        .execute(&pool)
        .await
        .unwrap();

    let result = migrator.run().await;
    assert!(matches!(
        result,
        Err(MigrationError::ChecksumMismatch { version: 2, .. })
    ));
}
