//! Embedded, forward-only schema migrations for herald_pg.
//!
//! Applied migrations are recorded in `_herald_migrations` together with a checksum, so a
//! migration that changed after being applied is reported instead of silently skipped.
//!
//! ```rust,ignore
//! use herald_pg::migrations::Migrator;
//!
//! let migrator = Migrator::new(pool.clone());
//! let applied = migrator.run().await?;
//! log::info!("Schema at version {} ({} applied)", migrator.current_version().await?, applied);
//! ```
//!
//! New migrations go in a new `mXXX_description.rs` file and at the end of [`MIGRATIONS`].

mod m001_create_topics_and_events;
mod m002_create_dead_letters;
mod m003_create_notify_function;

use m001_create_topics_and_events::CreateTopicsAndEvents;
use m002_create_dead_letters::CreateDeadLetters;
use m003_create_notify_function::CreateNotifyFunction;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;

/// All migrations, oldest first.
const MIGRATIONS: &[&dyn Migration] = &[
    &CreateTopicsAndEvents,
    &CreateDeadLetters,
    &CreateNotifyFunction,
];

/// Errors that can occur while migrating.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An applied migration no longer matches its definition.
    #[error("Migration {version} ({name}) checksum mismatch: expected {expected}, found {found}")]
    ChecksumMismatch {
        /// The version of the migration.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The checksum recorded in the database.
        expected: String,
        /// The checksum of the migration in code.
        found: String,
    },

    /// A migration failed to execute.
    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        /// The version of the migration.
        version: i64,
        /// The name of the migration.
        name: String,
        /// The underlying failure.
        reason: String,
    },
}

/// One schema change.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Unique, increasing version number.
    fn version(&self) -> i64;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    /// The statements this migration executes, in order.
    fn statements(&self) -> &'static [&'static str];

    /// Executes the migration inside the transaction owned by the [`Migrator`].
    async fn up<'a>(&self, tx: &mut Transaction<'a, Postgres>) -> Result<(), MigrationError> {
        for statement in self.statements() {
            sqlx::query(*statement).execute(&mut **tx).await?;
        }
        Ok(())
    }

    /// SHA-256 over the version, the name and every statement.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version().to_le_bytes());
        hasher.update(self.name().as_bytes());
        for statement in self.statements() {
            hasher.update(statement.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A migration recorded as applied.
#[derive(Debug, Clone)]
pub struct AppliedMigration {
    /// The version number of the migration.
    pub version: i64,
    /// The name of the migration.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: chrono::DateTime<chrono::Utc>,
    /// The checksum recorded when the migration was applied.
    pub checksum: String,
}

/// Applies the herald schema, one transaction per migration.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: PgPool,
}

impl Migrator {
    /// Creates a migrator for the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_tracking_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _herald_migrations (
                version BIGINT PRIMARY KEY,
                name VARCHAR(255) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                checksum VARCHAR(64) NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies every pending migration and returns how many were applied.
    ///
    /// A failing migration is rolled back; the ones before it stay committed.
    pub async fn run(&self) -> Result<usize, MigrationError> {
        let applied = self.applied().await?;
        for record in &applied {
            let Some(migration) = MIGRATIONS.iter().find(|m| m.version() == record.version)
            else {
                continue;
            };
            let found = migration.checksum();
            if found != record.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    version: record.version,
                    name: record.name.clone(),
                    expected: record.checksum.clone(),
                    found,
                });
            }
        }

        let applied: HashSet<i64> = applied.iter().map(|m| m.version).collect();
        let mut count = 0;
        for migration in MIGRATIONS {
            if applied.contains(&migration.version()) {
                continue;
            }

            log::info!(
                "Applying migration {} ({})",
                migration.version(),
                migration.name()
            );
            let mut tx = self.pool.begin().await?;
            migration.up(&mut tx).await.map_err(|e| match e {
                MigrationError::Database(db_err) => MigrationError::MigrationFailed {
                    version: migration.version(),
                    name: migration.name().to_string(),
                    reason: db_err.to_string(),
                },
                other => other,
            })?;

            sqlx::query("INSERT INTO _herald_migrations (version, name, checksum) VALUES ($1, $2, $3)")
                .bind(migration.version())
                .bind(migration.name())
                .bind(migration.checksum())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            count += 1;
        }

        if count > 0 {
            log::info!("Applied {} migrations", count);
        } else {
            log::debug!("Schema is up to date");
        }
        Ok(count)
    }

    /// The highest applied version, 0 on a fresh database.
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        self.ensure_tracking_table().await?;
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM _herald_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Migrations not applied yet.
    pub async fn pending(&self) -> Result<Vec<&'static dyn Migration>, MigrationError> {
        let applied: HashSet<i64> = self.applied().await?.iter().map(|m| m.version).collect();
        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied.contains(&m.version()))
            .copied()
            .collect())
    }

    /// Applied migrations, oldest first.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        self.ensure_tracking_table().await?;
        let rows = sqlx::query(
            "SELECT version, name, applied_at, checksum FROM _herald_migrations ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: row.get("applied_at"),
                checksum: row.get("checksum"),
            })
            .collect())
    }
}
