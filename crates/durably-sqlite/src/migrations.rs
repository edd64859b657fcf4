//! Manual migration runner. Each migration is a plain SQL file applied
//! inside its own transaction, with one row recorded into
//! `durably_schema_versions` per applied migration — the same
//! tracking-table shape the teacher's own migration runner used, adapted
//! from Postgres to SQLite.

use chrono::Utc;
use sqlx::SqlitePool;

use durably_core::DurablyError;

use crate::error::map_sqlx_error;

const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../migrations/0001_init.sql"))];

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DurablyError> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS durably_schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(map_sqlx_error)?;

    for (version, sql) in MIGRATIONS {
        let already_applied: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM durably_schema_versions WHERE version = ?")
                .bind(version)
                .fetch_optional(pool)
                .await
                .map_err(map_sqlx_error)?;
        if already_applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        sqlx::query("INSERT INTO durably_schema_versions (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        tracing::info!(version, "applied migration");
    }

    Ok(())
}
