//! Database migrations.

use crate::error::{FleetError, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 2;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| FleetError::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| FleetError::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    Ok(())
}

async fn exec(pool: &SqlitePool, sql: &str) -> Result<()> {
    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| FleetError::MigrationFailed { reason: e.to_string() })?;
    Ok(())
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    exec(pool, "DELETE FROM schema_version").await?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| FleetError::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}

/// VM records and their execution history.
#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS vms (
            oid INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            uid INTEGER NOT NULL,
            gid INTEGER NOT NULL,
            uname TEXT NOT NULL,
            gname TEXT NOT NULL,
            state INTEGER NOT NULL,
            lcm_state INTEGER NOT NULL,
            template TEXT NOT NULL,
            hostname TEXT,
            last_poll INTEGER NOT NULL DEFAULT 0,
            stime INTEGER NOT NULL,
            etime INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .await?;

    exec(pool, "CREATE INDEX IF NOT EXISTS idx_vms_state ON vms(state, lcm_state)").await?;

    // Bodies are JSON documents; stime/etime are duplicated for range scans
    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS history (
            vid INTEGER NOT NULL,
            seq INTEGER NOT NULL,
            stime INTEGER NOT NULL,
            etime INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (vid, seq)
        )
        "#,
    )
    .await?;

    exec(pool, "CREATE INDEX IF NOT EXISTS idx_history_times ON history(stime, etime)").await?;

    set_version(pool, 1).await?;

    info!("Migration to schema version 1 complete");
    Ok(())
}

/// Monitoring samples and the showback ledger.
#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS vm_monitoring (
            vmid INTEGER NOT NULL,
            last_poll INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (vmid, last_poll)
        )
        "#,
    )
    .await?;

    exec(
        pool,
        r#"
        CREATE TABLE IF NOT EXISTS vm_showback (
            vmid INTEGER NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (vmid, year, month)
        )
        "#,
    )
    .await?;

    set_version(pool, 2).await?;

    info!("Migration to schema version 2 complete");
    Ok(())
}
