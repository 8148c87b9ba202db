//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "leads_and_campaigns",
        sql: r#"
            CREATE TABLE IF NOT EXISTS leads (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                email TEXT NOT NULL,
                email_key TEXT NOT NULL,
                name TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'General',
                status TEXT NOT NULL DEFAULT 'new',
                score INTEGER NOT NULL DEFAULT 50,
                attributes TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (tenant_id, email_key)
            );
            CREATE INDEX IF NOT EXISTS idx_leads_tenant ON leads(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_leads_category ON leads(tenant_id, category);

            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                selector TEXT NOT NULL,
                settings TEXT NOT NULL DEFAULT '{}',
                profile_id TEXT,
                dry_run INTEGER NOT NULL DEFAULT 0,
                send_at TEXT,
                status TEXT NOT NULL DEFAULT 'draft',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_tenant ON campaigns(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_campaigns_due ON campaigns(status, send_at);
        "#,
    },
    Migration {
        version: 2,
        name: "send_tracking",
        sql: r#"
            CREATE TABLE IF NOT EXISTS send_attempts (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                lead_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                attempted_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                error_class TEXT,
                error_message TEXT,
                provider_message_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_send_attempts_campaign ON send_attempts(campaign_id);
            CREATE INDEX IF NOT EXISTS idx_send_attempts_lead ON send_attempts(campaign_id, lead_id);

            CREATE TABLE IF NOT EXISTS recipient_outcomes (
                campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
                lead_id TEXT NOT NULL,
                email TEXT NOT NULL,
                outcome TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                error_class TEXT,
                detail TEXT,
                provider_message_id TEXT,
                tracking_token TEXT,
                completed_at TEXT NOT NULL,
                opened_at TEXT,
                clicked_at TEXT,
                click_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (campaign_id, lead_id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_outcomes_token
                ON recipient_outcomes(tracking_token) WHERE tracking_token IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_outcomes_outcome ON recipient_outcomes(campaign_id, outcome);
        "#,
    },
    Migration {
        version: 3,
        name: "suppressions",
        sql: r#"
            CREATE TABLE IF NOT EXISTS suppressions (
                tenant_id TEXT NOT NULL,
                pattern TEXT NOT NULL,
                reason TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, pattern)
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                libsql::params![name],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        row.get::<i64>(0).unwrap() == 1
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in [
            "leads",
            "campaigns",
            "send_attempts",
            "recipient_outcomes",
            "suppressions",
        ] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
        assert_eq!(get_current_version(&conn).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();
        assert_eq!(get_current_version(&conn).await.unwrap(), 3);
    }
}
