//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! On first run against a legacy DB (an `accounts` table from before stage
//! tracking, no `_migrations` table), it adds the missing columns and seeds
//! V1 without re-creating tables; V2 then infers each legacy row's stage.

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
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL COLLATE NOCASE UNIQUE,
                handle TEXT NOT NULL COLLATE NOCASE UNIQUE,
                phone TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                stage TEXT NOT NULL DEFAULT 'payment',
                has_agreed_to_terms INTEGER NOT NULL DEFAULT 0,
                has_completed_payment INTEGER NOT NULL DEFAULT 0,
                profile_completed INTEGER NOT NULL DEFAULT 0,
                is_admin INTEGER NOT NULL DEFAULT 0,
                customer_id TEXT,
                subscription_id TEXT,
                subscription_status TEXT,
                payment_reference TEXT,
                full_name TEXT,
                company TEXT,
                industry TEXT,
                title TEXT,
                location TEXT,
                bio TEXT,
                linkedin_url TEXT,
                twitter_url TEXT,
                website_url TEXT,
                do_follow INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_stage ON accounts(stage);
            CREATE INDEX IF NOT EXISTS idx_accounts_created ON accounts(created_at);

            CREATE TABLE IF NOT EXISTS signup_status (
                account_id TEXT PRIMARY KEY REFERENCES accounts(id),
                status TEXT NOT NULL DEFAULT 'started',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signup_status_status ON signup_status(status);
        "#,
    },
    Migration {
        version: 2,
        name: "infer_legacy_stages",
        sql: r#"
            UPDATE accounts SET stage = CASE
                WHEN has_completed_payment = 1 AND profile_completed = 1 THEN 'ready'
                WHEN has_completed_payment = 1 THEN 'profile'
                ELSE 'payment'
            END
            WHERE stage IS NULL OR stage NOT IN ('started', 'payment', 'profile', 'ready');

            INSERT INTO signup_status (account_id, status, created_at, updated_at)
            SELECT id,
                   CASE stage WHEN 'ready' THEN 'completed' ELSE stage END,
                   created_at,
                   updated_at
            FROM accounts
            WHERE NOT EXISTS (
                SELECT 1 FROM signup_status WHERE signup_status.account_id = accounts.id
            );
        "#,
    },
];

/// Columns a pre-tracking `accounts` table may lack, added idempotently.
const LEGACY_COLUMNS: &[&str] = &[
    "stage TEXT NOT NULL DEFAULT 'legacy'",
    "has_agreed_to_terms INTEGER NOT NULL DEFAULT 0",
    "has_completed_payment INTEGER NOT NULL DEFAULT 0",
    "profile_completed INTEGER NOT NULL DEFAULT 0",
    "is_admin INTEGER NOT NULL DEFAULT 0",
    "customer_id TEXT",
    "subscription_id TEXT",
    "subscription_status TEXT",
    "payment_reference TEXT",
    "full_name TEXT",
    "company TEXT",
    "industry TEXT",
    "title TEXT",
    "location TEXT",
    "bio TEXT",
    "linkedin_url TEXT",
    "twitter_url TEXT",
    "website_url TEXT",
    "do_follow INTEGER NOT NULL DEFAULT 0",
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

    let mut current_version = get_current_version(conn).await?;

    if current_version == 0 && legacy_tables_exist(conn).await? {
        // Legacy DB: bring the accounts table up to the V1 shape in place.
        for column in LEGACY_COLUMNS {
            // Fails harmlessly when the column already exists
            let _ = conn
                .execute(&format!("ALTER TABLE accounts ADD COLUMN {column}"), ())
                .await;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signup_status (
                account_id TEXT PRIMARY KEY REFERENCES accounts(id),
                status TEXT NOT NULL DEFAULT 'started',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signup_status_status ON signup_status(status);
            CREATE INDEX IF NOT EXISTS idx_accounts_stage ON accounts(stage);
            CREATE INDEX IF NOT EXISTS idx_accounts_created ON accounts(created_at);",
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!("Failed to create signup tables on legacy DB: {e}"))
        })?;

        seed_version(conn, 1, "initial_schema").await?;
        current_version = 1;
        tracing::info!("Legacy database detected — seeded migration V1");
    }

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

    let version = get_current_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
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
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Check if a pre-tracking `accounts` table already exists.
async fn legacy_tables_exist(conn: &Connection) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='accounts'",
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check legacy tables: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read legacy check: {e}")))?;

    match row {
        Some(row) => {
            let count: i64 = row.get(0).unwrap_or(0);
            Ok(count > 0)
        }
        None => Ok(false),
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
