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
        name: "profiles_and_contexts",
        sql: r#"
            CREATE TABLE IF NOT EXISTS user_profiles (
                user_id INTEGER PRIMARY KEY,
                display_name TEXT NOT NULL,
                username TEXT,
                full_name TEXT,
                age INTEGER,
                phone TEXT,
                has_children INTEGER,
                children_study_quran INTEGER,
                reading_level TEXT,
                consent_given INTEGER NOT NULL DEFAULT 0,
                school_channel_subscribed INTEGER NOT NULL DEFAULT 0,
                course_channel_subscribed INTEGER NOT NULL DEFAULT 0,
                registration_completed INTEGER NOT NULL DEFAULT 0,
                registered_at TEXT,
                referrer_id INTEGER NOT NULL DEFAULT 0,
                referral_status TEXT NOT NULL DEFAULT 'not_applicable',
                referral_points INTEGER NOT NULL DEFAULT 0 CHECK (referral_points >= 0),
                referral_counted_at TEXT,
                referral_link TEXT CHECK (referral_link IS NULL OR length(referral_link) <= 512),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((referral_status IN ('pending', 'counted')) = (referrer_id > 0))
            );
            CREATE INDEX IF NOT EXISTS idx_user_profiles_referral
                ON user_profiles(referral_status, registration_completed);
            CREATE INDEX IF NOT EXISTS idx_user_profiles_username
                ON user_profiles(lower(username));

            CREATE TABLE IF NOT EXISTS conversation_contexts (
                user_id INTEGER PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'idle',
                track TEXT NOT NULL DEFAULT 'normal',
                display_name TEXT NOT NULL DEFAULT '',
                username TEXT,
                full_name TEXT,
                age INTEGER,
                phone TEXT,
                has_children INTEGER,
                children_study_quran INTEGER,
                reading_level TEXT,
                consent_given INTEGER NOT NULL DEFAULT 0,
                school_channel_subscribed INTEGER NOT NULL DEFAULT 0,
                referrer_id INTEGER NOT NULL DEFAULT 0,
                referral_source TEXT,
                referral_entered_at TEXT,
                pending_tags TEXT NOT NULL DEFAULT '[]',
                epilogue_due_at TEXT,
                epilogue_sent INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_contexts_epilogue_due
                ON conversation_contexts(epilogue_sent, epilogue_due_at);
        "#,
    },
    Migration {
        version: 2,
        name: "referral_ledger_and_tags",
        sql: r#"
            CREATE TABLE IF NOT EXISTS referral_usages (
                event_id TEXT PRIMARY KEY,
                referral_link TEXT NOT NULL,
                referrer_id INTEGER NOT NULL,
                invitee_id INTEGER NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                already_counted INTEGER NOT NULL DEFAULT 0,
                counted_at TEXT,
                trigger_source TEXT NOT NULL,
                triggered_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (referrer_id, invitee_id),
                CHECK (referrer_id <> invitee_id)
            );
            CREATE INDEX IF NOT EXISTS idx_referral_usages_invitee
                ON referral_usages(invitee_id);

            CREATE TABLE IF NOT EXISTS user_tags (
                user_id INTEGER NOT NULL,
                tag TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, tag)
            );
        "#,
    },
    Migration {
        version: 3,
        name: "notification_admins",
        sql: r#"
            CREATE TABLE IF NOT EXISTS notification_admins (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                user_id INTEGER CHECK (user_id IS NULL OR user_id > 0),
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

/// Apply all pending migrations.
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

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
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

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
