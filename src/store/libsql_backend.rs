//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Row-level exclusive locks are
//! emulated with an in-process keyed mutex, which is sound because the bot is
//! the only writer of its database file.

use std::collections::BTreeSet;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::model::{ChildrenStats, ConversationContext, NotificationAdmin, ReferralUsage, UserProfile};
use crate::store::lock::KeyedMutex;
use crate::store::migrations;
use crate::store::traits::{Database, ProfileLock};

const PROFILE_COLUMNS: &str = "user_id, display_name, username, full_name, age, phone, \
    has_children, children_study_quran, reading_level, consent_given, \
    school_channel_subscribed, course_channel_subscribed, registration_completed, \
    registered_at, referrer_id, referral_status, referral_points, referral_counted_at, \
    referral_link, created_at, updated_at";

const CONTEXT_COLUMNS: &str = "user_id, state, track, display_name, username, full_name, age, \
    phone, has_children, children_study_quran, reading_level, consent_given, \
    school_channel_subscribed, referrer_id, referral_source, referral_entered_at, \
    pending_tags, epilogue_due_at, epilogue_sent, updated_at";

const ADMIN_COLUMNS: &str = "id, username, user_id, is_active, created_at, updated_at";

const USAGE_COLUMNS: &str = "event_id, referral_link, referrer_id, invitee_id, idempotency_key, \
    already_counted, counted_at, trigger_source, triggered_at, created_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Every
/// statement runs under `conn_lock`, so an open transaction never picks up
/// (or rolls back) another caller's writes.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    profile_locks: KeyedMutex,
    conn_lock: tokio::sync::Mutex<()>,
}

/// Exclusive use of the shared connection until dropped.
struct ConnGuard<'a> {
    conn: &'a Connection,
    _serial: tokio::sync::MutexGuard<'a, ()>,
}

impl Deref for ConnGuard<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            profile_locks: KeyedMutex::new(),
            conn_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn conn(&self) -> ConnGuard<'_> {
        ConnGuard {
            _serial: self.conn_lock.lock().await,
            conn: &self.conn,
        }
    }

    async fn query_usage(
        &self,
        filter: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<ReferralUsage>, DatabaseError> {
        let sql = format!("SELECT {USAGE_COLUMNS} FROM referral_usages WHERE {filter} LIMIT 1");
        let conn = self.conn().await;
        let mut rows = conn
            .query(&sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("find_usage: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_usage(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("referral usage row: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_usage: {e}"))),
        }
    }

    async fn query_profiles(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<UserProfile>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("query_profiles: {e}")))?;

        let mut profiles = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            profiles.push(
                row_to_profile(&row)
                    .map_err(|e| DatabaseError::Serialization(format!("profile row: {e}")))?,
            );
        }
        Ok(profiles)
    }

    async fn query_contexts(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ConversationContext>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("query_contexts: {e}")))?;

        let mut contexts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            contexts.push(
                row_to_context(&row)
                    .map_err(|e| DatabaseError::Serialization(format!("context row: {e}")))?,
            );
        }
        Ok(contexts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text comparison orders
/// timestamps correctly.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn text_or_null(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn int_or_null(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn bool_or_null(v: Option<bool>) -> libsql::Value {
    int_or_null(v.map(i64::from))
}

fn ts_or_null(v: Option<&DateTime<Utc>>) -> libsql::Value {
    match v {
        Some(dt) => libsql::Value::Text(fmt_ts(dt)),
        None => libsql::Value::Null,
    }
}

fn read_opt_bool(row: &libsql::Row, idx: i32) -> Option<bool> {
    row.get::<i64>(idx).ok().map(|v| v != 0)
}

fn read_bool(row: &libsql::Row, idx: i32) -> bool {
    read_opt_bool(row, idx).unwrap_or(false)
}

fn read_opt_age(row: &libsql::Row, idx: i32) -> Option<u32> {
    row.get::<i64>(idx)
        .ok()
        .and_then(|v| u32::try_from(v).ok())
}

/// Normalize a username for lookups: trimmed, no `@`, lowercase.
fn normalize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_lowercase()
}

fn map_write_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint") || msg.contains("CHECK constraint") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

/// Statements of a referral credit, run inside the caller's transaction.
async fn apply_referral_credit(
    tx: &libsql::Transaction,
    usage: &ReferralUsage,
    now: &str,
    counted_at: &str,
) -> Result<i64, DatabaseError> {
    let sql = format!(
        "INSERT INTO referral_usages ({USAGE_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
    );
    tx.execute(
        &sql,
        params![
            usage.event_id.to_string(),
            usage.referral_link.as_str(),
            usage.referrer_id,
            usage.invitee_id,
            usage.idempotency_key.as_str(),
            i64::from(usage.already_counted),
            counted_at,
            usage.trigger_source.as_str(),
            fmt_ts(&usage.triggered_at),
            fmt_ts(&usage.created_at),
        ],
    )
    .await
    .map_err(|e| map_write_err("record_referral_credit insert", e))?;

    let bumped = tx
        .execute(
            "UPDATE user_profiles SET referral_points = referral_points + 1, updated_at = ?2
             WHERE user_id = ?1",
            params![usage.referrer_id, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_referral_credit points: {e}")))?;
    if bumped == 0 {
        return Err(DatabaseError::NotFound {
            entity: "user_profile".into(),
            id: usage.referrer_id.to_string(),
        });
    }

    tx.execute(
        "UPDATE user_profiles
         SET referral_status = 'counted',
             referral_counted_at = COALESCE(referral_counted_at, ?2),
             updated_at = ?3
         WHERE user_id = ?1 AND referrer_id > 0",
        params![usage.invitee_id, counted_at, now],
    )
    .await
    .map_err(|e| map_write_err("record_referral_credit invitee", e))?;

    let mut rows = tx
        .query(
            "SELECT referral_points FROM user_profiles WHERE user_id = ?1",
            params![usage.referrer_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_referral_credit read: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!(
            "record_referral_credit read: {e}"
        ))),
    }
}

/// Column order matches PROFILE_COLUMNS.
fn row_to_profile(row: &libsql::Row) -> Result<UserProfile, libsql::Error> {
    let status: String = row.get(15)?;
    let created: String = row.get(19)?;
    let updated: String = row.get(20)?;
    Ok(UserProfile {
        user_id: row.get(0)?,
        display_name: row.get::<String>(1).unwrap_or_default(),
        username: row.get(2).ok(),
        full_name: row.get(3).ok(),
        age: read_opt_age(row, 4),
        phone: row.get(5).ok(),
        has_children: read_opt_bool(row, 6),
        children_study_quran: read_opt_bool(row, 7),
        reading_level: row
            .get::<String>(8)
            .ok()
            .and_then(|s| s.parse().ok()),
        consent_given: read_bool(row, 9),
        school_channel_subscribed: read_bool(row, 10),
        course_channel_subscribed: read_bool(row, 11),
        registration_completed: read_bool(row, 12),
        registered_at: parse_optional_datetime(row.get(13).ok()),
        referrer_id: row.get::<i64>(14).unwrap_or(0),
        referral_status: status.parse().unwrap_or_default(),
        referral_points: row.get::<i64>(16).unwrap_or(0),
        referral_counted_at: parse_optional_datetime(row.get(17).ok()),
        referral_link: row.get(18).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Column order matches CONTEXT_COLUMNS.
fn row_to_context(row: &libsql::Row) -> Result<ConversationContext, libsql::Error> {
    let state: String = row.get(1)?;
    let track: String = row.get(2)?;
    let tags: String = row.get::<String>(16).unwrap_or_else(|_| "[]".to_string());
    let updated: String = row.get(19)?;
    Ok(ConversationContext {
        user_id: row.get(0)?,
        state: state.parse().unwrap_or_default(),
        track: track.parse().unwrap_or_default(),
        display_name: row.get::<String>(3).unwrap_or_default(),
        username: row.get(4).ok(),
        full_name: row.get(5).ok(),
        age: read_opt_age(row, 6),
        phone: row.get(7).ok(),
        has_children: read_opt_bool(row, 8),
        children_study_quran: read_opt_bool(row, 9),
        reading_level: row
            .get::<String>(10)
            .ok()
            .and_then(|s| s.parse().ok()),
        consent_given: read_bool(row, 11),
        school_channel_subscribed: read_bool(row, 12),
        referrer_id: row.get::<i64>(13).unwrap_or(0),
        referral_source: row.get(14).ok(),
        referral_entered_at: parse_optional_datetime(row.get(15).ok()),
        pending_tags: serde_json::from_str(&tags).unwrap_or_default(),
        epilogue_due_at: parse_optional_datetime(row.get(17).ok()),
        epilogue_sent: read_bool(row, 18),
        updated_at: parse_datetime(&updated),
    })
}

/// Column order matches USAGE_COLUMNS.
fn row_to_usage(row: &libsql::Row) -> Result<ReferralUsage, libsql::Error> {
    let event_id: String = row.get(0)?;
    let triggered: String = row.get(8)?;
    let created: String = row.get(9)?;
    Ok(ReferralUsage {
        event_id: Uuid::parse_str(&event_id).unwrap_or_else(|_| Uuid::nil()),
        referral_link: row.get::<String>(1).unwrap_or_default(),
        referrer_id: row.get(2)?,
        invitee_id: row.get(3)?,
        idempotency_key: row.get(4)?,
        already_counted: read_bool(row, 5),
        counted_at: parse_optional_datetime(row.get(6).ok()),
        trigger_source: row.get::<String>(7).unwrap_or_default(),
        triggered_at: parse_datetime(&triggered),
        created_at: parse_datetime(&created),
    })
}

/// Column order matches ADMIN_COLUMNS.
fn row_to_admin(row: &libsql::Row) -> Result<NotificationAdmin, libsql::Error> {
    let created: String = row.get(4)?;
    let updated: String = row.get(5)?;
    Ok(NotificationAdmin {
        id: row.get(0)?,
        username: row.get(1)?,
        user_id: row.get::<i64>(2).ok().filter(|id| *id > 0),
        active: read_bool(row, 3),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&*self.conn().await).await
    }

    // ── Conversation contexts ───────────────────────────────────────

    async fn get_context(&self, user_id: i64) -> Result<Option<ConversationContext>, DatabaseError> {
        let sql = format!("SELECT {CONTEXT_COLUMNS} FROM conversation_contexts WHERE user_id = ?1");
        Ok(self
            .query_contexts(&sql, params![user_id])
            .await?
            .into_iter()
            .next())
    }

    async fn upsert_context(&self, ctx: &ConversationContext) -> Result<(), DatabaseError> {
        let tags = serde_json::to_string(&ctx.pending_tags)
            .map_err(|e| DatabaseError::Serialization(format!("pending_tags: {e}")))?;
        let sql = format!(
            "INSERT OR REPLACE INTO conversation_contexts ({CONTEXT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        );
        let conn = self.conn().await;
        conn
            .execute(
                &sql,
                params![
                    ctx.user_id,
                    ctx.state.as_str(),
                    ctx.track.as_str(),
                    ctx.display_name.as_str(),
                    text_or_null(ctx.username.as_deref()),
                    text_or_null(ctx.full_name.as_deref()),
                    int_or_null(ctx.age.map(i64::from)),
                    text_or_null(ctx.phone.as_deref()),
                    bool_or_null(ctx.has_children),
                    bool_or_null(ctx.children_study_quran),
                    text_or_null(ctx.reading_level.as_ref().map(|l| l.as_str())),
                    i64::from(ctx.consent_given),
                    i64::from(ctx.school_channel_subscribed),
                    ctx.referrer_id,
                    text_or_null(ctx.referral_source.as_deref()),
                    ts_or_null(ctx.referral_entered_at.as_ref()),
                    tags,
                    ts_or_null(ctx.epilogue_due_at.as_ref()),
                    i64::from(ctx.epilogue_sent),
                    fmt_ts(&ctx.updated_at),
                ],
            )
            .await
            .map_err(|e| map_write_err("upsert_context", e))?;
        debug!(user_id = ctx.user_id, state = %ctx.state, "Context saved");
        Ok(())
    }

    async fn delete_context(&self, user_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let n = conn
            .execute(
                "DELETE FROM conversation_contexts WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_context: {e}")))?;
        Ok(n > 0)
    }

    async fn list_due_contexts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationContext>, DatabaseError> {
        let sql = format!(
            "SELECT {CONTEXT_COLUMNS} FROM conversation_contexts
             WHERE epilogue_sent = 0 AND epilogue_due_at IS NOT NULL AND epilogue_due_at <= ?1
             ORDER BY epilogue_due_at ASC"
        );
        self.query_contexts(&sql, params![fmt_ts(&now)]).await
    }

    async fn find_user_ids_by_usernames(
        &self,
        usernames: &[String],
    ) -> Result<Vec<i64>, DatabaseError> {
        let mut ids = BTreeSet::new();
        for username in usernames.iter().map(|u| normalize_username(u)) {
            if username.is_empty() {
                continue;
            }
            let conn = self.conn().await;
            let mut rows = conn
                .query(
                    "SELECT user_id FROM user_profiles WHERE lower(username) = ?1
                     UNION
                     SELECT user_id FROM conversation_contexts WHERE lower(username) = ?1",
                    params![username],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("find_user_ids_by_usernames: {e}")))?;
            while let Ok(Some(row)) = rows.next().await {
                if let Ok(id) = row.get::<i64>(0) {
                    ids.insert(id);
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user_id: i64) -> Result<Option<UserProfile>, DatabaseError> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM user_profiles WHERE user_id = ?1");
        Ok(self
            .query_profiles(&sql, params![user_id])
            .await?
            .into_iter()
            .next())
    }

    async fn upsert_profile(&self, p: &UserProfile) -> Result<(), DatabaseError> {
        let sql = format!(
            "INSERT INTO user_profiles ({PROFILE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
             ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                username = excluded.username,
                full_name = excluded.full_name,
                age = excluded.age,
                phone = excluded.phone,
                has_children = excluded.has_children,
                children_study_quran = excluded.children_study_quran,
                reading_level = excluded.reading_level,
                consent_given = excluded.consent_given,
                school_channel_subscribed = excluded.school_channel_subscribed,
                course_channel_subscribed = MAX(user_profiles.course_channel_subscribed, excluded.course_channel_subscribed),
                registration_completed = excluded.registration_completed,
                registered_at = COALESCE(user_profiles.registered_at, excluded.registered_at),
                referrer_id = excluded.referrer_id,
                referral_status = excluded.referral_status,
                referral_link = COALESCE(excluded.referral_link, user_profiles.referral_link),
                updated_at = excluded.updated_at"
        );
        let conn = self.conn().await;
        conn
            .execute(
                &sql,
                params![
                    p.user_id,
                    p.display_name.as_str(),
                    text_or_null(p.username.as_deref()),
                    text_or_null(p.full_name.as_deref()),
                    int_or_null(p.age.map(i64::from)),
                    text_or_null(p.phone.as_deref()),
                    bool_or_null(p.has_children),
                    bool_or_null(p.children_study_quran),
                    text_or_null(p.reading_level.as_ref().map(|l| l.as_str())),
                    i64::from(p.consent_given),
                    i64::from(p.school_channel_subscribed),
                    i64::from(p.course_channel_subscribed),
                    i64::from(p.registration_completed),
                    ts_or_null(p.registered_at.as_ref()),
                    p.referrer_id,
                    p.referral_status.as_str(),
                    p.referral_points,
                    ts_or_null(p.referral_counted_at.as_ref()),
                    text_or_null(p.referral_link.as_deref()),
                    fmt_ts(&p.created_at),
                    fmt_ts(&Utc::now()),
                ],
            )
            .await
            .map_err(|e| map_write_err("upsert_profile", e))?;
        debug!(user_id = p.user_id, status = %p.referral_status, "Profile saved");
        Ok(())
    }

    async fn lock_profile_for_update(&self, user_id: i64) -> Result<ProfileLock, DatabaseError> {
        let guard = self.profile_locks.lock(user_id).await;
        let profile = self.get_profile(user_id).await?;
        Ok(ProfileLock::new(profile, guard))
    }

    async fn set_course_subscribed(&self, user_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let n = conn
            .execute(
                "UPDATE user_profiles SET course_channel_subscribed = 1, updated_at = ?2
                 WHERE user_id = ?1 AND course_channel_subscribed = 0",
                params![user_id, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_course_subscribed: {e}")))?;
        Ok(n > 0)
    }

    async fn mark_referral_counted(
        &self,
        user_id: i64,
        counted_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        conn
            .execute(
                "UPDATE user_profiles
                 SET referral_status = 'counted',
                     referral_counted_at = COALESCE(referral_counted_at, ?2),
                     updated_at = ?3
                 WHERE user_id = ?1 AND referrer_id > 0",
                params![user_id, fmt_ts(&counted_at), fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| map_write_err("mark_referral_counted", e))?;
        Ok(())
    }

    async fn set_referral_link(&self, user_id: i64, link: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let n = conn
            .execute(
                "UPDATE user_profiles SET referral_link = ?2, updated_at = ?3 WHERE user_id = ?1",
                params![user_id, link, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| map_write_err("set_referral_link", e))?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "user_profile".into(),
                id: user_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_pending_referrals(&self) -> Result<Vec<UserProfile>, DatabaseError> {
        let sql = format!(
            "SELECT {PROFILE_COLUMNS} FROM user_profiles
             WHERE referral_status = 'pending' AND referrer_id > 0 AND registration_completed = 1
             ORDER BY updated_at ASC"
        );
        self.query_profiles(&sql, ()).await
    }

    async fn children_stats(&self) -> Result<ChildrenStats, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(has_children = 1), 0),
                        COALESCE(SUM(has_children = 1 AND children_study_quran = 1), 0),
                        COALESCE(SUM(has_children = 1 AND children_study_quran = 0), 0)
                 FROM user_profiles",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("children_stats: {e}")))?;
        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(ChildrenStats::default()),
            Err(e) => return Err(DatabaseError::Query(format!("children_stats: {e}"))),
        };

        let count = |idx: i32| row.get::<i64>(idx).unwrap_or(0);
        let (total, with_children, study_yes, study_no) = (count(0), count(1), count(2), count(3));
        Ok(ChildrenStats {
            total_users: total,
            users_with_children: with_children,
            users_without_children: total - with_children,
            users_with_children_study_quran_true: study_yes,
            users_with_children_study_quran_false: study_no,
            users_with_children_study_quran_unknown: with_children - study_yes - study_no,
        })
    }

    // ── Referral ledger ─────────────────────────────────────────────

    async fn find_usage_by_key(&self, key: &str) -> Result<Option<ReferralUsage>, DatabaseError> {
        self.query_usage("idempotency_key = ?1", params![key]).await
    }

    async fn find_usage_by_pair(
        &self,
        referrer_id: i64,
        invitee_id: i64,
    ) -> Result<Option<ReferralUsage>, DatabaseError> {
        self.query_usage(
            "referrer_id = ?1 AND invitee_id = ?2",
            params![referrer_id, invitee_id],
        )
        .await
    }

    async fn usage_exists_for_invitee(&self, invitee_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM referral_usages WHERE invitee_id = ?1 LIMIT 1",
                params![invitee_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("usage_exists_for_invitee: {e}")))?;
        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("usage_exists_for_invitee: {e}"))),
        }
    }

    async fn record_referral_credit(&self, usage: &ReferralUsage) -> Result<i64, DatabaseError> {
        let now = fmt_ts(&Utc::now());
        let counted_at = fmt_ts(&usage.counted_at.unwrap_or_else(Utc::now));

        let conn = self.conn().await;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("record_referral_credit begin: {e}")))?;

        let result = apply_referral_credit(&tx, usage, &now, &counted_at).await;

        match result {
            Ok(points) => {
                tx.commit().await.map_err(|e| {
                    DatabaseError::Query(format!("record_referral_credit commit: {e}"))
                })?;
                Ok(points)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback of referral credit failed");
                }
                Err(e)
            }
        }
    }

    // ── Tags ────────────────────────────────────────────────────────

    async fn tag_exists(&self, user_id: i64, tag: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT 1 FROM user_tags WHERE user_id = ?1 AND tag = ?2 LIMIT 1",
                params![user_id, tag],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("tag_exists: {e}")))?;
        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("tag_exists: {e}"))),
        }
    }

    async fn insert_tag(&self, user_id: i64, tag: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO user_tags (user_id, tag, created_at) VALUES (?1, ?2, ?3)",
                params![user_id, tag, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_tag: {e}")))?;
        Ok(n > 0)
    }

    async fn list_tags(&self, user_id: i64) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                "SELECT tag FROM user_tags WHERE user_id = ?1 ORDER BY rowid",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tags: {e}")))?;
        let mut tags = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(tag) = row.get::<String>(0) {
                tags.push(tag);
            }
        }
        Ok(tags)
    }

    // ── Notification admins ─────────────────────────────────────────

    async fn add_notification_admin(
        &self,
        username: &str,
    ) -> Result<NotificationAdmin, DatabaseError> {
        let username = normalize_username(username);
        if username.is_empty() {
            return Err(DatabaseError::Constraint(
                "notification admin username is empty".into(),
            ));
        }
        let now = fmt_ts(&Utc::now());
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO notification_admins (username, is_active, created_at, updated_at)
             VALUES (?1, 1, ?2, ?2)
             ON CONFLICT(username) DO UPDATE SET is_active = 1, updated_at = excluded.updated_at",
            params![username.as_str(), now],
        )
        .await
        .map_err(|e| map_write_err("add_notification_admin", e))?;

        let sql = format!("SELECT {ADMIN_COLUMNS} FROM notification_admins WHERE username = ?1");
        let mut rows = conn
            .query(&sql, params![username.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("add_notification_admin: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row_to_admin(&row)
                .map_err(|e| DatabaseError::Serialization(format!("notification admin row: {e}"))),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "notification_admin".into(),
                id: username,
            }),
            Err(e) => Err(DatabaseError::Query(format!("add_notification_admin: {e}"))),
        }
    }

    async fn set_notification_admin_active(
        &self,
        username: &str,
        active: bool,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await;
        let n = conn
            .execute(
                "UPDATE notification_admins SET is_active = ?2, updated_at = ?3 WHERE username = ?1",
                params![
                    normalize_username(username),
                    i64::from(active),
                    fmt_ts(&Utc::now())
                ],
            )
            .await
            .map_err(|e| map_write_err("set_notification_admin_active", e))?;
        Ok(n > 0)
    }

    async fn list_active_notification_admins(
        &self,
    ) -> Result<Vec<NotificationAdmin>, DatabaseError> {
        let sql = format!(
            "SELECT {ADMIN_COLUMNS} FROM notification_admins WHERE is_active = 1 ORDER BY id"
        );
        let conn = self.conn().await;
        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_notification_admins: {e}")))?;
        let mut admins = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            admins.push(
                row_to_admin(&row).map_err(|e| {
                    DatabaseError::Serialization(format!("notification admin row: {e}"))
                })?,
            );
        }
        Ok(admins)
    }

    async fn bind_notification_admin(&self, id: i64, user_id: i64) -> Result<(), DatabaseError> {
        let conn = self.conn().await;
        let n = conn
            .execute(
                "UPDATE notification_admins SET user_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, user_id, fmt_ts(&Utc::now())],
            )
            .await
            .map_err(|e| map_write_err("bind_notification_admin", e))?;
        if n == 0 {
            return Err(DatabaseError::NotFound {
                entity: "notification_admin".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::flow::state::{FlowState, Track};
    use crate::model::{ReadingLevel, ReferralStatus};

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn registered(user_id: i64) -> UserProfile {
        let mut p = UserProfile::new(user_id, "Ali");
        p.username = Some("ali_k".into());
        p.full_name = Some("Ali".into());
        p.age = Some(22);
        p.phone = Some("+70000000000".into());
        p.has_children = Some(false);
        p.reading_level = Some(ReadingLevel::KnowBasics);
        p.consent_given = true;
        p.school_channel_subscribed = true;
        p.registration_completed = true;
        p.registered_at = Some(Utc::now());
        p
    }

    fn usage(referrer: i64, invitee: i64) -> ReferralUsage {
        let now = Utc::now();
        ReferralUsage {
            event_id: Uuid::new_v4(),
            referral_link: format!("https://t.me/bot?start={referrer}"),
            referrer_id: referrer,
            invitee_id: invitee,
            idempotency_key: format!("ref:{referrer}:{invitee}"),
            already_counted: true,
            counted_at: Some(now),
            trigger_source: "test".into(),
            triggered_at: now,
            created_at: now,
        }
    }

    // ── Profiles ────────────────────────────────────────────────────

    #[tokio::test]
    async fn profile_round_trip() {
        let db = test_db().await;
        let profile = registered(1);
        db.upsert_profile(&profile).await.unwrap();

        let fetched = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(fetched.full_name.as_deref(), Some("Ali"));
        assert_eq!(fetched.age, Some(22));
        assert_eq!(fetched.has_children, Some(false));
        assert_eq!(fetched.children_study_quran, None);
        assert_eq!(fetched.reading_level, Some(ReadingLevel::KnowBasics));
        assert!(fetched.registration_completed);
        assert_eq!(fetched.referral_status, ReferralStatus::NotApplicable);

        assert!(db.get_profile(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_never_clears_course_flag_or_points() {
        let db = test_db().await;
        let mut referrer = registered(1);
        db.upsert_profile(&referrer).await.unwrap();
        let mut invitee = registered(2);
        invitee.referrer_id = 1;
        invitee.referral_status = ReferralStatus::Pending;
        db.upsert_profile(&invitee).await.unwrap();

        assert!(db.set_course_subscribed(1).await.unwrap());
        assert!(!db.set_course_subscribed(1).await.unwrap(), "second set is a no-op");
        db.record_referral_credit(&usage(1, 2)).await.unwrap();

        referrer.course_channel_subscribed = false;
        referrer.referral_points = 0;
        db.upsert_profile(&referrer).await.unwrap();

        let fetched = db.get_profile(1).await.unwrap().unwrap();
        assert!(fetched.course_channel_subscribed);
        assert_eq!(fetched.referral_points, 1);
    }

    #[tokio::test]
    async fn status_without_referrer_is_rejected() {
        let db = test_db().await;
        let mut p = registered(1);
        p.referral_status = ReferralStatus::Pending;
        let err = db.upsert_profile(&p).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "got {err}");
    }

    #[tokio::test]
    async fn referral_link_is_cached_and_bounded() {
        let db = test_db().await;
        db.upsert_profile(&registered(1)).await.unwrap();
        db.set_referral_link(1, "https://t.me/bot?start=1").await.unwrap();
        let fetched = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(fetched.referral_link.as_deref(), Some("https://t.me/bot?start=1"));

        let too_long = "x".repeat(513);
        assert!(db.set_referral_link(1, &too_long).await.is_err());
        assert!(matches!(
            db.set_referral_link(99, "y").await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn pending_referrals_only_lists_registered_pending() {
        let db = test_db().await;
        db.upsert_profile(&registered(1)).await.unwrap();

        let mut pending = registered(2);
        pending.referrer_id = 1;
        pending.referral_status = ReferralStatus::Pending;
        db.upsert_profile(&pending).await.unwrap();

        let mut unfinished = pending.clone();
        unfinished.user_id = 3;
        unfinished.registration_completed = false;
        db.upsert_profile(&unfinished).await.unwrap();

        let listed: Vec<i64> = db
            .list_pending_referrals()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(listed, vec![2]);
    }

    #[tokio::test]
    async fn profile_lock_serializes_holders() {
        let db = Arc::new(test_db().await);
        db.upsert_profile(&registered(1)).await.unwrap();

        let first = db.lock_profile_for_update(1).await.unwrap();
        assert!(first.profile.is_some());

        let db2 = Arc::clone(&db);
        let waiter = tokio::spawn(async move { db2.lock_profile_for_update(1).await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second lock must wait for the first");

        drop(first);
        waiter.await.unwrap().unwrap();
    }

    // ── Contexts ────────────────────────────────────────────────────

    #[tokio::test]
    async fn context_round_trip() {
        let db = test_db().await;
        let mut ctx = ConversationContext::new(5);
        ctx.state = FlowState::AwaitPhone;
        ctx.track = Track::Referral;
        ctx.referrer_id = 9;
        ctx.referral_source = Some("referral_link".into());
        ctx.has_children = Some(true);
        ctx.children_study_quran = Some(false);
        ctx.add_pending_tag("clicked");
        db.upsert_context(&ctx).await.unwrap();

        let fetched = db.get_context(5).await.unwrap().unwrap();
        assert_eq!(fetched.state, FlowState::AwaitPhone);
        assert_eq!(fetched.track, Track::Referral);
        assert_eq!(fetched.referrer_id, 9);
        assert_eq!(fetched.has_children, Some(true));
        assert_eq!(fetched.children_study_quran, Some(false));
        assert_eq!(fetched.pending_tags, vec!["clicked".to_string()]);

        assert!(db.delete_context(5).await.unwrap());
        assert!(!db.delete_context(5).await.unwrap());
        assert!(db.get_context(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn due_contexts_respect_time_and_sent_flag() {
        let db = test_db().await;
        let now = Utc::now();

        let mut due = ConversationContext::new(1);
        due.state = FlowState::AwaitEpilogue;
        due.epilogue_due_at = Some(now - ChronoDuration::seconds(5));
        db.upsert_context(&due).await.unwrap();

        let mut later = due.clone();
        later.user_id = 2;
        later.epilogue_due_at = Some(now + ChronoDuration::seconds(60));
        db.upsert_context(&later).await.unwrap();

        let mut sent = due.clone();
        sent.user_id = 3;
        sent.epilogue_sent = true;
        db.upsert_context(&sent).await.unwrap();

        let ids: Vec<i64> = db
            .list_due_contexts(now)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.user_id)
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn usernames_resolve_case_insensitively() {
        let db = test_db().await;
        db.upsert_profile(&registered(1)).await.unwrap();
        let mut ctx = ConversationContext::new(2);
        ctx.remember_sender("Admin", Some("Boss"));
        db.upsert_context(&ctx).await.unwrap();

        let ids = db
            .find_user_ids_by_usernames(&["@ALI_K".into(), "boss".into(), "nobody".into()])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    // ── Ledger ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn credit_updates_usage_points_and_invitee() {
        let db = test_db().await;
        db.upsert_profile(&registered(1)).await.unwrap();
        let mut invitee = registered(2);
        invitee.referrer_id = 1;
        invitee.referral_status = ReferralStatus::Pending;
        db.upsert_profile(&invitee).await.unwrap();

        let points = db.record_referral_credit(&usage(1, 2)).await.unwrap();
        assert_eq!(points, 1);

        let row = db.find_usage_by_key("ref:1:2").await.unwrap().unwrap();
        assert!(row.already_counted);
        assert!(db.find_usage_by_pair(1, 2).await.unwrap().is_some());
        assert!(db.usage_exists_for_invitee(2).await.unwrap());
        assert!(!db.usage_exists_for_invitee(1).await.unwrap());

        let invitee = db.get_profile(2).await.unwrap().unwrap();
        assert_eq!(invitee.referral_status, ReferralStatus::Counted);
        assert!(invitee.referral_counted_at.is_some());
    }

    #[tokio::test]
    async fn duplicate_credit_rolls_back() {
        let db = test_db().await;
        db.upsert_profile(&registered(1)).await.unwrap();
        let mut invitee = registered(2);
        invitee.referrer_id = 1;
        invitee.referral_status = ReferralStatus::Pending;
        db.upsert_profile(&invitee).await.unwrap();

        db.record_referral_credit(&usage(1, 2)).await.unwrap();
        let err = db.record_referral_credit(&usage(1, 2)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "got {err}");

        let referrer = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(referrer.referral_points, 1, "failed credit must not add points");
    }

    #[tokio::test]
    async fn credit_for_missing_referrer_rolls_back() {
        let db = test_db().await;
        let err = db.record_referral_credit(&usage(1, 2)).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert!(db.find_usage_by_key("ref:1:2").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_credit_keeps_concurrent_writes_of_other_users() {
        let db = Arc::new(test_db().await);

        let writer = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                for i in 0..500 {
                    db.insert_tag(5, &format!("t{i}")).await.unwrap();
                }
            })
        };
        let failing = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                for i in 0..500 {
                    let err = db.record_referral_credit(&usage(1, 1000 + i)).await;
                    assert!(matches!(err, Err(DatabaseError::NotFound { .. })));
                }
            })
        };
        writer.await.unwrap();
        failing.await.unwrap();

        assert_eq!(db.list_tags(5).await.unwrap().len(), 500);
        assert!(!db.usage_exists_for_invitee(1000).await.unwrap());
    }

    // ── Tags ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tags_insert_once() {
        let db = test_db().await;
        assert!(db.insert_tag(1, "a").await.unwrap());
        assert!(!db.insert_tag(1, "a").await.unwrap());
        assert!(db.insert_tag(1, "b").await.unwrap());
        assert!(db.tag_exists(1, "a").await.unwrap());
        assert!(!db.tag_exists(2, "a").await.unwrap());
        assert_eq!(db.list_tags(1).await.unwrap(), vec!["a", "b"]);
    }

    // ── Notification admins ─────────────────────────────────────────

    #[tokio::test]
    async fn notification_admins_add_deactivate_and_bind() {
        let db = test_db().await;
        let admin = db.add_notification_admin(" @Ustaz_Ali ").await.unwrap();
        assert_eq!(admin.username, "ustaz_ali");
        assert!(admin.active);
        assert_eq!(admin.user_id, None);

        assert!(db.set_notification_admin_active("ustaz_ali", false).await.unwrap());
        assert!(db.list_active_notification_admins().await.unwrap().is_empty());
        assert!(!db.set_notification_admin_active("nobody", false).await.unwrap());

        // Adding again re-activates the same row.
        let again = db.add_notification_admin("USTAZ_ALI").await.unwrap();
        assert_eq!(again.id, admin.id);
        assert!(again.active);

        db.bind_notification_admin(admin.id, 42).await.unwrap();
        let active = db.list_active_notification_admins().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].user_id, Some(42));

        let err = db.bind_notification_admin(admin.id + 100, 1).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        let err = db.add_notification_admin("@").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn children_stats_split_by_answers() {
        let db = test_db().await;
        assert_eq!(db.children_stats().await.unwrap(), ChildrenStats::default());

        let answers = [
            (1, Some(true), Some(true)),
            (2, Some(true), Some(false)),
            (3, Some(true), None),
            (4, Some(false), None),
            (5, None, None),
        ];
        for (id, has_children, study) in answers {
            let mut p = registered(id);
            p.has_children = has_children;
            p.children_study_quran = study;
            db.upsert_profile(&p).await.unwrap();
        }

        let stats = db.children_stats().await.unwrap();
        assert_eq!(stats.total_users, 5);
        assert_eq!(stats.users_with_children, 3);
        assert_eq!(stats.users_without_children, 2);
        assert_eq!(stats.users_with_children_study_quran_true, 1);
        assert_eq!(stats.users_with_children_study_quran_false, 1);
        assert_eq!(stats.users_with_children_study_quran_unknown, 1);
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bot.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_profile(&registered(1)).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_profile(1).await.unwrap().is_some());
    }
}
