//! libSQL backend — async `AccountStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::model::{
    Account, BillingLink, IdentityMatch, NewAccount, PaymentCompletion, ProfileChange,
    ProfileFields, ProfileUpdate, SUBSCRIPTION_ACTIVE, SignupStatusRecord,
};
use crate::onboarding::state::Stage;
use crate::store::migrations;
use crate::store::traits::{AccountStore, StageWrite};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Every
/// operation, reads included, holds `lock` for its statements, so no caller
/// observes another task's transaction before it commits or rolls back.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
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
            lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 in UTC.
fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    format_ts(Utc::now())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn try_parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|ndt| ndt.and_utc())
}

/// Lenient variant for row mapping; unreadable timestamps become the epoch floor.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    try_parse_datetime(s).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(v) => libsql::Value::Text(v.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad id {s}: {e}")))
}

/// Account markers that still count as an incomplete registration.
const INCOMPLETE_MARKERS: &str = "('started', 'payment', 'profile')";

const ACCOUNT_COLUMNS: &str = "id, email, handle, phone, password_hash, stage, \
    has_agreed_to_terms, has_completed_payment, profile_completed, is_admin, \
    customer_id, subscription_id, subscription_status, payment_reference, \
    full_name, company, industry, title, location, bio, linkedin_url, twitter_url, \
    website_url, do_follow, created_at, updated_at";

/// Column count of `ACCOUNT_COLUMNS`; extra selected columns start here.
const ACCOUNT_COLUMN_COUNT: i32 = 26;

/// Map a libsql Row to an Account. Column order matches `ACCOUNT_COLUMNS`.
fn row_to_account(row: &libsql::Row) -> Result<Account, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("account row parse: {e}"));
    let flag = |idx: i32| -> Result<bool, DatabaseError> { Ok(row.get::<i64>(idx).map_err(parse)? != 0) };
    let text = |idx: i32| -> Option<String> { row.get::<String>(idx).ok() };

    let id_str: String = row.get(0).map_err(parse)?;
    let stage_str: String = row.get(5).map_err(parse)?;
    let stage = Stage::from_marker(&stage_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("unknown stage {stage_str} for account {id_str}"))
    })?;
    let created_str: String = row.get(24).map_err(parse)?;
    let updated_str: String = row.get(25).map_err(parse)?;

    Ok(Account {
        id: parse_uuid(&id_str)?,
        email: row.get(1).map_err(parse)?,
        handle: row.get(2).map_err(parse)?,
        phone: row.get(3).map_err(parse)?,
        password_hash: row.get(4).map_err(parse)?,
        stage,
        has_agreed_to_terms: flag(6)?,
        has_completed_payment: flag(7)?,
        profile_completed: flag(8)?,
        is_admin: flag(9)?,
        billing: BillingLink {
            customer_id: text(10),
            subscription_id: text(11),
            subscription_status: text(12),
            payment_reference: text(13),
        },
        profile: ProfileFields {
            full_name: text(14),
            company: text(15),
            industry: text(16),
            title: text(17),
            location: text(18),
            bio: text(19),
            linkedin_url: text(20),
            twitter_url: text(21),
            website_url: text(22),
            do_follow: flag(23)?,
        },
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_signup_status(row: &libsql::Row) -> Result<SignupStatusRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("signup_status row parse: {e}"));
    let id_str: String = row.get(0).map_err(parse)?;
    let status_str: String = row.get(1).map_err(parse)?;
    let created_str: String = row.get(2).map_err(parse)?;
    let updated_str: String = row.get(3).map_err(parse)?;

    Ok(SignupStatusRecord {
        account_id: parse_uuid(&id_str)?,
        status: Stage::from_status(&status_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown signup status {status_str}"))
        })?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Delete the tracker and account for `id` if the registration is still
/// incomplete on both markers. Returns whether the account row was deleted.
async fn delete_incomplete_pair(conn: &Connection, id: Uuid, op: &str) -> Result<bool, DatabaseError> {
    let id = id.to_string();
    conn.execute(
        &format!(
            "DELETE FROM signup_status WHERE account_id = ?1 AND status != 'completed'
             AND EXISTS (SELECT 1 FROM accounts WHERE id = ?1 AND stage IN {INCOMPLETE_MARKERS})"
        ),
        params![id.clone()],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql(op, e))?;

    let deleted = conn
        .execute(
            &format!(
                "DELETE FROM accounts WHERE id = ?1 AND stage IN {INCOMPLETE_MARKERS}
                 AND NOT EXISTS (SELECT 1 FROM signup_status WHERE account_id = ?1 AND status = 'completed')"
            ),
            params![id],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))?;
    Ok(deleted > 0)
}

async fn insert_account_pair(
    conn: &Connection,
    account: &NewAccount,
    replace: &[Uuid],
) -> Result<(), DatabaseError> {
    for old_id in replace {
        if delete_incomplete_pair(conn, *old_id, "create_account replace").await? {
            info!(account_id = %old_id, "Removed abandoned registration for re-registration");
        }
    }

    let created = format_ts(account.created_at);
    conn.execute(
        "INSERT INTO accounts (id, email, handle, phone, password_hash, stage,
            has_agreed_to_terms, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
        params![
            account.id.to_string(),
            account.email.clone(),
            account.handle.clone(),
            account.phone.clone(),
            account.password_hash.clone(),
            Stage::Payment.marker_name(),
            created.clone(),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("insert_account", e))?;

    conn.execute(
        "INSERT INTO signup_status (account_id, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![
            account.id.to_string(),
            Stage::Payment.status_name(),
            created,
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("insert_signup_status", e))?;
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

impl LibSqlBackend {
    /// Distinguish a stale compare-and-swap from a missing row.
    async fn classify_miss(&self, table: &str, key: &str, id: Uuid) -> Result<StageWrite, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM {table} WHERE {key} = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("classify_miss: {e}")))?;
        let count: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).unwrap_or(0),
            _ => 0,
        };
        Ok(if count > 0 { StageWrite::Stale } else { StageWrite::Missing })
    }
}

#[async_trait]
impl AccountStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Accounts ────────────────────────────────────────────────────

    async fn find_identity_matches(
        &self,
        email: &str,
        handle: &str,
        phone: &str,
    ) -> Result<Vec<IdentityMatch>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS},
                        (SELECT status FROM signup_status WHERE signup_status.account_id = accounts.id)
                     FROM accounts
                     WHERE email = ?1 COLLATE NOCASE OR handle = ?2 COLLATE NOCASE OR phone = ?3"
                ),
                params![email, handle, phone],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_identity_matches: {e}")))?;

        let mut matches = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let account = row_to_account(&row)?;
                    let tracker_status = row
                        .get::<String>(ACCOUNT_COLUMN_COUNT)
                        .ok()
                        .and_then(|s| Stage::from_status(&s));
                    matches.push(IdentityMatch {
                        account,
                        tracker_status,
                    });
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("find_identity_matches: {e}"))),
            }
        }
        Ok(matches)
    }

    async fn create_account(
        &self,
        account: &NewAccount,
        replace: &[Uuid],
    ) -> Result<Account, DatabaseError> {
        {
            let _guard = self.lock.lock().await;
            let tx = self
                .conn()
                .transaction()
                .await
                .map_err(|e| DatabaseError::Query(format!("create_account begin: {e}")))?;

            match insert_account_pair(&tx, account, replace).await {
                Ok(()) => tx
                    .commit()
                    .await
                    .map_err(|e| DatabaseError::from_libsql("create_account commit", e))?,
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "create_account rollback failed");
                    }
                    return Err(e);
                }
            }
        }

        debug!(account_id = %account.id, replaced = replace.len(), "Account created");
        self.get_account(account.id)
            .await?
            .ok_or_else(|| DatabaseError::Query(format!("create_account: {} not readable", account.id)))
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_account(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account: {e}"))),
        }
    }

    async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE email = ?1 COLLATE NOCASE"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_account(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account_by_email: {e}"))),
        }
    }

    async fn swap_account_stage(
        &self,
        id: Uuid,
        expected: Stage,
        next: Stage,
    ) -> Result<StageWrite, DatabaseError> {
        let _guard = self.lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE accounts SET stage = ?1, updated_at = ?2 WHERE id = ?3 AND stage = ?4",
                params![
                    next.marker_name(),
                    now_ts(),
                    id.to_string(),
                    expected.marker_name()
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("swap_account_stage", e))?;

        if count > 0 {
            debug!(account_id = %id, from = %expected, to = %next, "Account stage advanced");
            return Ok(StageWrite::Applied);
        }
        self.classify_miss("accounts", "id", id).await
    }

    async fn complete_payment(
        &self,
        id: Uuid,
        payment: &PaymentCompletion,
    ) -> Result<StageWrite, DatabaseError> {
        let _guard = self.lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE accounts SET
                    stage = ?1,
                    has_completed_payment = 1,
                    payment_reference = ?2,
                    subscription_id = COALESCE(?3, subscription_id),
                    subscription_status = CASE WHEN ?3 IS NULL THEN subscription_status ELSE ?4 END,
                    updated_at = ?5
                 WHERE id = ?6 AND stage = ?7",
                params![
                    Stage::Profile.marker_name(),
                    payment.payment_reference.clone(),
                    opt_text(payment.subscription_reference.as_deref()),
                    SUBSCRIPTION_ACTIVE,
                    now_ts(),
                    id.to_string(),
                    Stage::Payment.marker_name(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("complete_payment", e))?;

        if count > 0 {
            info!(account_id = %id, "Payment recorded");
            return Ok(StageWrite::Applied);
        }
        self.classify_miss("accounts", "id", id).await
    }

    async fn update_profile(&self, id: Uuid, update: &ProfileUpdate) -> Result<bool, DatabaseError> {
        let mut assignments = Vec::with_capacity(update.changes.len() + 2);
        let mut values: Vec<libsql::Value> = Vec::with_capacity(update.changes.len() + 2);
        for change in &update.changes {
            let (column, value) = match change {
                ProfileChange::Text { column, value } => (*column, opt_text(value.as_deref())),
                ProfileChange::Phone(phone) => ("phone", libsql::Value::Text(phone.clone())),
                ProfileChange::DoFollow(flag) => ("do_follow", libsql::Value::Integer(i64::from(*flag))),
            };
            values.push(value);
            assignments.push(format!("{column} = ?{}", values.len()));
        }
        values.push(libsql::Value::Text(now_ts()));
        assignments.push(format!("updated_at = ?{}", values.len()));
        values.push(libsql::Value::Text(id.to_string()));
        let id_param = values.len();

        let sql = format!(
            "UPDATE accounts SET {}, profile_completed = 1 WHERE id = ?{id_param}",
            assignments.join(", ")
        );

        let _guard = self.lock.lock().await;
        let count = self
            .conn()
            .execute(&sql, libsql::params_from_iter(values))
            .await
            .map_err(|e| DatabaseError::from_libsql("update_profile", e))?;

        debug!(account_id = %id, fields = update.changes.len(), "Profile updated");
        Ok(count > 0)
    }

    async fn mark_completed(&self, id: Uuid) -> Result<Option<Account>, DatabaseError> {
        let count = {
            let _guard = self.lock.lock().await;
            self.conn()
                .execute(
                    "UPDATE accounts SET stage = ?1, profile_completed = 1, updated_at = ?2 WHERE id = ?3",
                    params![Stage::Completed.marker_name(), now_ts(), id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::from_libsql("mark_completed", e))?
        };

        if count == 0 {
            return Ok(None);
        }
        self.get_account(id).await
    }

    // ── Signup-status tracker ───────────────────────────────────────

    async fn get_signup_status(
        &self,
        account_id: Uuid,
    ) -> Result<Option<SignupStatusRecord>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                "SELECT account_id, status, created_at, updated_at FROM signup_status WHERE account_id = ?1",
                params![account_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_signup_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_signup_status(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_signup_status: {e}"))),
        }
    }

    async fn swap_signup_status(
        &self,
        account_id: Uuid,
        expected: Stage,
        next: Stage,
    ) -> Result<StageWrite, DatabaseError> {
        let _guard = self.lock.lock().await;
        let count = self
            .conn()
            .execute(
                "UPDATE signup_status SET status = ?1, updated_at = ?2 WHERE account_id = ?3 AND status = ?4",
                params![
                    next.status_name(),
                    now_ts(),
                    account_id.to_string(),
                    expected.status_name()
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("swap_signup_status", e))?;

        if count > 0 {
            debug!(account_id = %account_id, from = %expected, to = %next, "Signup status advanced");
            return Ok(StageWrite::Applied);
        }
        self.classify_miss("signup_status", "account_id", account_id).await
    }

    // ── Reaping ─────────────────────────────────────────────────────

    async fn find_abandoned(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT id, created_at FROM accounts
                     WHERE stage IN {INCOMPLETE_MARKERS}
                     AND NOT EXISTS (
                        SELECT 1 FROM signup_status
                        WHERE signup_status.account_id = accounts.id AND status = 'completed'
                     )
                     ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_abandoned: {e}")))?;

        // Compared in Rust: legacy rows may carry SQLite's datetime format
        let mut ids = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let id_str: String = row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(format!("find_abandoned row: {e}")))?;
                    let created_str: String = row
                        .get(1)
                        .map_err(|e| DatabaseError::Query(format!("find_abandoned row: {e}")))?;
                    match try_parse_datetime(&created_str) {
                        Some(created) if created < cutoff => ids.push(parse_uuid(&id_str)?),
                        Some(_) => {}
                        None => warn!(
                            account_id = %id_str,
                            created_at = %created_str,
                            "Skipping account with unreadable created_at"
                        ),
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("find_abandoned: {e}"))),
            }
        }
        Ok(ids)
    }

    async fn delete_abandoned(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_abandoned begin: {e}")))?;

        match delete_incomplete_pair(&tx, id, "delete_abandoned").await {
            Ok(deleted) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("delete_abandoned commit: {e}")))?;
                Ok(deleted)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "delete_abandoned rollback failed");
                }
                Err(e)
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_account(email: &str, handle: &str, phone: &str) -> NewAccount {
        NewAccount {
            id: Uuid::new_v4(),
            email: email.to_string(),
            handle: handle.to_string(),
            phone: phone.to_string(),
            password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
            created_at: Utc::now(),
        }
    }

    async fn backdate(db: &LibSqlBackend, id: Uuid, days: i64) {
        let old = format_ts(Utc::now() - chrono::Duration::days(days));
        db.conn()
            .execute(
                "UPDATE accounts SET created_at = ?1 WHERE id = ?2",
                params![old, id.to_string()],
            )
            .await
            .unwrap();
    }

    async fn count(db: &LibSqlBackend, sql: &str) -> i64 {
        let mut rows = db.conn().query(sql, ()).await.unwrap();
        rows.next().await.unwrap().unwrap().get(0).unwrap()
    }

    // ── Account tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get_account() {
        let db = test_db().await;
        let new = new_account("a@a.com", "abcd1234", "555-0100");

        let account = db.create_account(&new, &[]).await.unwrap();
        assert_eq!(account.id, new.id);
        assert_eq!(account.stage, Stage::Payment);
        assert!(account.has_agreed_to_terms);
        assert!(!account.has_completed_payment);
        assert!(!account.profile_completed);

        let status = db.get_signup_status(new.id).await.unwrap().unwrap();
        assert_eq!(status.status, Stage::Payment);
    }

    #[tokio::test]
    async fn get_account_not_found() {
        let db = test_db().await;
        assert!(db.get_account(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identity_match_is_case_insensitive() {
        let db = test_db().await;
        db.create_account(&new_account("ada@example.com", "adalove", "1"), &[])
            .await
            .unwrap();

        let by_email = db.find_identity_matches("ADA@Example.com", "zzzz", "9").await.unwrap();
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].tracker_status, Some(Stage::Payment));

        let by_handle = db.find_identity_matches("x@y.com", "AdaLove", "9").await.unwrap();
        assert_eq!(by_handle.len(), 1);

        let by_phone = db.find_identity_matches("x@y.com", "zzzz", "1").await.unwrap();
        assert_eq!(by_phone.len(), 1);

        let none = db.find_identity_matches("x@y.com", "zzzz", "9").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn duplicate_identity_is_a_constraint_error() {
        let db = test_db().await;
        db.create_account(&new_account("a@a.com", "first", "1"), &[])
            .await
            .unwrap();

        let err = db
            .create_account(&new_account("A@A.COM", "second", "2"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)), "got {err:?}");

        // Nothing half-written
        assert_eq!(count(&db, "SELECT COUNT(*) FROM accounts").await, 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM signup_status").await, 1);
    }

    #[tokio::test]
    async fn create_replacing_incomplete_account() {
        let db = test_db().await;
        let old = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        let fresh = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[old.id])
            .await
            .unwrap();
        assert_ne!(fresh.id, old.id);
        assert!(db.get_account(old.id).await.unwrap().is_none());
        assert!(db.get_signup_status(old.id).await.unwrap().is_none());
        assert_eq!(count(&db, "SELECT COUNT(*) FROM accounts").await, 1);
        assert_eq!(count(&db, "SELECT COUNT(*) FROM signup_status").await, 1);
    }

    #[tokio::test]
    async fn replace_never_deletes_completed_account() {
        let db = test_db().await;
        let done = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();
        db.mark_completed(done.id).await.unwrap();

        let err = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[done.id])
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
        assert!(db.get_account(done.id).await.unwrap().is_some());
        assert!(db.get_signup_status(done.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn swap_account_stage_is_compare_and_swap() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        let applied = db
            .swap_account_stage(account.id, Stage::Payment, Stage::Profile)
            .await
            .unwrap();
        assert_eq!(applied, StageWrite::Applied);

        let stale = db
            .swap_account_stage(account.id, Stage::Payment, Stage::Profile)
            .await
            .unwrap();
        assert_eq!(stale, StageWrite::Stale);

        let missing = db
            .swap_account_stage(Uuid::new_v4(), Stage::Payment, Stage::Profile)
            .await
            .unwrap();
        assert_eq!(missing, StageWrite::Missing);

        let fetched = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(fetched.stage, Stage::Profile);
    }

    #[tokio::test]
    async fn complete_payment_records_subscription() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        let write = db
            .complete_payment(
                account.id,
                &PaymentCompletion {
                    payment_reference: "pi_123".into(),
                    subscription_reference: Some("sub_456".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(write, StageWrite::Applied);

        let fetched = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(fetched.stage, Stage::Profile);
        assert!(fetched.has_completed_payment);
        assert_eq!(fetched.billing.payment_reference.as_deref(), Some("pi_123"));
        assert_eq!(fetched.billing.subscription_id.as_deref(), Some("sub_456"));
        assert_eq!(fetched.billing.subscription_status.as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn complete_payment_without_subscription_leaves_it_empty() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        db.complete_payment(
            account.id,
            &PaymentCompletion {
                payment_reference: "pi_1".into(),
                subscription_reference: None,
            },
        )
        .await
        .unwrap();

        let fetched = db.get_account(account.id).await.unwrap().unwrap();
        assert!(fetched.billing.subscription_id.is_none());
        assert!(fetched.billing.subscription_status.is_none());
    }

    #[tokio::test]
    async fn update_profile_sets_fields_and_flag() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        let update = ProfileUpdate {
            changes: vec![
                ProfileChange::Text {
                    column: "full_name",
                    value: Some("Ada Lovelace".into()),
                },
                ProfileChange::Text {
                    column: "company",
                    value: Some("Analytical Engines".into()),
                },
                ProfileChange::DoFollow(true),
                ProfileChange::Phone("2".into()),
            ],
        };
        assert!(db.update_profile(account.id, &update).await.unwrap());

        let fetched = db.get_account(account.id).await.unwrap().unwrap();
        assert!(fetched.profile_completed);
        assert_eq!(fetched.profile.full_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(fetched.profile.company.as_deref(), Some("Analytical Engines"));
        assert!(fetched.profile.do_follow);
        assert_eq!(fetched.phone, "2");
        assert_eq!(fetched.stage, Stage::Payment, "profile update does not move the stage");
    }

    #[tokio::test]
    async fn update_profile_missing_account() {
        let db = test_db().await;
        let update = ProfileUpdate {
            changes: vec![ProfileChange::DoFollow(false)],
        };
        assert!(!db.update_profile(Uuid::new_v4(), &update).await.unwrap());
    }

    #[tokio::test]
    async fn update_profile_phone_collision() {
        let db = test_db().await;
        db.create_account(&new_account("a@a.com", "aaaa1111", "1"), &[])
            .await
            .unwrap();
        let other = db
            .create_account(&new_account("b@b.com", "bbbb2222", "2"), &[])
            .await
            .unwrap();

        let update = ProfileUpdate {
            changes: vec![ProfileChange::Phone("1".into())],
        };
        let err = db.update_profile(other.id, &update).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn mark_completed_is_idempotent() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        let first = db.mark_completed(account.id).await.unwrap().unwrap();
        let second = db.mark_completed(account.id).await.unwrap().unwrap();
        assert_eq!(first.stage, Stage::Completed);
        assert_eq!(second.stage, Stage::Completed);
        assert!(second.profile_completed);

        assert!(db.mark_completed(Uuid::new_v4()).await.unwrap().is_none());
    }

    // ── Signup-status tests ─────────────────────────────────────────

    #[tokio::test]
    async fn swap_signup_status_stamps_update() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();
        let before = db.get_signup_status(account.id).await.unwrap().unwrap();

        let write = db
            .swap_signup_status(account.id, Stage::Payment, Stage::Completed)
            .await
            .unwrap();
        assert_eq!(write, StageWrite::Applied);

        let after = db.get_signup_status(account.id).await.unwrap().unwrap();
        assert_eq!(after.status, Stage::Completed);
        assert!(after.updated_at >= before.updated_at);

        let missing = db
            .swap_signup_status(Uuid::new_v4(), Stage::Payment, Stage::Profile)
            .await
            .unwrap();
        assert_eq!(missing, StageWrite::Missing);
    }

    // ── Reaping tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn find_abandoned_respects_cutoff_and_stage() {
        let db = test_db().await;
        let old = db
            .create_account(&new_account("old@a.com", "oldone1", "1"), &[])
            .await
            .unwrap();
        let fresh = db
            .create_account(&new_account("new@a.com", "newone1", "2"), &[])
            .await
            .unwrap();
        let done = db
            .create_account(&new_account("done@a.com", "doneone1", "3"), &[])
            .await
            .unwrap();
        db.mark_completed(done.id).await.unwrap();
        backdate(&db, old.id, 30).await;
        backdate(&db, done.id, 30).await;

        let cutoff = Utc::now() - chrono::Duration::days(7);
        let ids = db.find_abandoned(cutoff).await.unwrap();
        assert_eq!(ids, vec![old.id]);
        assert!(!ids.contains(&fresh.id));
    }

    #[tokio::test]
    async fn find_abandoned_skips_unreadable_created_at() {
        let db = test_db().await;
        let old = db
            .create_account(&new_account("old@a.com", "oldone1", "1"), &[])
            .await
            .unwrap();
        let broken = db
            .create_account(&new_account("bad@a.com", "badone1", "2"), &[])
            .await
            .unwrap();
        backdate(&db, old.id, 30).await;
        db.conn()
            .execute(
                "UPDATE accounts SET created_at = 'not a date' WHERE id = ?1",
                params![broken.id.to_string()],
            )
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        assert_eq!(db.find_abandoned(cutoff).await.unwrap(), vec![old.id]);
    }

    #[tokio::test]
    async fn tracker_completion_protects_account() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();
        db.swap_signup_status(account.id, Stage::Payment, Stage::Completed)
            .await
            .unwrap();
        backdate(&db, account.id, 30).await;

        let cutoff = Utc::now() - chrono::Duration::days(7);
        assert!(db.find_abandoned(cutoff).await.unwrap().is_empty());
        assert!(!db.delete_abandoned(account.id).await.unwrap());
        assert!(db.get_account(account.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_abandoned_removes_pair() {
        let db = test_db().await;
        let account = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        assert!(db.delete_abandoned(account.id).await.unwrap());
        assert!(db.get_account(account.id).await.unwrap().is_none());
        assert!(db.get_signup_status(account.id).await.unwrap().is_none());
        assert!(!db.delete_abandoned(account.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_never_see_replacement_mid_transaction() {
        let db = Arc::new(test_db().await);
        let first = db
            .create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
            .await
            .unwrap();

        let writer = {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                let mut previous = first.id;
                for _ in 0..100 {
                    let next = db
                        .create_account(&new_account("a@a.com", "abcd1234", "1"), &[previous])
                        .await
                        .unwrap();
                    previous = next.id;
                    tokio::task::yield_now().await;
                }
            })
        };

        while !writer.is_finished() {
            let matches = db.find_identity_matches("a@a.com", "abcd1234", "1").await.unwrap();
            assert_eq!(matches.len(), 1, "reader saw an uncommitted replacement");
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(count(&db, "SELECT COUNT(*) FROM accounts").await, 1);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("signup.db");
        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_account(&new_account("a@a.com", "abcd1234", "1"), &[])
                .await
                .unwrap()
                .id
        };

        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(reopened.get_account(id).await.unwrap().is_some());
    }
}
