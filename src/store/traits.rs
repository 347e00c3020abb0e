//! `AccountStore` trait — the single async interface for signup persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::onboarding::model::{
    Account, IdentityMatch, NewAccount, PaymentCompletion, ProfileUpdate, SignupStatusRecord,
};
use crate::onboarding::state::Stage;

/// Result of a compare-and-swap stage write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageWrite {
    /// The row held the expected stage and now holds the new one.
    Applied,
    /// The row exists but no longer holds the expected stage.
    Stale,
    /// No such row.
    Missing,
}

/// Backend-agnostic storage for account records and signup-status trackers.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Accounts ────────────────────────────────────────────────────

    /// All accounts whose email (case-insensitive), handle (case-insensitive)
    /// or phone equals the given values, with their tracker status.
    async fn find_identity_matches(
        &self,
        email: &str,
        handle: &str,
        phone: &str,
    ) -> Result<Vec<IdentityMatch>, DatabaseError>;

    /// In one transaction: delete the account + tracker pairs listed in
    /// `replace` (only while they are still incomplete), then insert the new
    /// account at `payment` with its tracker at `payment`.
    ///
    /// A unique-constraint violation surfaces as `DatabaseError::Constraint`.
    async fn create_account(
        &self,
        account: &NewAccount,
        replace: &[Uuid],
    ) -> Result<Account, DatabaseError>;

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>, DatabaseError>;

    async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>, DatabaseError>;

    /// Move `accounts.stage` from `expected` to `next`.
    async fn swap_account_stage(
        &self,
        id: Uuid,
        expected: Stage,
        next: Stage,
    ) -> Result<StageWrite, DatabaseError>;

    /// Record payment completion and move the stage from `payment` to
    /// `profile` in the same statement.
    async fn complete_payment(
        &self,
        id: Uuid,
        payment: &PaymentCompletion,
    ) -> Result<StageWrite, DatabaseError>;

    /// Persist recognized profile fields and mark the profile completed.
    /// Returns `false` if the account does not exist.
    async fn update_profile(&self, id: Uuid, update: &ProfileUpdate) -> Result<bool, DatabaseError>;

    /// Set the terminal stage and `profile_completed`. Returns the updated
    /// account, or `None` if it does not exist.
    async fn mark_completed(&self, id: Uuid) -> Result<Option<Account>, DatabaseError>;

    // ── Signup-status tracker ───────────────────────────────────────

    async fn get_signup_status(
        &self,
        account_id: Uuid,
    ) -> Result<Option<SignupStatusRecord>, DatabaseError>;

    /// Move `signup_status.status` from `expected` to `next`, stamping
    /// `updated_at`.
    async fn swap_signup_status(
        &self,
        account_id: Uuid,
        expected: Stage,
        next: Stage,
    ) -> Result<StageWrite, DatabaseError>;

    // ── Reaping ─────────────────────────────────────────────────────

    /// Ids of incomplete registrations created before `cutoff`.
    async fn find_abandoned(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>, DatabaseError>;

    /// In one transaction, delete the tracker and account for `id` if the
    /// registration is still incomplete on both markers. Returns whether the
    /// account was deleted.
    async fn delete_abandoned(&self, id: Uuid) -> Result<bool, DatabaseError>;
}
