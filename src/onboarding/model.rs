//! Account records, profile updates and the wire shapes of the signup API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::Stage;
use crate::error::SignupError;

/// Public role derived from the account's administrator flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn from_admin_flag(is_admin: bool) -> Self {
        if is_admin { Self::Admin } else { Self::Member }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Member => write!(f, "member"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Billing linkage. All values are opaque references owned by the payment
/// processor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillingLink {
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub subscription_status: Option<String>,
    pub payment_reference: Option<String>,
}

/// Profile fields collected during the profile stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileFields {
    pub full_name: Option<String>,
    pub company: Option<String>,
    pub industry: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
    pub linkedin_url: Option<String>,
    pub twitter_url: Option<String>,
    pub website_url: Option<String>,
    pub do_follow: bool,
}

/// One registrant.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub handle: String,
    pub phone: String,
    pub password_hash: String,
    pub stage: Stage,
    pub has_agreed_to_terms: bool,
    pub has_completed_payment: bool,
    pub profile_completed: bool,
    pub is_admin: bool,
    pub billing: BillingLink,
    pub profile: ProfileFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn role(&self) -> Role {
        Role::from_admin_flag(self.is_admin)
    }
}

/// Validated input for creating an account + tracker pair.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Uuid,
    pub email: String,
    pub handle: String,
    pub phone: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// The signup-status tracker row for one account.
#[derive(Debug, Clone)]
pub struct SignupStatusRecord {
    pub account_id: Uuid,
    pub status: Stage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An existing account matching a registration's identity fields, together
/// with its tracker status (if the tracker row exists).
#[derive(Debug, Clone)]
pub struct IdentityMatch {
    pub account: Account,
    pub tracker_status: Option<Stage>,
}

impl IdentityMatch {
    /// Whether either progress marker says this registration finished.
    pub fn is_terminal(&self) -> bool {
        self.account.stage.is_terminal()
            || self.tracker_status.is_some_and(Stage::is_terminal)
    }
}

/// Side effects recorded when the payment stage is completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCompletion {
    pub payment_reference: String,
    pub subscription_reference: Option<String>,
}

/// Subscription status recorded alongside a confirmed subscription.
pub const SUBSCRIPTION_ACTIVE: &str = "active";

// ── Profile updates ─────────────────────────────────────────────────

/// A single recognized profile change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileChange {
    /// Set (`Some`) or clear (`None`) a text column.
    Text { column: &'static str, value: Option<String> },
    Phone(String),
    DoFollow(bool),
}

/// Wire keys accepted by the profile endpoint and the text columns they
/// write. `phone` and `doFollow` are typed separately.
const TEXT_FIELDS: &[(&str, &str)] = &[
    ("fullName", "full_name"),
    ("company", "company"),
    ("industry", "industry"),
    ("title", "title"),
    ("location", "location"),
    ("bio", "bio"),
    ("linkedinUrl", "linkedin_url"),
    ("twitterUrl", "twitter_url"),
    ("websiteUrl", "website_url"),
];

/// The recognized subset of a profile submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileUpdate {
    pub changes: Vec<ProfileChange>,
}

impl ProfileUpdate {
    /// Keep only recognized keys, type-checking their values.
    ///
    /// Unknown keys are dropped silently; a recognized key with the wrong
    /// JSON type is a validation error.
    pub fn from_json(body: &serde_json::Map<String, serde_json::Value>) -> Result<Self, SignupError> {
        use serde_json::Value;

        let mut changes = Vec::new();
        for (key, value) in body {
            if let Some(&(_, column)) = TEXT_FIELDS.iter().find(|(wire, _)| *wire == key.as_str()) {
                let value = match value {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    _ => {
                        return Err(SignupError::validation(format!("{key} must be a string")));
                    }
                };
                changes.push(ProfileChange::Text { column, value });
                continue;
            }
            match key.as_str() {
                "phone" => match value.as_str().map(str::trim) {
                    Some(phone) if !phone.is_empty() => {
                        changes.push(ProfileChange::Phone(phone.to_string()));
                    }
                    _ => return Err(SignupError::validation("phone must be a non-empty string")),
                },
                "doFollow" => match value.as_bool() {
                    Some(flag) => changes.push(ProfileChange::DoFollow(flag)),
                    None => return Err(SignupError::validation("doFollow must be a boolean")),
                },
                _ => {}
            }
        }
        Ok(Self { changes })
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

// ── API shapes ──────────────────────────────────────────────────────

/// Body of `POST /api/signup/register`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "username")]
    pub handle: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub terms_accepted: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub account_id: Uuid,
    pub stage: String,
    pub token: String,
}

/// Body of `POST /api/signup/accounts/{id}/advance`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceStageRequest {
    pub target_stage: String,
    #[serde(default)]
    pub payment_ref: Option<String>,
    #[serde(default)]
    pub subscription_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageProgress {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<String>,
}

impl StageProgress {
    pub fn at(stage: Stage) -> Self {
        Self {
            stage: stage.marker_name().to_string(),
            next_stage: stage.next().map(|s| s.marker_name().to_string()),
        }
    }
}

/// Body of `PATCH /api/signup/status`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupStatusRequest {
    pub target_status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupStatusView {
    pub status: String,
}

/// Read view of both progress markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    pub status: Option<String>,
    pub stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub role: Role,
}

impl From<&Account> for PublicUser {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            email: account.email.clone(),
            full_name: account.profile.full_name.clone(),
            role: account.role(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRegistration {
    pub token: String,
    pub user: PublicUser,
}

/// Body of `POST /api/signup/login`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub account_id: Uuid,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}
