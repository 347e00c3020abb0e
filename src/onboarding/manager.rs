//! OnboardingManager — coordinates registration, stage advancement, profile
//! completion and token issuance over an [`AccountStore`].

use std::sync::{Arc, LazyLock};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{SessionClaims, TokenIssuer, hash_password, verify_password};
use crate::error::{DatabaseError, SignupError};
use crate::notify::{WelcomeNotifier, WelcomeRecipient};
use crate::store::{AccountStore, StageWrite};

use super::model::{
    Account, AdvanceStageRequest, CompletedRegistration, LoginRequest, LoginResponse, NewAccount,
    PaymentCompletion, ProfileUpdate, ProgressView, PublicUser, Registration, RegistrationRequest,
    SignupStatusRequest, SignupStatusView, StageProgress,
};
use super::state::{AdvanceMode, Regression, Stage, Transition, advance};

/// Lowercase letters and digits, 4 to 30 characters.
static HANDLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]{4,30}$").unwrap());

/// How often a compare-and-swap stage write is retried after losing a race.
const MAX_STAGE_ATTEMPTS: usize = 3;

/// Coordinates the signup flow against persisted state only. Holds no
/// per-account state in memory.
pub struct OnboardingManager {
    store: Arc<dyn AccountStore>,
    tokens: Arc<TokenIssuer>,
    notifier: Arc<dyn WelcomeNotifier>,
}

impl OnboardingManager {
    pub fn new(
        store: Arc<dyn AccountStore>,
        tokens: Arc<TokenIssuer>,
        notifier: Arc<dyn WelcomeNotifier>,
    ) -> Self {
        Self {
            store,
            tokens,
            notifier,
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Start (or restart) a registration.
    ///
    /// An identity held by a finished registration is a conflict. Identities
    /// held only by incomplete registrations are released: those rows are
    /// replaced by the new account in the same transaction.
    pub async fn register(&self, req: RegistrationRequest) -> Result<Registration, SignupError> {
        let email = required(req.email.as_deref(), "email")?.to_lowercase();
        let handle = required(req.handle.as_deref(), "handle")?.to_lowercase();
        let phone = required(req.phone.as_deref(), "phone")?.to_string();
        let password = req
            .password
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| SignupError::validation("password is required"))?;
        if req.terms_accepted != Some(true) {
            return Err(SignupError::validation("Terms of service must be accepted"));
        }
        if !HANDLE_PATTERN.is_match(&handle) {
            return Err(SignupError::InvalidHandle);
        }

        let matches = self
            .store
            .find_identity_matches(&email, &handle, &phone)
            .await?;
        if let Some(finished) = matches.iter().find(|m| m.is_terminal()) {
            info!(
                existing = %finished.account.id,
                "Registration rejected: identity belongs to a completed account"
            );
            return Err(SignupError::AlreadyExists);
        }
        let replace: Vec<Uuid> = matches.iter().map(|m| m.account.id).collect();

        let new_account = NewAccount {
            id: Uuid::new_v4(),
            email,
            handle,
            phone,
            password_hash: hash_credential(password.to_string()).await?,
            created_at: Utc::now(),
        };
        let account = self.store.create_account(&new_account, &replace).await?;

        if replace.is_empty() {
            info!(account_id = %account.id, "Registration started");
        } else {
            info!(
                account_id = %account.id,
                replaced = ?replace,
                "Registration restarted over incomplete signup"
            );
        }

        Ok(Registration {
            account_id: account.id,
            stage: account.stage.marker_name().to_string(),
            token: self.session_token(&account)?,
        })
    }

    // ── Stage advancement ───────────────────────────────────────────

    /// Advance the account's stage marker: requesting the current stage
    /// completes it. Completing `payment` with a payment reference also
    /// records the payment.
    pub async fn advance_stage(
        &self,
        account_id: Uuid,
        req: AdvanceStageRequest,
    ) -> Result<StageProgress, SignupError> {
        let requested: Stage = req.target_stage.parse().map_err(SignupError::Validation)?;
        let payment = non_blank(req.payment_ref.as_deref()).map(|reference| PaymentCompletion {
            payment_reference: reference.to_string(),
            subscription_reference: non_blank(req.subscription_ref.as_deref()).map(str::to_string),
        });

        for attempt in 1..=MAX_STAGE_ATTEMPTS {
            let account = self
                .store
                .get_account(account_id)
                .await?
                .ok_or(SignupError::NotFound(account_id))?;

            let transition = advance(account.stage, requested, AdvanceMode::CompleteCurrent)
                .map_err(regression)?;
            let write = match (transition, &payment) {
                (Transition::Unchanged(stage), _) => return Ok(StageProgress::at(stage)),
                (Transition::Advance { from: Stage::Payment, .. }, Some(payment)) => {
                    self.store.complete_payment(account_id, payment).await?
                }
                (Transition::Advance { from, to }, _) => {
                    self.store.swap_account_stage(account_id, from, to).await?
                }
            };

            match write {
                StageWrite::Applied => return Ok(StageProgress::at(transition.resulting())),
                StageWrite::Missing => return Err(SignupError::NotFound(account_id)),
                StageWrite::Stale => {
                    debug!(account_id = %account_id, attempt, "Stage changed concurrently, re-reading");
                }
            }
        }

        Err(contended("advance_stage", account_id))
    }

    /// Move the signup-status tracker straight to the requested status.
    pub async fn update_signup_status(
        &self,
        account_id: Uuid,
        req: SignupStatusRequest,
    ) -> Result<SignupStatusView, SignupError> {
        let requested: Stage = req.target_status.parse().map_err(SignupError::Validation)?;

        for attempt in 1..=MAX_STAGE_ATTEMPTS {
            let record = self
                .store
                .get_signup_status(account_id)
                .await?
                .ok_or(SignupError::NotStarted)?;

            let (from, to) = match advance(record.status, requested, AdvanceMode::JumpTo)
                .map_err(regression)?
            {
                Transition::Unchanged(stage) => return Ok(status_view(stage)),
                Transition::Advance { from, to } => (from, to),
            };

            match self.store.swap_signup_status(account_id, from, to).await? {
                StageWrite::Applied => {
                    info!(account_id = %account_id, from = %from, to = %to, "Signup status updated");
                    return Ok(status_view(to));
                }
                StageWrite::Missing => return Err(SignupError::NotStarted),
                StageWrite::Stale => {
                    debug!(account_id = %account_id, attempt, "Signup status changed concurrently, re-reading");
                }
            }
        }

        Err(contended("update_signup_status", account_id))
    }

    /// Both progress markers for one account.
    pub async fn signup_progress(&self, account_id: Uuid) -> Result<ProgressView, SignupError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(SignupError::NotFound(account_id))?;
        let status = self.store.get_signup_status(account_id).await?;

        Ok(ProgressView {
            status: status.map(|record| record.status.status_name().to_string()),
            stage: account.stage.marker_name().to_string(),
        })
    }

    // ── Profile & completion ────────────────────────────────────────

    /// Persist the recognized profile fields of `body` and mark the profile
    /// completed.
    pub async fn update_profile(
        &self,
        account_id: Uuid,
        body: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SignupError> {
        let update = ProfileUpdate::from_json(body)?;
        if update.is_empty() {
            return Err(SignupError::validation("No recognized profile fields supplied"));
        }

        if !self.store.update_profile(account_id, &update).await? {
            return Err(SignupError::NotFound(account_id));
        }
        info!(account_id = %account_id, fields = update.changes.len(), "Profile completed");
        Ok(())
    }

    /// Finish the registration and issue a session token. Idempotent.
    pub async fn complete_registration(
        &self,
        account_id: Uuid,
    ) -> Result<CompletedRegistration, SignupError> {
        let account = self
            .store
            .mark_completed(account_id)
            .await?
            .ok_or(SignupError::NotFound(account_id))?;
        info!(account_id = %account.id, "Registration completed");

        let recipient = WelcomeRecipient {
            email: account.email.clone(),
            full_name: account.profile.full_name.clone(),
        };
        if let Err(e) = self.notifier.send_welcome(&recipient).await {
            warn!(account_id = %account.id, error = %e, "Welcome notification failed");
        }

        Ok(CompletedRegistration {
            token: self.session_token(&account)?,
            user: PublicUser::from(&account),
        })
    }

    // ── Sessions ────────────────────────────────────────────────────

    /// Exchange credentials for a session token so an applicant can resume.
    /// Unknown email and wrong password are indistinguishable.
    pub async fn login(&self, req: LoginRequest) -> Result<LoginResponse, SignupError> {
        let email = req.email.trim().to_lowercase();
        let Some(account) = self.store.get_account_by_email(&email).await? else {
            debug!("Login rejected: unknown email");
            return Err(SignupError::Unauthorized);
        };
        if !check_credential(req.password, account.password_hash.clone()).await? {
            debug!("Login rejected: wrong password");
            return Err(SignupError::Unauthorized);
        }
        let status = self.store.get_signup_status(account.id).await?;

        Ok(LoginResponse {
            token: self.session_token(&account)?,
            account_id: account.id,
            stage: account.stage.marker_name().to_string(),
            status: status.map(|record| record.status.status_name().to_string()),
        })
    }

    fn session_token(&self, account: &Account) -> Result<String, SignupError> {
        self.tokens
            .issue(account.id, &account.email, account.role())
            .map_err(|e| SignupError::Credential(e.to_string()))
    }

    /// Resolve a bearer token to its claims.
    pub fn authenticate(&self, bearer: Option<&str>) -> Result<SessionClaims, SignupError> {
        let token = bearer.ok_or(SignupError::Unauthorized)?;
        self.tokens.verify(token).map_err(|e| {
            debug!(error = %e, "Session token rejected");
            SignupError::Unauthorized
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Argon2 is CPU-bound; keep it off the async workers.
async fn hash_credential(password: String) -> Result<String, SignupError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| SignupError::Credential(e.to_string()))?
        .map_err(|e| SignupError::Credential(e.to_string()))
}

async fn check_credential(password: String, stored: String) -> Result<bool, SignupError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &stored))
        .await
        .map_err(|e| SignupError::Credential(e.to_string()))
}

/// A present, non-blank field, trimmed.
fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, SignupError> {
    non_blank(value).ok_or_else(|| SignupError::validation(format!("{field} is required")))
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn regression(r: Regression) -> SignupError {
    SignupError::Regression {
        current: r.current.to_string(),
        requested: r.requested.to_string(),
    }
}

fn status_view(stage: Stage) -> SignupStatusView {
    SignupStatusView {
        status: stage.status_name().to_string(),
    }
}

fn contended(op: &str, account_id: Uuid) -> SignupError {
    warn!(account_id = %account_id, op, "Gave up after repeated concurrent stage changes");
    SignupError::Internal(DatabaseError::Query(format!(
        "{op}: stage of {account_id} kept changing"
    )))
}
