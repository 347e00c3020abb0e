//! Welcome notifications sent when a registration completes.
//!
//! Delivery is best-effort: callers log failures and carry on.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::error::NotifyError;

/// Who to welcome.
#[derive(Debug, Clone)]
pub struct WelcomeRecipient {
    pub email: String,
    pub full_name: Option<String>,
}

/// Messaging collaborator used at the end of onboarding.
#[async_trait]
pub trait WelcomeNotifier: Send + Sync {
    async fn send_welcome(&self, recipient: &WelcomeRecipient) -> Result<(), NotifyError>;
}

/// Notifier that only logs. Used when no SMTP relay is configured.
pub struct LogNotifier;

#[async_trait]
impl WelcomeNotifier for LogNotifier {
    async fn send_welcome(&self, recipient: &WelcomeRecipient) -> Result<(), NotifyError> {
        info!(email = %recipient.email, "Welcome notification (SMTP not configured)");
        Ok(())
    }
}

/// SMTP relay settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set (welcome mail disabled).
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let host = lookup("SMTP_HOST")?;
        let port = lookup("SMTP_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);
        let username = lookup("SMTP_USERNAME").unwrap_or_default();
        let password = SecretString::from(lookup("SMTP_PASSWORD").unwrap_or_default());
        let from_address = lookup("SMTP_FROM_ADDRESS").unwrap_or_else(|| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Sends the welcome mail through an SMTP relay.
pub struct SmtpNotifier {
    config: SmtpConfig,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, recipient: &WelcomeRecipient) -> Result<Message, NotifyError> {
        let from: Mailbox = self
            .config
            .from_address
            .parse()
            .map_err(|e| NotifyError::InvalidAddress {
                address: self.config.from_address.clone(),
                reason: format!("{e}"),
            })?;
        let to: Mailbox = recipient
            .email
            .parse()
            .map_err(|e| NotifyError::InvalidAddress {
                address: recipient.email.clone(),
                reason: format!("{e}"),
            })?;
        let greeting = match recipient.full_name.as_deref() {
            Some(name) if !name.is_empty() => format!("Hi {name},"),
            _ => "Hi,".to_string(),
        };

        Message::builder()
            .from(from)
            .to(to)
            .subject("Welcome aboard")
            .body(format!(
                "{greeting}\n\nYour registration is complete and your account is ready.\n"
            ))
            .map_err(|e| NotifyError::Build(e.to_string()))
    }
}

#[async_trait]
impl WelcomeNotifier for SmtpNotifier {
    async fn send_welcome(&self, recipient: &WelcomeRecipient) -> Result<(), NotifyError> {
        let email = self.build_message(recipient)?;
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&self.config.host)
            .map_err(|e| NotifyError::SendFailed(format!("SMTP relay error: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build();

        // lettre's SMTP transport is blocking
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| NotifyError::SendFailed(format!("SMTP task failed: {e}")))?
            .map_err(|e| NotifyError::SendFailed(format!("SMTP send failed: {e}")))?;

        info!(email = %recipient.email, "Welcome email sent");
        Ok(())
    }
}
