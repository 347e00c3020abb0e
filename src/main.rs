use std::str::FromStr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use signup_engine::auth::TokenIssuer;
use signup_engine::config::ServiceConfig;
use signup_engine::notify::{LogNotifier, SmtpConfig, SmtpNotifier, WelcomeNotifier};
use signup_engine::onboarding::{OnboardingManager, Reaper, signup_routes, spawn_reaper_task};
use signup_engine::store::{AccountStore, LibSqlBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage (SMTP)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "Failed to install rustls crypto provider")?;

    let config = ServiceConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export SIGNUP_TOKEN_SECRET=<at least 32 random bytes>");
        std::process::exit(1);
    });

    // Initialize tracing; keep the guard alive so buffered file logs flush.
    let _log_guard = init_tracing(&config);

    eprintln!("🧾 Signup Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/signup", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn AccountStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Collaborators ────────────────────────────────────────────────────
    let tokens = Arc::new(TokenIssuer::new(
        config.signup.token_secret.clone(),
        config.signup.token_ttl,
    ));

    let notifier: Arc<dyn WelcomeNotifier> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   Welcome mail: SMTP via {}", smtp.host);
            Arc::new(SmtpNotifier::new(smtp))
        }
        None => {
            eprintln!("   Welcome mail: log only (SMTP_HOST not set)");
            Arc::new(LogNotifier)
        }
    };

    if config.billing.is_configured() {
        eprintln!("   Billing: configured");
    } else {
        eprintln!("   Billing: not configured");
    }

    // ── Reaper ───────────────────────────────────────────────────────────
    let reaper = Arc::new(Reaper::new(Arc::clone(&store), config.signup.retention));
    let schedule = cron::Schedule::from_str(&config.signup.reaper_schedule)?;
    let _reaper_handle = spawn_reaper_task(reaper, schedule);
    eprintln!(
        "   Reaper: \"{}\" (retention {}h)",
        config.signup.reaper_schedule,
        config.signup.retention.num_hours()
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let manager = Arc::new(OnboardingManager::new(store, tokens, notifier));
    let app = signup_routes(manager);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Signup server started");
    axum::serve(listener, app).await?;

    Ok(())
}

/// stderr always; a daily-rolling file as well when a log directory is set.
fn init_tracing(config: &ServiceConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "signup.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}
