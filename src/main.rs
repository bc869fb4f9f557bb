use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use sms_cadence::api::{self, AppState};
use sms_cadence::catalog::seed::load_seed;
use sms_cadence::config::EngineConfig;
use sms_cadence::conversation::ConversationEngine;
use sms_cadence::delivery::{Dispatcher, Scheduler, SendPolicy, spawn_scheduler};
use sms_cadence::event_log::EventLog;
use sms_cadence::injector::{Injector, spawn_reaper};
use sms_cadence::recipients::RecipientLocks;
use sms_cadence::store::{Database, LibSqlBackend};
use sms_cadence::transport::{LogTransport, Transport, TwilioTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = EngineConfig::from_env().context("invalid configuration")?;

    eprintln!("📨 SMS Cadence v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   HTTP: http://0.0.0.0:{}", config.http.port);
    eprintln!("   Tick: {} ({})", config.scheduler.tick_cron, config.scheduler.server_timezone);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    if let Some(seed) = &config.catalog_seed {
        let count = load_seed(store.as_ref(), seed)
            .await
            .with_context(|| format!("failed to load catalog seed {}", seed.display()))?;
        eprintln!("   Catalog: {count} templates from {}", seed.display());
    }

    // ── Transport ────────────────────────────────────────────────────────
    let transport: Arc<dyn Transport> = match &config.twilio {
        Some(twilio) => {
            eprintln!("   Transport: twilio (from {})", twilio.from_number);
            Arc::new(TwilioTransport::new(twilio.clone()))
        }
        None => {
            eprintln!("   Transport: dry-run (TWILIO_* not set)");
            Arc::new(LogTransport::new())
        }
    };

    // ── Engine ───────────────────────────────────────────────────────────
    let locks = Arc::new(RecipientLocks::new());
    let log = EventLog::new(Arc::clone(&store));
    let send_timeout = config.scheduler.send_timeout;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&transport),
        SendPolicy::new(config.policy.clone()),
        log.clone(),
        send_timeout,
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher),
        Arc::clone(&locks),
        log.clone(),
        config.scheduler.clone(),
    ));
    let engine = Arc::new(ConversationEngine::new(
        Arc::clone(&store),
        transport,
        Arc::clone(&locks),
        log.clone(),
        config.conversation.clone(),
        send_timeout,
    ));
    let injector = Arc::new(Injector::new(
        Arc::clone(&store),
        dispatcher,
        locks,
        log,
        config.injector.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = spawn_scheduler(scheduler, shutdown_rx.clone())?;
    let reaper_handle = spawn_reaper(Arc::clone(&injector), shutdown_rx);

    if config.http.admin_token.is_none() {
        eprintln!("   Admin: disabled (SMS_ADMIN_TOKEN not set)");
    }
    eprintln!();

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api::router(AppState {
        engine,
        injector,
        admin_token: config.http.admin_token.clone(),
    });
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http.port))?;
    tracing::info!(port = config.http.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for ctrl-c: {e}");
            }
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    let _ = reaper_handle.await;
    Ok(())
}
