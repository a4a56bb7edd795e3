//! MirrorBot - Copy-Trading Replication Engine
//!
//! One master brokerage account trades; the engine polls it through the
//! broker HTTP API and mirrors entries and exits into the configured child
//! accounts. The admin surface handles broker logins and account settings.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirrorbot_backend::{
    api::{self, AppState},
    broker::KiteSessions,
    models::{load_account_configs, Config},
    replication::{ReplicationPoller, ReplicationSettings},
    store::Database,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    info!("🚀 MirrorBot replication engine starting");
    info!(
        master = %config.master_user_id,
        poll_secs = config.poll_interval_secs,
        dry_run = config.dry_run,
        "replication configuration loaded"
    );
    if !config.dry_run {
        warn!("⚠️  DRY_RUN disabled - real orders will be placed");
    }

    let db = Database::open(&config.database_path)?;
    info!("💾 Database initialized at: {}", config.database_path);

    // Credentials come from configuration, never from the HTTP surface.
    let accounts_path = Path::new(&config.accounts_file);
    if accounts_path.exists() {
        let configs = load_account_configs(accounts_path)?;
        db.accounts()
            .sync_from_config(&configs)
            .context("Failed to sync configured accounts")?;
        info!("🔗 Synced {} configured accounts", configs.len());
    } else {
        warn!(
            "accounts file {} not found; accounts must be linked via the admin API",
            config.accounts_file
        );
    }

    let sessions = Arc::new(KiteSessions::new(config.kite_base_url.clone()));
    let reset_requested = Arc::new(AtomicBool::new(false));

    let settings = ReplicationSettings::from_config(&config);
    let poller = ReplicationPoller::new(
        settings,
        &db,
        sessions.clone(),
        reset_requested.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller_handle = tokio::spawn(poller.run(shutdown_rx));

    let state = AppState {
        config: config.clone(),
        db,
        sessions,
        reset_requested,
    };
    let app = api::router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 Admin API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Stop the poller at a tick boundary; a tick in flight completes.
    let _ = shutdown_tx.send(true);
    let _ = poller_handle.await;
    info!("👋 MirrorBot stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl-C; shutting down");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirrorbot_backend=debug,mirrorbot=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
