use anyhow::Result;
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nitcat_service::{
    api::{self, AppState},
    auth::Sessions,
    config::Config,
    control::service::SimulationService,
    db::{self, PgStore},
    local_store::LocalStore,
    notify::Notifier,
    remote::{MemoryStore, Remote},
    repository::Repository,
};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine, the variables may come from the environment.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;

    let remote = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url).await?;
            db::run_migrations(&pool).await?;
            Remote::Postgres(PgStore::new(pool))
        }
        None => Remote::Memory(MemoryStore::new()),
    };
    info!(remote = remote.kind(), "Remote store ready");

    let local = match &config.cache_snapshot_path {
        Some(path) => LocalStore::with_snapshot(path).await,
        None => LocalStore::new(),
    };

    let repo = Repository::new(
        local,
        remote,
        config.threshold_source,
        config.chart_history_len,
    );
    let sessions = Sessions::new(config.session_secret.clone());
    let notifier = Notifier::new(config.notify_webhook_url.clone());

    let (stop_tx, stop_rx) = watch::channel(false);
    let simulation = SimulationService::new(
        repo.clone(),
        sessions.clone(),
        notifier.clone(),
        config.simulation_policy,
        config.simulation_interval,
    );
    let simulation = tokio::spawn(simulation.run(stop_rx));

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");

    let state = AppState {
        repo,
        sessions,
        notifier,
    };
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = stop_tx.send(true);
    simulation.await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
