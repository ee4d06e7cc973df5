use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wishlist::config::Config;
use wishlist::controller::Controller;
use wishlist::engine::Engine;
use wishlist::http::{self, AppState};
use wishlist::limiter::{self, AdmissionLimiter};
use wishlist::store::{self, InMemoryStore, WishStore};

const COMPACT_CHECK_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    wishlist::observability::init(config.metrics_port)?;

    let store = match config.wal_path() {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            InMemoryStore::open(&path)?
        }
        None => InMemoryStore::new(),
    };

    if let Some(seed_file) = &config.seed_file {
        let wishes = wishlist::seed::load(seed_file)?;
        wishlist::seed::apply(&store, &config.namespace, wishes).await?;
    }

    let shared: Arc<dyn WishStore> = Arc::new(store.clone());
    let engine = Engine::new(shared, config.namespace.clone());
    let limiter = Arc::new(AdmissionLimiter::new(config.rate_limit, config.rate_burst)?);
    let cancel = CancellationToken::new();

    let controller = tokio::spawn(
        Controller::new(
            engine.clone(),
            config.max_concurrent_reconciles,
            config.request_timeout,
        )
        .run(cancel.clone()),
    );
    let evictor = tokio::spawn(limiter::run_evictor(
        limiter.clone(),
        config.limiter_idle,
        cancel.clone(),
    ));
    let compactor = config.wal_path().map(|_| {
        tokio::spawn(store::run_compactor(
            store.clone(),
            config.compact_threshold,
            COMPACT_CHECK_PERIOD,
            cancel.clone(),
        ))
    });

    let app = http::router(AppState {
        engine,
        limiter,
        request_timeout: config.request_timeout,
        shutdown: cancel.clone(),
    });

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("wishlist listening on {addr}");
    info!("  namespace: {}", config.namespace);
    let store_desc = config
        .wal_path()
        .map_or("in-memory".to_string(), |p| p.display().to_string());
    info!("  store: {store_desc}");
    info!("  rate limit: {}/s burst {}", config.rate_limit, config.rate_burst);
    let metrics_desc = config
        .metrics_port
        .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"));
    info!("  metrics: {metrics_desc}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("http server stopped, shutting down background tasks");
    cancel.cancel();
    let _ = controller.await;
    let _ = evictor.await;
    if let Some(compactor) = compactor {
        let _ = compactor.await;
    }
    store.sync().await;

    info!("wishlist stopped");
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
    info!("shutdown signal received, draining requests");
}
