use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use game_edge::config::{redact_url, Config};
use game_edge::create_router;
use game_edge::game::registry::SessionRegistry;
use game_edge::game::session::SessionSettings;
use game_edge::middleware::auth::JwtVerifier;
use game_edge::services::results::LoggingResultSink;
use game_edge::services::store::{wait_until_reachable, RedisStore, RetryPolicy, SnapshotStore};
use game_edge::services::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let verifier = JwtVerifier::from_optional_pem(config.jwt_public_key.as_deref())
        .map_err(|e| anyhow::anyhow!("JWT_PUBLIC_KEY is not a valid RSA public key: {e}"))?;
    if !verifier.is_configured() {
        tracing::warn!("JWT_PUBLIC_KEY not set, every connection will be rejected");
    }

    tracing::info!(redis = %redact_url(&config.redis_url), "connecting to store");
    let store: Arc<dyn SnapshotStore> = Arc::new(RedisStore::new(&config.redis_url)?);
    wait_until_reachable(store.as_ref(), &RetryPolicy::default()).await?;

    let registry = Arc::new(SessionRegistry::new(
        SessionSettings::default(),
        Arc::clone(&store),
        Arc::new(LoggingResultSink),
    ));

    let grace = config.shutdown_grace;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = Arc::new(AppState::new(Arc::clone(&registry), verifier, store));
    let app = create_router(state);

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let stop_accepting = CancellationToken::new();
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let stop_accepting = stop_accepting.clone();
        async move { stop_accepting.cancelled().await }
    });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server => {
            result??;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    stop_accepting.cancel();
    if tokio::time::timeout(grace, &mut server).await.is_err() {
        tracing::warn!(?grace, "http drain did not finish in time");
    }

    registry.shutdown_all(grace).await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
