use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use yankcord_hub::config::HubConfig;
use yankcord_hub::db::{default_opus_config, InMemoryPersistence};
use yankcord_hub::gateway;
use yankcord_hub::hub::Hub;
use yankcord_hub::models::{Channel, ChannelKind};
use yankcord_hub::sfu::InProcessSfu;

#[tokio::main]
async fn main() -> Result<()> {
    let config = HubConfig::load()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    match config.logging.format.as_str() {
        "json" => {
            fmt().with_env_filter(filter).json().init();
        }
        _ => {
            fmt().with_env_filter(filter).init();
        }
    }

    tracing::info!("Starting Yankcord hub v{}", env!("CARGO_PKG_VERSION"));

    let persistence = Arc::new(InMemoryPersistence::new(1, config.auth.clone()));
    seed_default_channels(&persistence);

    let sfu = Arc::new(InProcessSfu::new());
    let hub = Arc::new(Hub::new(config.clone(), persistence, sfu));

    let app = gateway::build_router(hub.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub.clone()))
        .await?;

    tracing::info!("Yankcord hub stopped gracefully");
    Ok(())
}

/// Seed the default text/voice channel pair so a freshly-started hub has
/// somewhere for clients to subscribe to, mirroring the default-server seed
/// a first-run deployment needs.
fn seed_default_channels(persistence: &InMemoryPersistence) {
    let general_id = Uuid::parse_str("00000000-0000-7000-8000-000000000010").unwrap();
    persistence.seed_channel(Channel {
        channel_id: general_id,
        kind: ChannelKind::Text,
        name: "general".to_string(),
        position: 0,
        codec: default_opus_config(),
    });

    let voice_id = Uuid::parse_str("00000000-0000-7000-8000-000000000011").unwrap();
    persistence.seed_channel(Channel {
        channel_id: voice_id,
        kind: ChannelKind::Voice,
        name: "Voice".to_string(),
        position: 1,
        codec: default_opus_config(),
    });

    tracing::info!("seeded default #general and Voice channels");
}

/// Stop accepting new connections, then ask every live connection to close
/// with 1001 (going away) so clients can reconnect cleanly.
async fn shutdown_signal(hub: Arc<Hub>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, closing {} connection(s)", hub.registry.len());
    for username in hub.registry.online_usernames() {
        if let Some(handle) = hub.registry.connection_for_username(&username) {
            handle.request_close(1001);
        }
    }
}
