mod channel;
mod chunker;
mod config;
mod peer;
mod reclaim;
mod restore;
mod routes;
mod state;
mod store;
mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::{mpsc, Semaphore};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::channel::{ChannelRole, MulticastChannel};
use crate::config::Config;
use crate::peer::{Peer, INBOUND_WORKERS, OUTBOUND_WORKERS};
use crate::restore::RestoreRegistry;
use crate::state::PeerState;
use crate::store::ChunkStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burrow_peer=debug,burrow_protocol=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.root).await?;

    let store = ChunkStore::new(&config.root).await?;
    let state = PeerState::load(config.peer_id, &config.root, config.default_capacity);
    state.refresh_occupation(&store).await;
    info!(
        "Peer {}: occupation {} of {} bytes",
        config.peer_id,
        state.occupation(),
        state.capacity()
    );

    let control = Arc::new(MulticastChannel::bind(ChannelRole::Control, config.control_group)?);
    let backup_data = Arc::new(MulticastChannel::bind(ChannelRole::Backup, config.backup_group)?);
    let restore_data = Arc::new(MulticastChannel::bind(ChannelRole::Restore, config.restore_group)?);

    // Three independent receive loops feed one inbound queue.
    let (inbound_tx, inbound_rx) = mpsc::channel(256);
    for channel in [control.clone(), backup_data.clone(), restore_data.clone()] {
        tokio::spawn(channel.recv_loop(inbound_tx.clone()));
    }
    drop(inbound_tx);

    let api_port = config.api_port;
    let peer_id = config.peer_id;
    let peer = Arc::new(Peer {
        config,
        state,
        store,
        control,
        backup_data,
        restore_data,
        restores: RestoreRegistry::new(),
        inbound_permits: Arc::new(Semaphore::new(INBOUND_WORKERS)),
        outbound_permits: Arc::new(Semaphore::new(OUTBOUND_WORKERS)),
    });

    tokio::spawn(tasks::run_dispatcher(peer.clone(), inbound_rx));
    info!("Peer {} is live", peer_id);

    let app = Router::new()
        .route("/backup", post(routes::backup))
        .route("/restore", post(routes::restore))
        .route("/delete", post(routes::delete))
        .route("/reclaim", post(routes::reclaim))
        .route("/state", get(routes::state_report))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(routes::AppState { peer });

    let addr: SocketAddr = format!("0.0.0.0:{}", api_port).parse()?;
    info!("Operator API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
