mod cache;
mod config;
mod control;
mod control_plane;
mod error;
mod ingress;
mod introspection;
mod janitor;
mod pending;
mod ratelimit;
mod registry;
mod relay;
mod session;
mod stats;
mod wire;

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::relay::Relay;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_relay=info,tower_http=info".into()),
        )
        .init();
}

/// Spawns a task that listens for Ctrl+C and SIGTERM, then cancels `shutdown`.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received Ctrl+C, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received Ctrl+C, shutting down");
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    init_tracing();

    let config = Config::from_env()?;
    let relay = Relay::new(config);
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let ctrl_relay = relay.clone();
    let ctrl_shutdown = shutdown.clone();
    let ctrl_handle = tokio::spawn(async move { control::run(ctrl_relay, ctrl_shutdown).await });

    let janitor_handle = tokio::spawn(janitor::run(relay.clone(), shutdown.clone()));

    let addr = SocketAddr::new(relay.config.http_host.parse()?, relay.config.http_port);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "public ingress listening");

    let app = Router::new()
        .fallback(ingress::handler)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(relay.clone());

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    janitor_handle.await.ok();
    if let Ok(Err(e)) = ctrl_handle.await {
        tracing::error!(error = %e, "control channel task exited with an error");
    }

    Ok(())
}
