//! Selene host server.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use selene::{
    admin_router, crypto, moonlight_http_router, moonlight_https_router, rtsp, streaming, tls,
    AppState, Settings,
};

/// Selene - Moonlight-compatible game-streaming host
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port of the plain-HTTP Moonlight endpoint (pairing)
    #[arg(long)]
    http_port: Option<u16>,

    /// Port of the mutual-TLS Moonlight endpoint (launch)
    #[arg(long)]
    https_port: Option<u16>,

    /// Root directory for host state and certificates
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging - use RUST_LOG env var or default to info
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let settings = Settings::load(args.http_port, args.https_port, args.data_dir)?;
    info!("Configuration loaded (data dir {:?})", settings.data_dir);

    let state = AppState::bootstrap(settings.clone()).await?;
    info!(
        "Host '{}' ({}) ready: {} paired clients, {} apps",
        state.store().hostname(),
        state.store().uuid(),
        state.store().paired_clients().len(),
        state.store().apps().len()
    );

    let cancel = CancellationToken::new();

    // ctrl-c flips the token every service watches
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
            info!("Received Ctrl+C, shutting down gracefully...");
            cancel.cancel();
        });
    }

    // streaming supervisor
    tokio::spawn(streaming::run(state.clone(), cancel.clone()));

    // RTSP negotiator
    {
        let state = state.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = rtsp::run_rtsp_server(state, cancel).await {
                error!("RTSP server error: {}", e);
            }
        });
    }

    // localhost admin API
    {
        let listener =
            TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], settings.admin_port))).await?;
        info!("Admin API listening on {}", listener.local_addr()?);
        let app = admin_router(state.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Admin API server error: {}", e);
            }
        });
    }

    // mutual-TLS Moonlight endpoint
    {
        let cert_pem = crypto::cert_to_pem(state.store().host_cert())?;
        let key_pem = crypto::pkey_to_pem(state.store().host_key())?;
        let config = tls::build_server_config(&cert_pem, &key_pem)?;
        let listener =
            TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], settings.https_port))).await?;
        let app = moonlight_https_router(state.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tls::serve(listener, config, app, cancel).await {
                error!("TLS endpoint error: {}", e);
            }
        });
    }

    // plain-HTTP Moonlight endpoint (pairing), served in the foreground
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], settings.http_port))).await?;
    info!("HTTP endpoint listening on {}", listener.local_addr()?);
    let app = moonlight_http_router(state);
    let shutdown = {
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    info!("Server shutting down");
    Ok(())
}
