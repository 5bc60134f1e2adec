mod api;
mod config;
mod error;
mod feed;
mod relay;
mod websocket;

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::api::{create_api_router, ApiState};
use crate::config::{Config, UPDATE_CHANNEL_SIZE};
use crate::feed::{FeedIngestor, FeedStatus};
use crate::relay::Broadcaster;
use crate::websocket::{route_request, ConnectionHandler, ConnectionSettings, WEBSOCKET_PATH};

async fn handle_websocket_connection_with_routing(
    stream: TcpStream,
    peer_addr: String,
    broadcaster: Arc<Broadcaster>,
    settings: ConnectionSettings,
    ws_config: WebSocketConfig,
    cancel: CancellationToken,
) {
    use tokio_tungstenite::accept_hdr_async_with_config;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    let ws_stream = match accept_hdr_async_with_config(stream, |req: &Request, response: Response| {
        info!("WebSocket connection request for path: {} from {}", req.uri().path(), peer_addr);
        route_request(req, response)
    }, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    ConnectionHandler::new(broadcaster, settings, peer_addr)
        .handle(ws_stream, cancel)
        .await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let cancel = CancellationToken::new();

    // Compose the relay
    let broadcaster = Arc::new(Broadcaster::new());
    let ingestor = Arc::new(FeedIngestor::new(config.upstream_url.clone(), config.reconnect_config()));
    let (update_tx, update_rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);

    let feed_ingestor = ingestor.clone();
    let feed_cancel = cancel.clone();
    tokio::spawn(async move {
        match feed_ingestor.run(update_tx, feed_cancel).await {
            Ok(()) => info!("Feed ingestor stopped"),
            Err(e) => error!("Feed ingestor stopped: {}", e),
        }
    });

    let dispatch_broadcaster = broadcaster.clone();
    let dispatch_cancel = cancel.clone();
    tokio::spawn(async move {
        dispatch_broadcaster.run(update_rx, dispatch_cancel).await;
    });

    start_background_tasks(
        broadcaster.clone(),
        ingestor.status(),
        Duration::from_secs(config.stats_interval_secs),
        cancel.clone(),
    );

    // Start API server
    let api_state = ApiState {
        broadcaster: broadcaster.clone(),
        feed_status: ingestor.status(),
        started_at: Utc::now(),
    };
    let api_router = create_api_router(api_state)
        .layer(CorsLayer::permissive());

    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("HTTP API server running at http://{}", config.api_bind_address);

    let api_cancel = cancel.clone();
    let api_server = axum::serve(api_listener, api_router)
        .with_graceful_shutdown(async move { api_cancel.cancelled().await });

    // Start WebSocket server
    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    info!("WebSocket server running at ws://{}{}", config.bind_address, WEBSOCKET_PATH);

    let connection_settings = config.connection_settings();
    let ws_config = connection_settings.websocket_config();
    let ws_broadcaster = broadcaster.clone();
    let ws_cancel = cancel.clone();

    let websocket_server = async move {
        loop {
            let (stream, addr) = tokio::select! {
                _ = ws_cancel.cancelled() => break,
                accepted = ws_listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let broadcaster = ws_broadcaster.clone();
            let settings = connection_settings.clone();
            let cancel = ws_cancel.clone();

            tokio::spawn(async move {
                handle_websocket_connection_with_routing(
                    stream,
                    addr.to_string(),
                    broadcaster,
                    settings,
                    ws_config,
                    cancel,
                ).await;
            });
        }
    };

    info!("Relay ready");
    tokio::select! {
        result = api_server => {
            if let Err(e) = result {
                error!("API server stopped: {}", e);
            }
        }
        _ = websocket_server => {
            info!("WebSocket server stopped");
        }
        _ = shutdown_signal() => {}
    }

    cancel.cancel();
    info!("Relay stopped");

    Ok(())
}

fn start_background_tasks(
    broadcaster: Arc<Broadcaster>,
    feed_status: Arc<FeedStatus>,
    every: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut interval_timer = interval(every);
        // The first tick completes immediately.
        interval_timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval_timer.tick() => {
                    let feed = feed_status.snapshot();
                    info!("Stats - Subscribers: {}, Dispatched: {}, Feed: {:?}, Frames: {}, Updates: {}, Decode errors: {}, Schema mismatches: {}",
                          broadcaster.subscriber_count(), broadcaster.dispatched(), feed.state,
                          feed.frames, feed.updates, feed.decode_errors, feed.schema_mismatches);
                }
            }
        }
    });

    info!("Started stats monitoring task (every {} seconds)", every.as_secs());
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
