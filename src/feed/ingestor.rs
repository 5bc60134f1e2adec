use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::FeedError;
use crate::feed::reconnect::{ReconnectConfig, ReconnectMode, ReconnectPolicy};
use crate::feed::update::{decode_frame, Update};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedState {
    Connecting,
    Connected,
    Disconnected,
    Stopped,
}

/// Counters shared between the ingestor and the stats surfaces.
#[derive(Debug)]
pub struct FeedStatus {
    state: RwLock<FeedState>,
    frames: AtomicU64,
    updates: AtomicU64,
    decode_errors: AtomicU64,
    schema_mismatches: AtomicU64,
    reconnect_attempts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatusSnapshot {
    pub state: FeedState,
    pub frames: u64,
    pub updates: u64,
    pub decode_errors: u64,
    pub schema_mismatches: u64,
    pub reconnect_attempts: u64,
}

impl FeedStatus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(FeedState::Connecting),
            frames: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            schema_mismatches: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> FeedState {
        *self.state.read()
    }

    fn set_state(&self, state: FeedState) {
        *self.state.write() = state;
    }

    pub fn snapshot(&self) -> FeedStatusSnapshot {
        FeedStatusSnapshot {
            state: self.state(),
            frames: self.frames.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            schema_mismatches: self.schema_mismatches.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the single upstream session and turns its frames into [`Update`]s.
pub struct FeedIngestor {
    url: String,
    reconnect: ReconnectConfig,
    status: Arc<FeedStatus>,
}

impl FeedIngestor {
    pub fn new(url: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        Self {
            url: url.into(),
            reconnect,
            status: Arc::new(FeedStatus::new()),
        }
    }

    pub fn status(&self) -> Arc<FeedStatus> {
        self.status.clone()
    }

    /// Runs until cancelled, until the broadcaster goes away, or until the
    /// reconnect policy gives up. Connect and read failures are returned only
    /// once no further attempt will be made.
    pub async fn run(
        &self,
        updates: mpsc::Sender<Update>,
        cancel: CancellationToken,
    ) -> Result<(), FeedError> {
        let mut policy = ReconnectPolicy::new(self.reconnect.clone());

        let result = loop {
            if cancel.is_cancelled() {
                info!("Feed ingestor cancelled");
                break Ok(());
            }

            self.status.set_state(FeedState::Connecting);

            match self.connect_and_run(&updates, &cancel, &mut policy).await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    self.status.set_state(FeedState::Disconnected);
                    error!("Upstream feed error: {}", e);

                    let Some(delay) = policy.next_delay() else {
                        if self.reconnect.mode == ReconnectMode::None {
                            warn!("Upstream reconnect disabled - feed stays down for this run");
                            break Err(e);
                        }
                        break Err(FeedError::MaxReconnectAttemptsExceeded(policy.max_attempts()));
                    };

                    self.status.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                    info!("Reconnecting to upstream feed in {}ms (attempt {})",
                          delay.as_millis(), policy.attempt_count());

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Feed ingestor cancelled during reconnect delay");
                            break Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.status.set_state(FeedState::Stopped);
        result
    }

    async fn connect_and_run(
        &self,
        updates: &mpsc::Sender<Update>,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), FeedError> {
        info!("Connecting to upstream feed {}", self.url);

        let connected = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connected = connect_async(self.url.as_str()) => connected,
        };
        let (mut ws_stream, _response) = connected.map_err(|source| FeedError::Connect {
            url: self.url.clone(),
            source,
        })?;

        policy.reset();
        self.status.set_state(FeedState::Connected);
        info!("Connected to upstream feed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = ws_stream.close(None).await {
                        debug!("Error closing upstream session: {}", e);
                    }
                    return Ok(());
                }
                msg = ws_stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(e) => {
                                self.status.decode_errors.fetch_add(1, Ordering::Relaxed);
                                warn!("Skipping non UTF-8 binary frame: {}", e);
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!("Upstream sent close frame: {:?}", frame);
                            return Err(FeedError::Closed);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(FeedError::Transport(e)),
                        None => return Err(FeedError::Closed),
                    };

                    if !self.handle_frame(&text, updates).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `false` once the update stream has no consumer left.
    async fn handle_frame(&self, text: &str, updates: &mpsc::Sender<Update>) -> bool {
        self.status.frames.fetch_add(1, Ordering::Relaxed);

        match decode_frame(text) {
            Ok(Some(update)) => {
                self.status.updates.fetch_add(1, Ordering::Relaxed);
                if updates.send(update).await.is_err() {
                    warn!("Update stream closed - stopping feed ingestor");
                    return false;
                }
            }
            Ok(None) => {}
            Err(FeedError::SchemaMismatch(reason)) => {
                self.status.schema_mismatches.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping malformed update frame: {}", reason);
            }
            Err(e) => {
                self.status.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping undecodable frame: {}", e);
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use futures::SinkExt;
    use tokio::net::TcpListener;

    const SCENARIO_A: &str = r#"{"action":"update","data":[{"symbol":"XBTUSD","lastPrice":10000.5,"timestamp":"2020-01-01T00:00:00Z"}]}"#;
    const SCENARIO_B: &str = r#"{"action":"partial","data":[{"symbol":"XBTUSD","lastPrice":1.0}]}"#;

    /// Serves `sessions` upstream connections, sending each one `frames`.
    async fn spawn_upstream(frames: Vec<Message>, sessions: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for _ in 0..sessions {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                for frame in &frames {
                    ws.send(frame.clone()).await.unwrap();
                }
                let _ = ws.close(None).await;
            }
        });

        format!("ws://{}/realtime?subscribe=instrument", addr)
    }

    fn text(frame: &str) -> Message {
        Message::Text(frame.to_string())
    }

    fn drain(rx: &mut mpsc::Receiver<Update>) -> Vec<Update> {
        let mut received = Vec::new();
        while let Ok(update) = rx.try_recv() {
            received.push(update);
        }
        received
    }

    #[tokio::test]
    async fn test_ingestor_emits_only_qualifying_updates() {
        let binary_update = r#"{"action":"update","data":[{"symbol":"ETHUSD","lastPrice":200.25,"timestamp":"2020-01-01T00:00:01Z"}]}"#;
        let frames = vec![
            text(r#"{"info":"Welcome to the BitMEX Realtime API."}"#),
            text(SCENARIO_B),
            text("not json"),
            text(r#"{"action":"update","data":[{"symbol":"XBTUSD","lastPrice":"bad","timestamp":"t"}]}"#),
            text(r#"{"action":"update","data":[{"symbol":"ETHUSD","lastPrice":null,"timestamp":"t"}]}"#),
            text(SCENARIO_A),
            Message::Binary(binary_update.as_bytes().to_vec()),
            Message::Binary(vec![0xff, 0xfe, 0xfd]),
        ];
        let url = spawn_upstream(frames, 1).await;
        let ingestor = FeedIngestor::new(url, ReconnectConfig::default());
        let (tx, mut rx) = mpsc::channel(16);

        let result = ingestor.run(tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(FeedError::Closed)));

        let received = drain(&mut rx);
        assert_eq!(received, vec![
            Update::new("XBTUSD", 10000.5, "2020-01-01T00:00:00Z"),
            Update::new("ETHUSD", 200.25, "2020-01-01T00:00:01Z"),
        ]);

        let status = ingestor.status().snapshot();
        assert_eq!(status.state, FeedState::Stopped);
        // The non UTF-8 binary frame is rejected before it counts as a frame.
        assert_eq!(status.frames, 7);
        assert_eq!(status.updates, 2);
        assert_eq!(status.decode_errors, 2);
        assert_eq!(status.schema_mismatches, 1);
        assert_eq!(status.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_connect_failure_is_fatal_without_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ingestor = FeedIngestor::new(format!("ws://{}/realtime", addr), ReconnectConfig::default());
        let (tx, _rx) = mpsc::channel(1);

        let result = ingestor.run(tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(FeedError::Connect { .. })));
        assert_eq!(ingestor.status().state(), FeedState::Stopped);
    }

    #[tokio::test]
    async fn test_fixed_reconnect_resumes_feed() {
        let url = spawn_upstream(vec![text(SCENARIO_A)], 2).await;
        let ingestor = FeedIngestor::new(url, ReconnectConfig {
            mode: ReconnectMode::Fixed,
            delay: Duration::from_millis(10),
            jitter_factor: 0.0,
            max_attempts: 2,
        });
        let (tx, mut rx) = mpsc::channel(16);

        let result = ingestor.run(tx, CancellationToken::new()).await;
        assert!(matches!(result, Err(FeedError::MaxReconnectAttemptsExceeded(2))));
        assert_eq!(drain(&mut rx).len(), 2);
        assert!(ingestor.status().snapshot().reconnect_attempts >= 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_ingestor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Keep the session open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let ingestor = Arc::new(FeedIngestor::new(format!("ws://{}/realtime", addr), ReconnectConfig::default()));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = {
            let ingestor = ingestor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { ingestor.run(tx, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(ingestor.status().state(), FeedState::Stopped);
    }
}
