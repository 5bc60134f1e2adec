use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::config::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PING_INTERVAL_SECS, DEFAULT_PONG_TIMEOUT_SECS,
    DEFAULT_WRITE_TIMEOUT_SECS, SINK_OUTBOUND_BUFFER,
};
use crate::error::ConnectionError;
use crate::feed::Update;
use crate::relay::{Broadcaster, Sink, SinkSettings};
use crate::websocket::protocol::{parse_command, Command};

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub write_timeout: Duration,
    pub pong_timeout: Duration,
    pub ping_interval: Duration,
    /// Largest inbound message or frame; anything bigger ends the connection.
    pub max_message_size: usize,
    pub outbound_buffer: usize,
    pub sink: SinkSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            outbound_buffer: SINK_OUTBOUND_BUFFER,
            sink: SinkSettings::default(),
        }
    }
}

impl ConnectionSettings {
    /// Transport limits applied when the subscriber's upgrade is accepted.
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// An empty set means every symbol.
    Active(BTreeSet<String>),
    Unsubscribed,
}

/// Registration of one connection's sink with the broadcaster.
///
/// Dropping it deregisters the sink, so every way out of a connection
/// (including task abort) leaves the registry clean.
pub struct Subscription {
    sink: Arc<Sink>,
    broadcaster: Arc<Broadcaster>,
    state: SubscriptionState,
}

impl Subscription {
    pub fn open(sink: Arc<Sink>, broadcaster: Arc<Broadcaster>) -> Self {
        broadcaster.register(&sink);
        Self {
            sink,
            broadcaster,
            state: SubscriptionState::Active(BTreeSet::new()),
        }
    }

    pub fn state(&self) -> &SubscriptionState {
        &self.state
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Subscribe { symbols } => {
                self.broadcaster.register(&self.sink);
                if let Some(symbols) = symbols {
                    self.sink.set_accepted_symbols(symbols);
                }
                self.state = SubscriptionState::Active(self.sink.accepted_symbols().into_iter().collect());
            }
            Command::Unsubscribe => {
                self.broadcaster.deregister(&self.sink);
                self.state = SubscriptionState::Unsubscribed;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.deregister(&self.sink);
    }
}

/// Serves one subscriber: an inbound command loop and an outbound delivery
/// loop over the same WebSocket.
pub struct ConnectionHandler {
    broadcaster: Arc<Broadcaster>,
    settings: ConnectionSettings,
    peer_addr: String,
}

impl ConnectionHandler {
    pub fn new(broadcaster: Arc<Broadcaster>, settings: ConnectionSettings, peer_addr: String) -> Self {
        Self {
            broadcaster,
            settings,
            peer_addr,
        }
    }

    pub async fn handle<S>(self, ws_stream: WebSocketStream<S>, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let sink = Arc::new(Sink::new(self.settings.sink));
        let mut subscription = Subscription::open(sink.clone(), self.broadcaster.clone());
        info!("Subscriber connected from {} (sink {})", self.peer_addr, sink.id());

        let conn_cancel = cancel.child_token();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Update>(self.settings.outbound_buffer);
        let drain_task = tokio::spawn(sink.clone().consume(outbound_tx, conn_cancel.clone()));

        let (mut write, mut read) = ws_stream.split();

        let outcome = tokio::select! {
            _ = conn_cancel.cancelled() => {
                info!("Connection {} cancelled", self.peer_addr);
                Ok(())
            }
            result = self.inbound_loop(&mut read, &mut subscription) => result,
            result = self.outbound_loop(&mut write, &mut outbound_rx) => result,
        };

        match outcome {
            Ok(()) => info!("Subscriber {} disconnected", self.peer_addr),
            Err(e) => warn!("Subscriber {} dropped: {}", self.peer_addr, e),
        }
        if sink.is_overflowed() {
            warn!("Subscriber {} was disconnected after its queue overflowed", self.peer_addr);
        }

        drop(subscription);
        conn_cancel.cancel();
        let _ = drain_task.await;

        match timeout(self.settings.write_timeout, write.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing connection {}: {}", self.peer_addr, e),
            Err(_) => debug!("Timed out closing connection {}", self.peer_addr),
        }

        info!("Connection closed for {} ({} updates dropped)", self.peer_addr, sink.dropped());
    }

    async fn inbound_loop<S>(
        &self,
        read: &mut SplitStream<WebSocketStream<S>>,
        subscription: &mut Subscription,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let next = timeout(self.settings.pong_timeout, read.next())
                .await
                .map_err(|_| ConnectionError::ReadTimeout(self.settings.pong_timeout))?;

            match next {
                Some(Ok(Message::Text(text))) => self.handle_command(&text, subscription),
                Some(Ok(Message::Binary(data))) => {
                    warn!("Ignoring binary message from {}: {} bytes", self.peer_addr, data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    info!("Received close frame from {}: {:?}", self.peer_addr, frame);
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(()),
            }
        }
    }

    fn handle_command(&self, text: &str, subscription: &mut Subscription) {
        match parse_command(text) {
            Ok(command) => {
                subscription.apply(command);
                info!("Subscriber {} is now {:?}", self.peer_addr, subscription.state());
            }
            Err(e) => warn!("Ignoring message from {}: {}", self.peer_addr, e),
        }
    }

    async fn outbound_loop<S>(
        &self,
        write: &mut SplitSink<WebSocketStream<S>, Message>,
        outbound: &mut mpsc::Receiver<Update>,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ping = interval_at(Instant::now() + self.settings.ping_interval, self.settings.ping_interval);

        loop {
            tokio::select! {
                next = outbound.recv() => match next {
                    Some(update) => {
                        let json = update.to_json()?;
                        self.write_frame(write, Message::Text(json)).await?;
                    }
                    None => {
                        debug!("Outbound stream ended for {}", self.peer_addr);
                        return Ok(());
                    }
                },
                _ = ping.tick() => {
                    self.write_frame(write, Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    async fn write_frame<S>(
        &self,
        write: &mut SplitSink<WebSocketStream<S>, Message>,
        message: Message,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match timeout(self.settings.write_timeout, write.send(message)).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::WriteTimeout(self.settings.write_timeout)),
        }
    }
}
