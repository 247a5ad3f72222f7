//! WebSocket relay server
//!
//! Accepts connections on the relay endpoint, runs one task per connection,
//! and wires each connection's session to the group broker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::ServerMessage;
use super::session::ClientSession;
use crate::broker::{GroupBroker, GroupEvent, LocalBroker};
use crate::config::RelayConfig;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// WebSocket relay server
pub struct RelayServer {
    config: RelayConfig,
    listener: TcpListener,
    broker: Arc<dyn GroupBroker>,
    active: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Bind the relay to its configured address with the in-process broker
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Self> {
        Self::bind_with_broker(config, Arc::new(LocalBroker::new())).await
    }

    /// Bind with a caller-provided broker implementation
    pub async fn bind_with_broker(
        config: RelayConfig,
        broker: Arc<dyn GroupBroker>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            listener,
            broker,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        })
    }

    /// Address the relay is actually listening on
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the relay
    ///
    /// Accepts connections until a shutdown signal arrives, then waits for
    /// open connections to drain.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            "Relay listening on ws://{}{}",
            self.local_addr()?,
            self.config.endpoint
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let config = self.config.clone();
                            let broker = Arc::clone(&self.broker);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let active = Arc::clone(&self.active);

                            active.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, config, broker, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                                active.fetch_sub(1, Ordering::SeqCst);
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Wait for active connections to close, up to the drain timeout
    async fn drain(&self) {
        let open = self.active.load(Ordering::SeqCst);
        if open == 0 {
            return;
        }
        info!("Waiting for {} active connections to close...", open);

        let deadline = Instant::now() + self.config.drain_timeout();
        while self.active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let open = self.active.load(Ordering::SeqCst);
        if open > 0 {
            warn!("Drain timed out with {} connections still open", open);
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: RelayConfig,
    broker: Arc<dyn GroupBroker>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    // Validate the path and capture the query during the handshake
    let mut query_event_id: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
        if !config.endpoint_matches(request.uri().path()) {
            warn!(
                "Rejecting connection from {} to unknown path {}",
                peer_addr,
                request.uri().path()
            );
            let mut not_found = ErrorResponse::new(Some("Not Found".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        query_event_id = extract_event_id(request.uri().query());
        Ok(response)
    })
    .await?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The broker delivers this connection's fan-out events on this queue
    let (events_tx, mut events_rx) = mpsc::channel(config.queue_capacity);
    let mut session = ClientSession::new(query_event_id, broker, events_tx);

    // Greeting goes out before anything else
    let send_timeout = config.send_timeout();
    let greeting = session.connected_reply().encode()?;
    timeout(send_timeout, ws_sender.send(Message::Text(greeting))).await??;
    debug!("Session {} accepted from {}", session.id(), peer_addr);

    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval(),
        config.heartbeat_interval(),
    );
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            // Frames from the client
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        debug!("Received message from {}: {}", peer_addr, text);
                        if let Some(reply) = session.handle_text(&text).await {
                            if !send_to_client(&mut ws_sender, &reply, peer_addr, send_timeout).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_inbound = Instant::now();
                        warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_inbound = Instant::now();
                        if !send_frame(&mut ws_sender, Message::Pong(data), send_timeout).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_inbound = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {
                        // Raw frame, ignore
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            // Fan-out events from the broker
            event = events_rx.recv() => {
                match event {
                    Some(GroupEvent::MealScan { meal_type, new_count, event_id, timestamp }) => {
                        let update = ServerMessage::meal_scanned(meal_type, new_count, event_id, timestamp);
                        if !send_to_client(&mut ws_sender, &update, peer_addr, send_timeout).await {
                            break;
                        }
                    }
                    Some(GroupEvent::Evicted) => {
                        warn!("Session {} fell behind, closing connection to {}", session.id(), peer_addr);
                        let _ = send_frame(&mut ws_sender, Message::Close(None), send_timeout).await;
                        break;
                    }
                    None => break,
                }
            }
            // Heartbeat and idle cutoff
            _ = heartbeat.tick() => {
                if last_inbound.elapsed() >= config.idle_timeout() {
                    info!("Connection from {} idle too long, closing", peer_addr);
                    let _ = send_frame(&mut ws_sender, Message::Close(None), send_timeout).await;
                    break;
                }
                if !send_frame(&mut ws_sender, Message::Ping(Vec::new()), send_timeout).await {
                    break;
                }
            }
            // Server shutdown
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = send_frame(&mut ws_sender, Message::Close(None), send_timeout).await;
                break;
            }
        }
    }

    // Deregister whatever ended the loop
    session.teardown().await;
    info!("Session {} from {} closed", session.id(), peer_addr);
    Ok(())
}

/// Send one protocol message, reporting whether the connection is still up.
/// A failed or stalled send is a disconnect signal, not a fault.
async fn send_to_client(
    sender: &mut WsSink,
    message: &ServerMessage,
    peer_addr: SocketAddr,
    send_timeout: Duration,
) -> bool {
    let json = match message.encode() {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to encode message for {}: {}", peer_addr, e);
            return false;
        }
    };
    match timeout(send_timeout, sender.send(Message::Text(json))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Send to {} failed, treating as disconnect: {}", peer_addr, e);
            false
        }
        Err(_) => {
            warn!("Send to {} stalled, treating as disconnect", peer_addr);
            false
        }
    }
}

/// One bounded control-frame send. The cap keeps a peer that has stopped
/// reading from pinning the connection task inside the send.
async fn send_frame(sender: &mut WsSink, frame: Message, send_timeout: Duration) -> bool {
    matches!(timeout(send_timeout, sender.send(frame)).await, Ok(Ok(())))
}

/// First non-empty value of the `event_id` query key, if present.
/// A blank value (`?event_id=`) counts as absent.
fn extract_event_id(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| key == "event_id" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}
