//! Auto-reconnecting live channel.
//!
//! One supervisor task owns the socket and walks the connection state
//! machine; one dispatcher task hands inbound events to the subscription
//! registry so slow handlers never stall heartbeats. After every handshake
//! the supervisor replays the registry's topics before reading any event.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use collector_link_core::{
    ChannelPolicy, ConnectionConfig, Credential, Event, LinkError, SubscriptionRegistry,
};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use rustls::ClientConfig;
use tokio::{
    net::TcpStream,
    sync::{Notify, broadcast, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    protocol::{Frame, FrameType},
    tls,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = futures::stream::SplitSink<Socket, Message>;

/// Live channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not running; `open` starts it.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Handshake done and topics replayed.
    Connected,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
    /// Explicitly closed.
    Closed,
}

enum ConnectError {
    /// Retry after backoff.
    Failed(String),
    /// Retrying cannot help (credential rejected).
    Rejected(String),
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Shared {
    url: Url,
    credential: Credential,
    tls: Option<Arc<ClientConfig>>,
    policy: ChannelPolicy,
    connect_timeout: Duration,
    registry: Arc<SubscriptionRegistry>,
    state: watch::Sender<ChannelState>,
    transitions: broadcast::Sender<ChannelState>,
    resync: Notify,
}

impl Shared {
    fn set_state(&self, next: ChannelState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            debug!(state = ?next, "Channel state changed");
            let _ = self.transitions.send(next);
        }
    }

    async fn connect(&self) -> Result<Socket, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Rejected(format!("invalid channel request: {e}")))?;

        if let Some(value) = self.credential.authorization_header() {
            let mut value = HeaderValue::from_str(&value)
                .map_err(|_| ConnectError::Rejected("credential is not a valid header".into()))?;
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connector = self.tls.clone().map(Connector::Rustls);
        let handshake =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Err(_) => Err(ConnectError::Failed(format!(
                "handshake timed out after {:?}",
                self.connect_timeout
            ))),
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(tungstenite::Error::Http(response)))
                if matches!(
                    response.status(),
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) =>
            {
                Err(ConnectError::Rejected(format!(
                    "server rejected credential: {}",
                    response.status()
                )))
            }
            Ok(Err(e)) if tls::is_certificate_rejection(&e) => Err(ConnectError::Rejected(
                format!("TLS certificate rejected: {e}"),
            )),
            Ok(Err(e)) => Err(ConnectError::Failed(e.to_string())),
        }
    }

    async fn supervise(self: Arc<Self>, shutdown: CancellationToken, events: mpsc::Sender<Event>) {
        let mut backoff = self.policy.reconnect_backoff.start();
        let mut failures = 0u32;

        loop {
            self.set_state(ChannelState::Connecting);
            let connected = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            let reason = match connected {
                Ok(socket) => {
                    failures = 0;
                    backoff.reset();
                    info!(url = %self.url, "Live channel connected");
                    match self.run_session(socket, &shutdown, &events).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => reason,
                    }
                }
                Err(ConnectError::Rejected(reason)) => {
                    error!(error = %reason, "Live channel rejected, not retrying");
                    self.registry.notify_connection_lost(failures + 1, &reason);
                    self.set_state(ChannelState::Disconnected);
                    return;
                }
                Err(ConnectError::Failed(reason)) => {
                    failures += 1;
                    if self.policy.reconnect_limit.is_exhausted(failures) {
                        error!(
                            attempts = failures,
                            error = %reason,
                            "Live channel reconnect attempts exhausted"
                        );
                        self.registry.notify_connection_lost(failures, &reason);
                        self.set_state(ChannelState::Disconnected);
                        return;
                    }
                    reason
                }
            };

            self.set_state(ChannelState::Reconnecting);
            let delay = backoff.next_delay();
            warn!(
                attempt = failures + 1,
                error = %reason,
                delay_ms = delay.as_millis(),
                "Live channel lost, reconnecting"
            );
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ChannelState::Closed);
    }

    async fn run_session(
        &self,
        socket: Socket,
        shutdown: &CancellationToken,
        events: &mpsc::Sender<Event>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let mut sent: Vec<String> = Vec::new();

        if let Err(reason) = self.sync_topics(&mut sink, &mut sent).await {
            return SessionEnd::Lost(reason);
        }
        self.set_state(ChannelState::Connected);

        let period = self.policy.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let mut last_seen = Instant::now();

        loop {
            let silence_deadline = last_seen + self.policy.liveness_window();
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
                () = self.resync.notified() => {
                    if let Err(reason) = self.sync_topics(&mut sink, &mut sent).await {
                        return SessionEnd::Lost(reason);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(reason) = send_frame(&mut sink, &Frame::heartbeat()).await {
                        return SessionEnd::Lost(reason);
                    }
                }
                () = tokio::time::sleep_until(silence_deadline) => {
                    return SessionEnd::Lost(format!(
                        "no frame received for {:?}",
                        self.policy.liveness_window()
                    ));
                }
                message = stream.next() => {
                    let text = match message {
                        None => return SessionEnd::Lost("socket closed".into()),
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(_) => {
                                let reason = "protocol violation: non-UTF-8 frame";
                                return SessionEnd::Lost(reason.into());
                            }
                        },
                        Some(Ok(Message::Close(_))) => {
                            return SessionEnd::Lost("server closed the channel".into());
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                            last_seen = Instant::now();
                            continue;
                        }
                    };
                    last_seen = Instant::now();

                    let frame = match Frame::decode(&text) {
                        Ok(frame) => frame,
                        Err(e) => return SessionEnd::Lost(format!("protocol violation: {e}")),
                    };
                    match frame.kind {
                        FrameType::Event => {
                            let event = Event::update(frame.topic, frame.payload);
                            if events.send(event).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        FrameType::Ack => debug!(topic = %frame.topic, "Subscription acknowledged"),
                        FrameType::Heartbeat => trace!("Heartbeat received"),
                        FrameType::Subscribe | FrameType::Unsubscribe => {
                            debug!(kind = ?frame.kind, "Ignoring client-only frame from server");
                        }
                    }
                }
            }
        }
    }

    /// Bring the server's view of our topics in line with the registry.
    async fn sync_topics(
        &self,
        sink: &mut SocketSink,
        sent: &mut Vec<String>,
    ) -> Result<(), String> {
        let current = self.registry.topics();

        for topic in &current {
            if !sent.contains(topic) {
                send_frame(sink, &Frame::subscribe(topic.as_str())).await?;
                debug!(topic = %topic, "Subscribe sent");
                sent.push(topic.clone());
            }
        }

        let stale: Vec<String> = sent
            .iter()
            .filter(|topic| !current.contains(topic))
            .cloned()
            .collect();
        for topic in stale {
            send_frame(sink, &Frame::unsubscribe(topic.as_str())).await?;
            debug!(topic = %topic, "Unsubscribe sent");
            sent.retain(|t| *t != topic);
        }
        Ok(())
    }
}

async fn send_frame(sink: &mut SocketSink, frame: &Frame) -> Result<(), String> {
    let text = frame.encode().map_err(|e| e.to_string())?;
    sink.send(Message::Text(text)).await.map_err(|e| e.to_string())
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<Event>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let report = shared.registry.dispatch(&event);
        trace!(
            topic = %event.topic,
            delivered = report.delivered,
            failed = report.failed,
            "Event dispatched"
        );
        if report.removed > 0 {
            shared.resync.notify_one();
        }
    }
}

struct Running {
    shutdown: CancellationToken,
    supervisor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Persistent push channel.
pub struct LiveChannel {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl LiveChannel {
    /// Create a closed-over channel; nothing connects until `open`.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the channel URL or TLS material
    /// is invalid.
    pub fn new(
        config: &ConnectionConfig,
        registry: Arc<SubscriptionRegistry>,
    ) -> Result<Self, LinkError> {
        let policy = config.channel().clone();
        let url = channel_url(config.base_address(), &policy.path)?;
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (transitions, _) = broadcast::channel(64);

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                credential: config.credential().clone(),
                tls: tls::client_config(config.credential())?,
                policy,
                connect_timeout: config.timeouts().connect,
                registry,
                state,
                transitions,
                resync: Notify::new(),
            }),
            running: Mutex::new(None),
        })
    }

    /// Websocket URL the channel connects to.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Start the supervisor. Idempotent while it is running.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the channel was closed.
    pub fn open(&self) -> Result<(), LinkError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() == ChannelState::Closed {
            return Err(LinkError::Configuration("live channel is closed".into()));
        }
        if running.as_ref().is_some_and(|r| !r.supervisor.is_finished()) {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(self.shared.policy.dispatch_capacity.max(1));
        let dispatcher = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            events_rx,
            shutdown.clone(),
        ));
        let supervisor = tokio::spawn(
            Arc::clone(&self.shared).supervise(shutdown.clone(), events_tx),
        );

        *running = Some(Running {
            shutdown,
            supervisor,
            dispatcher,
        });
        Ok(())
    }

    /// Close the channel: cancel reconnects, release the socket, stop dispatch.
    pub async fn close(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(running) = running {
            running.shutdown.cancel();
            let _ = running.supervisor.await;
            let _ = running.dispatcher.await;
        }
        self.shared.set_state(ChannelState::Closed);
        info!(url = %self.shared.url, "Live channel closed");
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Watch the current state.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Every state transition from now on, in order.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<ChannelState> {
        self.shared.transitions.subscribe()
    }

    /// Ask the connected session to sync subscribe/unsubscribe frames with
    /// the registry. A no-op while disconnected; the next handshake replays
    /// everything anyway.
    pub fn resync(&self) {
        self.shared.resync.notify_one();
    }

    /// The registry this channel feeds.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.shared.registry
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            running.shutdown.cancel();
        }
    }
}

/// Derive the websocket URL from the HTTP base address.
///
/// # Errors
/// Returns `LinkError::Configuration` if the address cannot be parsed.
pub fn channel_url(base_address: &str, path: &str) -> Result<Url, LinkError> {
    let mut url = Url::parse(&format!("{base_address}{path}"))
        .map_err(|e| LinkError::Configuration(format!("invalid channel URL: {e}")))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(LinkError::Configuration(format!(
                "unsupported scheme for live channel: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| LinkError::Configuration(format!("cannot switch scheme to {scheme}")))?;
    Ok(url)
}
