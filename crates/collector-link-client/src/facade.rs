//! Client facade.
//!
//! `ControlClient` is the only surface collaborators see. Routing to the
//! remote server or to the local collector is fixed at construction.

use std::{sync::Arc, time::Duration};

use collector_link_core::{
    ConnectionConfig, ConnectionConfigBuilder, CredentialStore, Event, EventHandler, HandlerError,
    LinkError, SubscriptionId, SubscriptionRegistry, traits::require_credential,
};
use collector_link_process::{
    BridgeConfig, ProcessBridge, ProcessSession, RecordConsumer, StreamRecord,
};
use collector_link_transport::{ChannelState, LiveChannel, Method, Request, RequestClient};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where operations are sent.
#[derive(Debug, Clone)]
pub enum ClientMode {
    /// Remote server over HTTPS and the live channel.
    Remote(ConnectionConfig),
    /// Local collector executable.
    Local(BridgeConfig),
}

/// Facade configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub mode: ClientMode,
}

impl ClientConfig {
    #[must_use]
    pub const fn remote(config: ConnectionConfig) -> Self {
        Self {
            mode: ClientMode::Remote(config),
        }
    }

    #[must_use]
    pub const fn local(config: BridgeConfig) -> Self {
        Self {
            mode: ClientMode::Local(config),
        }
    }
}

/// One operation, expressed for both transports.
///
/// Remote mode uses method, path and body; local mode passes `local_args` to
/// the collector. The deadline applies to both.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub deadline: Option<Duration>,
    pub local_args: Vec<String>,
}

impl Operation {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            deadline: None,
            local_args: Vec::new(),
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    /// Operation that only has a local form.
    #[must_use]
    pub fn local<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::new(Method::Get, "").with_local_args(args)
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_local_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.local_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn to_request(&self) -> Request {
        let mut request = Request::new(self.method, self.path.clone());
        request.body.clone_from(&self.body);
        request.deadline = self.deadline;
        request
    }
}

enum Backend {
    Remote {
        requests: RequestClient,
        channel: LiveChannel,
    },
    Local {
        bridge: ProcessBridge,
    },
}

/// Control-plane client.
///
/// Must be created inside a Tokio runtime.
pub struct ControlClient {
    backend: Backend,
    registry: Arc<SubscriptionRegistry>,
}

impl ControlClient {
    /// Build a client.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the TLS material or channel URL is invalid.
    pub fn new(config: ClientConfig) -> Result<Self, LinkError> {
        let registry = SubscriptionRegistry::new();
        let backend = match config.mode {
            ClientMode::Remote(config) => {
                info!(
                    base_address = %config.base_address(),
                    kind = config.credential().kind(),
                    "Remote control client"
                );
                Backend::Remote {
                    requests: RequestClient::new(&config)?,
                    channel: LiveChannel::new(&config, Arc::clone(&registry))?,
                }
            }
            ClientMode::Local(config) => {
                info!(command = %config.command().base, "Local control client");
                Backend::Local {
                    bridge: ProcessBridge::new(config),
                }
            }
        };
        Ok(Self { backend, registry })
    }

    /// Build a remote client whose credential comes from the store.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the store fails, the key is
    /// missing, or the rest of the configuration is invalid.
    pub async fn from_store(
        store: &dyn CredentialStore,
        key: &str,
        builder: ConnectionConfigBuilder,
    ) -> Result<Self, LinkError> {
        let credential = require_credential(store, key).await?;
        let config = builder.credential(credential).build()?;
        Self::new(ClientConfig::remote(config))
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote { .. })
    }

    /// Run an operation and return its result.
    ///
    /// In local mode the collector's records are returned as a JSON array.
    ///
    /// # Errors
    /// Any `LinkError` from the selected transport.
    pub async fn call(&self, operation: Operation) -> Result<Value, LinkError> {
        self.call_with_cancel(operation, &CancellationToken::new())
            .await
    }

    /// Run an operation that the caller may cancel.
    ///
    /// # Errors
    /// `LinkError::Cancelled` once `cancel` fires, or any transport error.
    pub async fn call_with_cancel(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<Value, LinkError> {
        match &self.backend {
            Backend::Remote { requests, .. } => {
                requests
                    .execute_with_cancel(operation.to_request(), cancel)
                    .await
            }
            Backend::Local { bridge } => {
                let session = spawn_local(bridge, &operation).await?;
                let Some(mut records) = session.take_records() else {
                    return Err(LinkError::process("collector records unavailable"));
                };

                let mut values = Vec::new();
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            session.cancel();
                            break;
                        }
                        item = records.recv() => match item {
                            Some(Ok(record)) => values.push(record.value),
                            Some(Err(e)) => {
                                warn!(
                                    session_id = %session.id(),
                                    error = %e,
                                    "Skipping malformed record"
                                );
                            }
                            None => break,
                        },
                    }
                }

                let exit = session.wait().await?;
                if cancel.is_cancelled() {
                    return Err(LinkError::Cancelled);
                }
                debug!(
                    session_id = %session.id(),
                    records = values.len(),
                    dropped = exit.dropped_records,
                    "Local call finished"
                );
                Ok(Value::Array(values))
            }
        }
    }

    /// Run an operation and deliver its results to a consumer as they arrive.
    ///
    /// Remote results are delivered element by element when the response is
    /// an array, or as a single record otherwise.
    ///
    /// # Errors
    /// Any `LinkError` from the selected transport.
    pub async fn stream(
        &self,
        operation: Operation,
        consumer: Arc<dyn RecordConsumer>,
    ) -> Result<(), LinkError> {
        self.stream_with_cancel(operation, consumer, &CancellationToken::new())
            .await
    }

    /// Cancellable variant of [`ControlClient::stream`].
    ///
    /// # Errors
    /// `LinkError::Cancelled` once `cancel` fires, or any transport error.
    pub async fn stream_with_cancel(
        &self,
        operation: Operation,
        consumer: Arc<dyn RecordConsumer>,
        cancel: &CancellationToken,
    ) -> Result<(), LinkError> {
        match &self.backend {
            Backend::Remote { requests, .. } => {
                let value = requests
                    .execute_with_cancel(operation.to_request(), cancel)
                    .await?;
                let values = match value {
                    Value::Array(values) => values,
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                for (seq, value) in (0u64..).zip(values) {
                    if cancel.is_cancelled() {
                        return Err(LinkError::Cancelled);
                    }
                    if let Err(e) = consumer.on_record(StreamRecord { seq, value }).await {
                        warn!(seq, error = %e, "Record consumer failed");
                    }
                }
                Ok(())
            }
            Backend::Local { bridge } => {
                let session = spawn_local(bridge, &operation).await?;
                let task = bridge.attach_consumer(&session, consumer)?;

                let outcome = tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        session.cancel();
                        session.wait().await
                    }
                    outcome = session.wait() => outcome,
                };
                if task.await.is_err() {
                    warn!(session_id = %session.id(), "Record consumer task panicked");
                }
                outcome.map(|_| ())
            }
        }
    }

    /// Register a handler for a topic.
    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let registered = self.registry.subscribe(topic, handler);
        self.resync_if(registered.first_for_topic);
        registered.id
    }

    /// Register a closure handler for a topic.
    pub fn subscribe_fn<F>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let registered = self.registry.subscribe_fn(topic, handler);
        self.resync_if(registered.first_for_topic);
        registered.id
    }

    /// Register a bounded queue for a topic (poll style).
    pub fn subscribe_queue(
        &self,
        topic: impl Into<String>,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (registered, rx) = self.registry.subscribe_queue(topic, capacity);
        self.resync_if(registered.first_for_topic);
        (registered.id, rx)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.registry.unsubscribe(id) {
            Some(removed) => {
                self.resync_if(removed.last_for_topic);
                true
            }
            None => false,
        }
    }

    fn resync_if(&self, topics_changed: bool) {
        if let (true, Backend::Remote { channel, .. }) = (topics_changed, &self.backend) {
            channel.resync();
        }
    }

    /// Start the live channel. A no-op in local mode.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the client was closed.
    pub fn open(&self) -> Result<(), LinkError> {
        match &self.backend {
            Backend::Remote { channel, .. } => channel.open(),
            Backend::Local { .. } => Ok(()),
        }
    }

    /// Close the live channel and stop background tasks.
    pub async fn close(&self) {
        if let Backend::Remote { requests, channel } = &self.backend {
            channel.close().await;
            requests.shutdown();
        }
    }

    /// Live channel state; `None` in local mode.
    #[must_use]
    pub fn channel_state(&self) -> Option<ChannelState> {
        match &self.backend {
            Backend::Remote { channel, .. } => Some(channel.state()),
            Backend::Local { .. } => None,
        }
    }

    /// Watch live channel state; `None` in local mode.
    #[must_use]
    pub fn watch_channel(&self) -> Option<watch::Receiver<ChannelState>> {
        match &self.backend {
            Backend::Remote { channel, .. } => Some(channel.watch_state()),
            Backend::Local { .. } => None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }
}

async fn spawn_local(
    bridge: &ProcessBridge,
    operation: &Operation,
) -> Result<ProcessSession, LinkError> {
    if operation.local_args.is_empty() {
        return Err(LinkError::Configuration(format!(
            "operation {} {} has no local form",
            operation.method, operation.path
        )));
    }
    match operation.deadline {
        Some(deadline) => {
            bridge
                .spawn_with_timeout(operation.local_args.iter().cloned(), deadline)
                .await
        }
        None => bridge.spawn(operation.local_args.iter().cloned()).await,
    }
}
