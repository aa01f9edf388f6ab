//! Collector process bridge.
//!
//! Each session runs three tasks: a stdout drain feeding the record decoder,
//! a stderr drain, and a supervisor that owns the child and handles exit,
//! cancellation and timeout.

use std::{
    process::{ExitStatus, Stdio},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use collector_link_core::{HandlerError, LinkError};
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{ChildStderr, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    command::CollectorCommand,
    decoder::{DEFAULT_MAX_RECORD_BYTES, DecodeError, RecordDecoder},
    session::{
        Finish, ProcessSession, ProcessState, SessionId, StatusTx, StderrBuffer, StopReason,
        StreamItem, StreamRecord,
    },
};

const READ_CHUNK: usize = 8 * 1024;
/// How long to wait for stderr to reach EOF once the process is gone.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to do when the record queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Stop reading stdout until there is room; the collector blocks on write.
    Block { capacity: usize },
    /// Discard new records and count them.
    Drop { capacity: usize },
}

impl Backpressure {
    #[must_use]
    pub const fn capacity(self) -> usize {
        match self {
            Self::Block { capacity } | Self::Drop { capacity } => capacity,
        }
    }
}

impl Default for Backpressure {
    fn default() -> Self {
        Self::Block { capacity: 256 }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    command: CollectorCommand,
    grace_period: Duration,
    timeout: Option<Duration>,
    backpressure: Backpressure,
    max_record_bytes: usize,
    max_stderr_bytes: usize,
}

impl BridgeConfig {
    #[must_use]
    pub fn builder(executable: impl Into<String>) -> BridgeConfigBuilder {
        BridgeConfigBuilder {
            command: CollectorCommand::new(executable),
            grace_period: Duration::from_secs(5),
            timeout: None,
            backpressure: Backpressure::default(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            max_stderr_bytes: 64 * 1024,
        }
    }

    #[must_use]
    pub const fn command(&self) -> &CollectorCommand {
        &self.command
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        self.grace_period
    }

    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub const fn backpressure(&self) -> Backpressure {
        self.backpressure
    }
}

/// Builder for [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct BridgeConfigBuilder {
    command: CollectorCommand,
    grace_period: Duration,
    timeout: Option<Duration>,
    backpressure: Backpressure,
    max_record_bytes: usize,
    max_stderr_bytes: usize,
}

impl BridgeConfigBuilder {
    /// Arguments passed on every invocation.
    #[must_use]
    pub fn base_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.command = self.command.base_args(args);
        self
    }

    /// Time between SIGTERM and the forced kill.
    #[must_use]
    pub const fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Stop sessions that run longer than this.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    #[must_use]
    pub const fn max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }

    #[must_use]
    pub const fn max_stderr_bytes(mut self, max: usize) -> Self {
        self.max_stderr_bytes = max;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` for an unparsable command or zero limits.
    pub fn build(self) -> Result<BridgeConfig, LinkError> {
        self.command.build(&[])?;
        if self.backpressure.capacity() == 0 {
            return Err(LinkError::Configuration(
                "record queue capacity must be at least 1".into(),
            ));
        }
        if self.max_record_bytes == 0 || self.max_stderr_bytes == 0 {
            return Err(LinkError::Configuration(
                "record and stderr limits must be positive".into(),
            ));
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(LinkError::Configuration("timeout must be positive".into()));
        }
        Ok(BridgeConfig {
            command: self.command,
            grace_period: self.grace_period,
            timeout: self.timeout,
            backpressure: self.backpressure,
            max_record_bytes: self.max_record_bytes,
            max_stderr_bytes: self.max_stderr_bytes,
        })
    }
}

/// Push-style record consumer.
#[async_trait]
pub trait RecordConsumer: Send + Sync {
    /// Called for each record, in order.
    async fn on_record(&self, record: StreamRecord) -> Result<(), HandlerError>;

    /// Called for each line that failed to decode.
    async fn on_error(&self, error: LinkError) {
        warn!(error = %error, "Collector record error");
    }
}

/// Spawns and supervises collector processes.
#[derive(Debug, Clone)]
pub struct ProcessBridge {
    config: Arc<BridgeConfig>,
}

impl ProcessBridge {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Spawn the collector with the operation's arguments.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the executable cannot be found and
    /// `LinkError::Process` if it fails to start.
    pub async fn spawn<I, S>(&self, args: I) -> Result<ProcessSession, LinkError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch(args, self.config.timeout).await
    }

    /// Spawn with a timeout overriding the configured one.
    ///
    /// # Errors
    /// Same as [`ProcessBridge::spawn`].
    pub async fn spawn_with_timeout<I, S>(
        &self,
        args: I,
        timeout: Duration,
    ) -> Result<ProcessSession, LinkError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch(args, Some(timeout)).await
    }

    async fn launch<I, S>(
        &self,
        args: I,
        timeout: Option<Duration>,
    ) -> Result<ProcessSession, LinkError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let (executable, args) = self.config.command.build(&args)?.into_resolved().await?;

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.group_spawn().map_err(|e| {
            LinkError::process(format!(
                "failed to start collector {}: {e}",
                executable.display()
            ))
        })?;

        let id = SessionId::new();
        let pid = child.id();
        let span = info_span!("collector", session_id = %id, pid = pid.unwrap_or_default());
        info!(parent: &span, executable = %executable.display(), ?args, "Collector started");

        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();

        let (status_tx, status_rx) = StatusTx::new();
        status_tx.advance(ProcessState::Running);

        let capacity = self.config.backpressure.capacity();
        let (records_tx, records_rx) = mpsc::channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let stderr_buffer = Arc::new(StderrBuffer::new(self.config.max_stderr_bytes));

        if let Some(stdout) = stdout {
            let sink = RecordSink {
                tx: Some(records_tx),
                backpressure: self.config.backpressure,
                dropped: Arc::clone(&dropped),
                next_seq: 0,
            };
            let decoder = RecordDecoder::new(self.config.max_record_bytes);
            tokio::spawn(drain_stdout(stdout, decoder, sink).instrument(span.clone()));
        }
        let stderr_task = stderr.map(|stderr| {
            tokio::spawn(drain_stderr(stderr, Arc::clone(&stderr_buffer)).instrument(span.clone()))
        });

        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let supervisor = Supervisor {
            grace_period: self.config.grace_period,
            timeout,
            cancel: cancel.clone(),
            force: force.clone(),
            status: status_tx,
            stderr_task,
        };
        tokio::spawn(supervisor.run(child).instrument(span));

        Ok(ProcessSession {
            id,
            pid,
            status: status_rx,
            records: Mutex::new(Some(records_rx)),
            stderr: stderr_buffer,
            dropped,
            cancel,
            force,
        })
    }

    /// Hand the session's records to a consumer task.
    ///
    /// # Errors
    /// Returns `LinkError::Configuration` if the records were already taken.
    pub fn attach_consumer(
        &self,
        session: &ProcessSession,
        consumer: Arc<dyn RecordConsumer>,
    ) -> Result<JoinHandle<()>, LinkError> {
        let mut records = session.take_records().ok_or_else(|| {
            LinkError::Configuration("session records were already taken".into())
        })?;
        let session_id = session.id();

        Ok(tokio::spawn(async move {
            while let Some(item) = records.recv().await {
                match item {
                    Ok(record) => {
                        let seq = record.seq;
                        if let Err(e) = consumer.on_record(record).await {
                            warn!(%session_id, seq, error = %e, "Record consumer failed");
                        }
                    }
                    Err(error) => consumer.on_error(error).await,
                }
            }
            debug!(%session_id, "Record consumer finished");
        }))
    }

    /// Stop gracefully: SIGTERM, then force kill after the grace period.
    pub fn cancel(&self, session: &ProcessSession) {
        session.cancel();
    }

    /// Force kill immediately.
    pub fn kill(&self, session: &ProcessSession) {
        session.kill();
    }
}

struct RecordSink {
    /// `None` once the receiver is gone; stdout is still drained.
    tx: Option<mpsc::Sender<StreamItem>>,
    backpressure: Backpressure,
    dropped: Arc<AtomicU64>,
    next_seq: u64,
}

impl RecordSink {
    async fn push(&mut self, decoded: Result<serde_json::Value, DecodeError>) {
        let item = match decoded {
            Ok(value) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                Ok(StreamRecord { seq, value })
            }
            Err(e) => {
                warn!(error = %e, "Malformed collector output");
                Err(LinkError::process(e.to_string()))
            }
        };

        let Some(tx) = &self.tx else { return };
        let delivered = match self.backpressure {
            Backpressure::Block { .. } => tx.send(item).await.is_ok(),
            Backpressure::Drop { .. } => match tx.try_send(item) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(dropped = total, "Record queue full, dropping record");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
        };
        if !delivered {
            debug!("Record receiver gone, discarding further output");
            self.tx = None;
        }
    }
}

async fn drain_stdout(mut stdout: ChildStdout, mut decoder: RecordDecoder, mut sink: RecordSink) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Error reading collector stdout");
                break;
            }
        };
        for decoded in decoder.feed(&chunk[..n]) {
            sink.push(decoded).await;
        }
    }
    if let Some(decoded) = decoder.finish() {
        sink.push(decoded).await;
    }
    debug!(records = sink.next_seq, "Collector stdout closed");
}

async fn drain_stderr(mut stderr: ChildStderr, buffer: Arc<StderrBuffer>) {
    read_into(&mut stderr, |bytes| buffer.push(bytes)).await;
    debug!("Collector stderr closed");
}

async fn read_into<R, F>(reader: &mut R, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink(&chunk[..n]),
            Err(e) => {
                warn!(error = %e, "Error reading collector stderr");
                break;
            }
        }
    }
}

enum Trigger {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

struct Supervisor {
    grace_period: Duration,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    force: CancellationToken,
    status: StatusTx,
    stderr_task: Option<JoinHandle<()>>,
}

impl Supervisor {
    async fn run(self, mut child: AsyncGroupChild) {
        let deadline = self.timeout.map(|t| (Instant::now() + t, t));

        let trigger = tokio::select! {
            biased;
            result = child.wait() => Trigger::Exited(result),
            () = self.cancel.cancelled() => Trigger::Cancelled,
            limit = expire(deadline) => Trigger::TimedOut(limit),
        };

        let (reason, result, forced) = match trigger {
            Trigger::Exited(result) => (StopReason::Exited, result, false),
            Trigger::Cancelled => {
                info!("Cancelling collector");
                let (result, forced) = self.terminate(&mut child).await;
                (StopReason::Cancelled, result, forced)
            }
            Trigger::TimedOut(limit) => {
                warn!(timeout_ms = limit.as_millis(), "Collector timed out");
                let (result, forced) = self.terminate(&mut child).await;
                (StopReason::TimedOut(limit), result, forced)
            }
        };

        if let Some(task) = self.stderr_task {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err() {
                warn!("Collector stderr still open after exit, continuing without it");
            }
        }

        let exit = result
            .map(exit_code)
            .map_err(|e| format!("failed to collect collector exit status: {e}"));
        let state = match (&exit, forced) {
            (_, true) => ProcessState::Killed,
            (Ok(code), false) => ProcessState::Terminated(*code),
            (Err(_), false) => ProcessState::Killed,
        };
        info!(?state, ?reason, "Collector finished");
        self.status.finish(state, Finish { reason, exit });
    }

    /// Graceful signal, grace period, then force. Returns whether force was needed.
    async fn terminate(&self, child: &mut AsyncGroupChild) -> (std::io::Result<ExitStatus>, bool) {
        if self.force.is_cancelled() || !signal_group(child) {
            return (force_kill(child).await, true);
        }

        let graceful = tokio::select! {
            biased;
            result = child.wait() => Some(result),
            () = self.force.cancelled() => None,
            () = tokio::time::sleep(self.grace_period) => None,
        };
        match graceful {
            Some(result) => (result, false),
            None => {
                warn!(grace_ms = self.grace_period.as_millis(), "Collector still running, killing");
                (force_kill(child).await, true)
            }
        }
    }
}

async fn expire(deadline: Option<(Instant, Duration)>) -> Duration {
    match deadline {
        Some((at, limit)) => {
            tokio::time::sleep_until(at).await;
            limit
        }
        None => std::future::pending().await,
    }
}

async fn force_kill(child: &mut AsyncGroupChild) -> std::io::Result<ExitStatus> {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill failed, process likely already gone");
    }
    child.wait().await
}

/// SIGTERM the whole process group. Returns false when no graceful signal was sent.
#[cfg(unix)]
fn signal_group(child: &AsyncGroupChild) -> bool {
    use nix::{
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(pgid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "SIGTERM to process group failed");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &AsyncGroupChild) -> bool {
    false
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = BridgeConfig::builder("collector").build().unwrap();
        assert_eq!(config.backpressure(), Backpressure::Block { capacity: 256 });
        assert_eq!(config.grace_period(), Duration::from_secs(5));
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_builder_rejects_bad_values() {
        assert!(matches!(
            BridgeConfig::builder("").build(),
            Err(LinkError::Configuration(_))
        ));
        assert!(matches!(
            BridgeConfig::builder("collector")
                .backpressure(Backpressure::Drop { capacity: 0 })
                .build(),
            Err(LinkError::Configuration(_))
        ));
        assert!(matches!(
            BridgeConfig::builder("collector")
                .timeout(Duration::ZERO)
                .build(),
            Err(LinkError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_executable_is_configuration_error() {
        let bridge = ProcessBridge::new(
            BridgeConfig::builder("no-such-collector-9c41").build().unwrap(),
        );
        let err = bridge.spawn(["query"]).await.unwrap_err();
        assert!(matches!(err, LinkError::Configuration(_)), "{err:?}");
    }
}
