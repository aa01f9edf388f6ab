//! Process session handle.

use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::{Buf, BytesMut};
use collector_link_core::LinkError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a collector process. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited on its own or after the graceful signal; signal exits are `128 + signal`.
    Terminated(i32),
    /// Force-killed after the grace period or on request.
    Killed,
}

impl ProcessState {
    const fn rank(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Running => 1,
            Self::Terminated(_) | Self::Killed => 2,
        }
    }

    /// Whether the process is gone.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// One decoded stdout record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRecord {
    /// Position among the session's records, starting at 0.
    pub seq: u64,
    pub value: Value,
}

/// A record, or a line that failed to decode.
pub type StreamItem = Result<StreamRecord, LinkError>;

/// Successful exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub exit_code: i32,
    pub dropped_records: u64,
}

/// Why the supervisor stopped the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Exited,
    Cancelled,
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub(crate) struct Finish {
    pub reason: StopReason,
    /// Exit code, or why it could not be collected.
    pub exit: Result<i32, String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Status {
    pub state: ProcessState,
    pub finish: Option<Finish>,
}

/// Write side of a session's status.
pub(crate) struct StatusTx(watch::Sender<Status>);

impl StatusTx {
    pub fn new() -> (Self, watch::Receiver<Status>) {
        let (tx, rx) = watch::channel(Status {
            state: ProcessState::NotStarted,
            finish: None,
        });
        (Self(tx), rx)
    }

    /// Move to `state` if it is further along than the current one.
    pub fn advance(&self, state: ProcessState) -> bool {
        self.0.send_if_modified(|status| {
            if state.rank() > status.state.rank() {
                status.state = state;
                true
            } else {
                false
            }
        })
    }

    pub fn finish(&self, state: ProcessState, finish: Finish) {
        self.0.send_modify(|status| {
            if state.rank() > status.state.rank() {
                status.state = state;
            }
            status.finish.get_or_insert(finish);
        });
    }
}

/// Tail-retaining stderr capture.
///
/// Raw bytes are kept so a character split across reads decodes intact.
#[derive(Debug)]
pub(crate) struct StderrBuffer {
    max_bytes: usize,
    bytes: Mutex<BytesMut>,
}

impl StderrBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            bytes: Mutex::new(BytesMut::new()),
        }
    }

    pub fn push(&self, chunk: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes.extend_from_slice(chunk);
        if bytes.len() > self.max_bytes {
            let excess = bytes.len() - self.max_bytes;
            bytes.advance(excess);
        }
    }

    pub fn snapshot(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        // Skip continuation bytes left over from trimming the front.
        let start = bytes
            .iter()
            .take(3)
            .take_while(|b| (**b & 0xC0) == 0x80)
            .count();
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }
}

/// Handle to a running (or finished) collector process.
///
/// Dropping the handle cancels the process gracefully.
pub struct ProcessSession {
    pub(crate) id: SessionId,
    pub(crate) pid: Option<u32>,
    pub(crate) status: watch::Receiver<Status>,
    pub(crate) records: Mutex<Option<mpsc::Receiver<StreamItem>>>,
    pub(crate) stderr: Arc<StderrBuffer>,
    pub(crate) dropped: Arc<AtomicU64>,
    pub(crate) cancel: CancellationToken,
    pub(crate) force: CancellationToken,
}

impl ProcessSession {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// OS process id (also the process group id).
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.status.borrow().state
    }

    /// Captured stderr (tail).
    #[must_use]
    pub fn stderr(&self) -> String {
        self.stderr.snapshot()
    }

    /// Records discarded because the queue was full.
    #[must_use]
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take the record queue for pull-style consumption.
    ///
    /// Returns `None` if it was already taken or handed to a consumer. The
    /// queue closes once stdout reaches end of file.
    pub fn take_records(&self) -> Option<mpsc::Receiver<StreamItem>> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// SIGTERM the process group, then force kill after the grace period.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Force kill now, even during a grace period already under way.
    pub fn kill(&self) {
        self.force.cancel();
        self.cancel.cancel();
    }

    /// Wait for the process to finish.
    ///
    /// # Errors
    /// - `LinkError::Process` for a non-zero exit, with the captured stderr
    /// - `LinkError::Cancelled` if the session was cancelled or killed
    /// - `LinkError::Timeout` if the bridge timeout stopped it
    pub async fn wait(&self) -> Result<ProcessExit, LinkError> {
        let mut status = self.status.clone();
        let finish = status
            .wait_for(|s| s.finish.is_some())
            .await
            .ok()
            .and_then(|s| s.finish.clone())
            .ok_or_else(|| LinkError::process("collector supervisor stopped unexpectedly"))?;

        match (finish.reason, finish.exit) {
            (StopReason::Cancelled, _) => Err(LinkError::Cancelled),
            (StopReason::TimedOut(limit), _) => Err(LinkError::Timeout(limit)),
            (StopReason::Exited, Ok(0)) => Ok(ProcessExit {
                exit_code: 0,
                dropped_records: self.dropped_records(),
            }),
            (StopReason::Exited, Ok(code)) => Err(LinkError::Process {
                message: format!("collector exited with status {code}"),
                exit_code: Some(code),
                stderr: self.stderr(),
            }),
            (StopReason::Exited, Err(message)) => Err(LinkError::Process {
                message,
                exit_code: None,
                stderr: self.stderr(),
            }),
        }
    }
}

impl fmt::Debug for ProcessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_never_moves_backwards() {
        let (tx, rx) = StatusTx::new();
        assert!(tx.advance(ProcessState::Running));
        assert!(tx.advance(ProcessState::Killed));
        assert!(!tx.advance(ProcessState::Running));
        assert!(!tx.advance(ProcessState::Terminated(0)));
        assert_eq!(rx.borrow().state, ProcessState::Killed);
    }

    #[test]
    fn test_stderr_keeps_tail() {
        let buffer = StderrBuffer::new(8);
        buffer.push(b"0123456789");
        buffer.push(b"ab");
        assert_eq!(buffer.snapshot(), "456789ab");
    }

    #[test]
    fn test_stderr_tail_respects_char_boundaries() {
        let buffer = StderrBuffer::new(3);
        buffer.push("aé€".as_bytes());
        assert_eq!(buffer.snapshot(), "€");

        let buffer = StderrBuffer::new(4);
        buffer.push("aé€".as_bytes());
        assert_eq!(buffer.snapshot(), "€");
    }

    #[test]
    fn test_stderr_char_split_across_reads() {
        let buffer = StderrBuffer::new(64);
        let text = "échec: fichier introuvable €";
        let (head, tail) = text.as_bytes().split_at(1);
        buffer.push(head);
        buffer.push(tail);
        assert_eq!(buffer.snapshot(), text);
    }

    #[test]
    fn test_state_serialization() {
        let text = serde_json::to_string(&ProcessState::Terminated(143)).unwrap();
        assert_eq!(text, r#"{"state":"terminated","code":143}"#);
    }
}
