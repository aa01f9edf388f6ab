//! Local collector process bridge.
//!
//! Provides:
//! - Collector command building and executable lookup
//! - NDJSON record reassembly
//! - Supervised sessions with graceful cancel, timeout and backpressure

pub mod bridge;
pub mod command;
pub mod decoder;
pub mod resolve;
pub mod session;

pub use bridge::{Backpressure, BridgeConfig, BridgeConfigBuilder, ProcessBridge, RecordConsumer};
pub use command::{CollectorCommand, CommandBuildError, CommandParts};
pub use decoder::{DecodeError, RecordDecoder};
pub use resolve::resolve_executable_path;
pub use session::{ProcessExit, ProcessSession, ProcessState, SessionId, StreamItem, StreamRecord};
