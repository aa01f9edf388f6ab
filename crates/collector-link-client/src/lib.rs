//! Control-plane client for the collector server.
//!
//! Provides:
//! - `ControlClient` - One facade over the request client, live channel and
//!   local collector bridge
//! - Credential store implementations (memory)

pub mod facade;
pub mod storage;

pub use facade::{ClientConfig, ClientMode, ControlClient, Operation};
#[cfg(feature = "memory")]
pub use storage::MemoryCredentialStore;

pub use collector_link_core::{
    ConnectionConfig, Credential, CredentialStore, Event, EventKind, HandlerError, LinkError,
    ReconnectLimit,
};
pub use collector_link_process::{Backpressure, BridgeConfig, RecordConsumer, StreamRecord};
pub use collector_link_transport::{ChannelState, Method};
