//! Network transports for the collector control plane.
//!
//! Provides:
//! - Request client (HTTPS, retry with backoff and jitter, deadlines)
//! - Live channel (websocket, heartbeat, reconnect and resubscribe)
//! - Channel wire protocol (JSON frames)
//! - Mutual TLS configuration

pub mod channel;
pub mod http;
pub mod protocol;
pub mod tls;

pub use channel::{ChannelState, LiveChannel, channel_url};
pub use http::{CORRELATION_HEADER, Method, Request, RequestClient};
pub use protocol::{Frame, FrameType};
