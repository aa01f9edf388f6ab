//! Core types for the collector control-plane client.
//!
//! This crate provides the building blocks shared by every transport:
//! - `Credential` - API key, basic or mutual TLS authentication
//! - `ConnectionConfig` - Validated, immutable connection settings
//! - `LinkError` - Unified error taxonomy
//! - `CorrelationTable` - Pending results with deadlines
//! - `SubscriptionRegistry` - Topic handlers that survive reconnects
//! - `CredentialStore` - Secret store collaborator trait

pub mod config;
pub mod correlation;
pub mod credential;
pub mod error;
pub mod event;
pub mod retry;
pub mod subscription;
pub mod traits;

pub use config::{ChannelPolicy, ConnectionConfig, ConnectionConfigBuilder, Timeouts};
pub use correlation::{CorrelationId, CorrelationTable, PendingResult};
pub use credential::{Credential, Secret};
pub use error::{ErrorEnvelope, LinkError, Result};
pub use event::{Event, EventKind};
pub use retry::{Backoff, BackoffPolicy, ReconnectLimit, RetryPolicy};
pub use subscription::{EventHandler, HandlerError, SubscriptionId, SubscriptionRegistry};
pub use traits::{CredentialStore, StoreError};
