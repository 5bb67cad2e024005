//! Error kinds used across the relay engine.
//!
//! spec §7 treats errors as *tags*, not necessarily distinct types — this
//! module turns each tag it names into a `thiserror` variant so callers can
//! match on them instead of inspecting strings.

use std::fmt;

/// Errors surfaced by an [`Endpoint`](crate::endpoint::Endpoint) read/write.
///
/// Never escapes a channel: the forward/backward tasks catch these and fold
/// them into the corresponding `*_READ_ERROR` / `*_WRITE_ERROR` channel
/// event before tearing the direction down (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("read failed: {0}")]
    Read(#[source] std::io::Error),
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),
}

/// The identity of the middleware hook a [`MiddlewareError`] originated from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookId {
    pub middleware: &'static str,
    pub hook: &'static str,
}

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.middleware, self.hook)
    }
}

/// A non-cancellation failure raised by a middleware hook.
///
/// spec §4.2: "Any exception other than cancellation is wrapped into a
/// single middleware-error kind carrying the callback identity and original
/// cause". Cancellation in this implementation never reaches this type: a
/// cancelled hook future is simply dropped by `tokio::select!` before it
/// resolves, so there is nothing to wrap.
#[derive(Debug, thiserror::Error)]
#[error("middleware error in {hook}: {source}")]
pub struct MiddlewareError {
    pub hook: HookId,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

/// Errors raised while instantiating a configured middleware or extension.
///
/// Never propagates past the loader: the loader logs it and skips the
/// offending config entry (spec §7, "Load-time errors").
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to build {class}: {source}")]
    Build {
        class: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to set up {class}: {source}")]
    Setup {
        class: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Channel-level failures that *do* escape to the caller of `Channel`
/// operations (as opposed to the per-direction transport errors, which are
/// folded into channel events and never returned).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// `set_backend` was called a second time.
    ///
    /// spec §9 "Open question: concurrent `set_backend`" resolves this as a
    /// precondition failure rather than an assertion.
    #[error("backend already set for this channel")]
    BackendAlreadySet,
}

/// Errors raised by [`ChannelManager`](crate::manager::ChannelManager) operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// `new_channel` was called after `close` had already begun (spec §8,
    /// "No new channels during shutdown").
    #[error("channel manager is shutting down")]
    ShuttingDown,
}

/// Errors raised while building or validating an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be in 0..=100, got {value}")]
    PriorityOutOfRange { field: &'static str, value: i64 },
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnvValue { key: String, value: String },
    #[error("invalid configuration source: {0}")]
    Source(#[from] serde_json::Error),
}
