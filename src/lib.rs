pub mod channel;
pub use channel::{Channel, ChannelVariant, EventTag};

pub mod endpoint;
pub use endpoint::Endpoint;

pub mod middleware;
pub use middleware::{Middleware, MiddlewareFactory, MiddlewarePipeline, MiddlewareSpec};

pub mod extension;
pub use extension::{Extension, ExtensionFactory, ExtensionManager, ExtensionSpec};

pub mod manager;
pub use manager::{ChannelManager, CloseChannelMode};

pub mod config;
pub use config::EngineConfig;

pub mod engine;
pub use engine::Engine;

pub mod error;

/// Default read size used when no configuration overrides it.
pub const DEFAULT_READ_MAX: usize = config::DEFAULT_READ_MAX;

/// Error returned by most functions that don't have a more specific error
/// type of their own.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;
