//! Composition root: wires configuration, the middleware/extension
//! registries, and the channel manager into one engine handle.
//!
//! Supplements the distilled spec from `original_source/os_aio_pod_channel/engine.py`,
//! whose `Engine` class is the thing `on_setup`/`on_cleanup`/`on_stop`/
//! `on_connect` are called on from the original's server loop. Factories are
//! plain maps here rather than reflection-based class loading (spec §1).

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::channel::{Channel, ChannelVariant};
use crate::config::EngineConfig;
use crate::endpoint::Endpoint;
use crate::error::ManagerError;
use crate::extension::{ExtensionFactory, ExtensionManager, ExtensionSpec};
use crate::manager::{ChannelManager, CloseChannelMode};
use crate::middleware::{MiddlewareFactory, MiddlewarePipeline, MiddlewareSpec};

/// The running engine: configuration plus the two registries and the
/// channel manager built from it.
///
/// `manager` and `extensions` are populated after construction because
/// building them requires a `&Engine` to hand to factories (so a factory
/// can, for example, look up an already-loaded extension while building a
/// middleware that depends on it) — a small, deliberate two-phase
/// initialization rather than a borrow-checker workaround.
pub struct Engine {
    config: EngineConfig,
    manager: OnceLock<Arc<ChannelManager>>,
    extensions: OnceLock<ExtensionManager>,
}

impl Engine {
    /// Builds the engine from configuration and caller-supplied factory
    /// registries. Unresolved `cls` names (no matching factory registered)
    /// are logged and skipped, same as an instantiation failure (spec §7).
    pub fn build(
        config: EngineConfig,
        middleware_factories: &HashMap<String, Arc<dyn MiddlewareFactory>>,
        extension_factories: &HashMap<String, Arc<dyn ExtensionFactory>>,
    ) -> Arc<Engine> {
        let engine = Arc::new(Engine {
            config: config.clone(),
            manager: OnceLock::new(),
            extensions: OnceLock::new(),
        });

        let extension_specs: Vec<ExtensionSpec> = config
            .extensions
            .iter()
            .filter_map(|entry| match extension_factories.get(&entry.cls) {
                Some(factory) => Some(ExtensionSpec {
                    name: entry.name.clone(),
                    factory: Arc::clone(factory),
                    options: entry.options.clone(),
                }),
                None => {
                    tracing::error!(cls = %entry.cls, name = %entry.name, "no extension factory registered, skipping");
                    None
                }
            })
            .collect();
        let extensions = ExtensionManager::build(extension_specs, &engine);
        engine
            .extensions
            .set(extensions)
            .unwrap_or_else(|_| unreachable!("extensions set exactly once during build"));

        let middleware_specs: Vec<MiddlewareSpec> = config
            .middlewares
            .iter()
            .filter_map(|entry| match middleware_factories.get(&entry.cls) {
                Some(factory) => Some(MiddlewareSpec {
                    id: entry.id,
                    factory: Arc::clone(factory),
                    options: entry.options.clone(),
                }),
                None => {
                    tracing::error!(cls = %entry.cls, "no middleware factory registered, skipping");
                    None
                }
            })
            .collect();
        let pipeline = Arc::new(MiddlewarePipeline::build(middleware_specs, &engine));

        let dumb_connect_timeout = config.dumb_connect_timeout_ms.map(Duration::from_millis);
        let manager = ChannelManager::new(
            pipeline,
            config.read_max,
            config.debug,
            config.channel_variant,
            dumb_connect_timeout,
            config.close_channel_mode,
        );
        engine
            .manager
            .set(manager)
            .unwrap_or_else(|_| unreachable!("manager set exactly once during build"));

        engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ChannelManager> {
        self.manager.get().expect("engine manager initialized during build")
    }

    pub fn extensions(&self) -> &ExtensionManager {
        self.extensions.get().expect("engine extensions initialized during build")
    }

    /// Runs once, before accepting any connections: extensions first (they
    /// may be shared resources middleware setup depends on), then
    /// middleware setup.
    pub async fn on_setup(&self) {
        self.extensions().setup().await;
        self.manager().setup().await;
    }

    /// Runs once, after the last channel has torn down: middleware cleanup,
    /// then extensions, the reverse of `on_setup`.
    pub async fn on_cleanup(&self) {
        self.manager().cleanup().await;
        self.extensions().cleanup().await;
    }

    /// Registers a new frontend/backend pair as a channel (spec §4.4,
    /// `ChannelManager.new_channel`).
    pub async fn on_connect(&self, frontend: Endpoint, backend: Option<Endpoint>) -> Result<Arc<Channel>, ManagerError> {
        if self.manager().is_closing().await {
            self.force_close_endpoint(frontend).await;
            return Err(ManagerError::ShuttingDown);
        }
        self.manager().new_channel(frontend, backend).await
    }

    /// Fleet-wide graceful shutdown: stop accepting new channels, close
    /// every live one (bounded by `timeout` if given, else the configured
    /// default), then run `on_cleanup`.
    pub async fn on_stop(&self, timeout: Option<Duration>) {
        let timeout = timeout.or_else(|| self.config.shutdown_timeout_ms.map(Duration::from_millis));
        self.manager().close(timeout, Some(Instant::now())).await;
        self.on_cleanup().await;
    }

    /// Immediately force-closes one channel by id, bypassing the normal
    /// deadline-based shutdown path. Supplements the distilled spec with the
    /// original's admin/debug hook for killing a single stuck connection.
    pub async fn force_close_channel(&self, channel_id: u64) {
        self.manager().close_channel(channel_id, None, None).await;
    }

    /// Rejects an inbound connection because the engine is stopping or
    /// stopped: logs a warning with the peer address, then closes the
    /// endpoint (spec §6, "To the listener").
    async fn force_close_endpoint(&self, endpoint: Endpoint) {
        tracing::warn!(peer = ?endpoint.peer_addr(), "rejecting connection, engine is shutting down");
        endpoint.close().await;
    }
}
