//! Named, ordered extension registry.
//!
//! Supplements the distilled spec from `original_source/os_aio_pod_channel/extension.py`:
//! extensions are engine-lifetime singletons (database pools, metrics
//! sinks, anything that isn't per-connection) set up once at engine start
//! and torn down once at engine stop, looked up by name from middleware or
//! application code. Grounded structurally on [`crate::middleware`]'s
//! factory/registry split.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::engine::Engine;
use crate::error::LoadError;

type HookError = Box<dyn std::error::Error + Send + Sync>;

/// An engine-lifetime singleton with setup/cleanup hooks.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn setup(&self) -> Result<(), HookError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), HookError> {
        Ok(())
    }
}

/// Resolves a configured extension class name to a constructor. As with
/// [`crate::middleware::MiddlewareFactory`], turning a `cls` string into one
/// of these is left to the caller (spec §1).
pub trait ExtensionFactory: Send + Sync + std::fmt::Debug {
    fn class_name(&self) -> &str;
    fn build(&self, engine: &Engine, options: &Map<String, Value>) -> Result<Box<dyn Extension>, LoadError>;
}

/// One configured extension entry: a registry name and a resolved factory.
#[derive(Clone)]
pub struct ExtensionSpec {
    pub name: String,
    pub factory: Arc<dyn ExtensionFactory>,
    pub options: Map<String, Value>,
}

/// Name-keyed registry of extension instances, in configured order.
///
/// `order`/`instances` are each behind a plain `std::sync::Mutex`, matching
/// `Channel::events`'s use of the same type for bookkeeping that's never
/// held across an `.await` — `setup` clones the name it's about to touch
/// out from under the lock before awaiting the extension's own `setup()`.
pub struct ExtensionManager {
    order: std::sync::Mutex<Vec<String>>,
    instances: std::sync::Mutex<HashMap<String, Arc<dyn Extension>>>,
}

impl ExtensionManager {
    pub fn empty() -> Self {
        Self { order: std::sync::Mutex::new(Vec::new()), instances: std::sync::Mutex::new(HashMap::new()) }
    }

    /// Instantiates each entry in configured order. A failing build is
    /// logged and the entry is skipped, mirroring the middleware loader's
    /// load-time error policy (spec §7).
    pub fn build(entries: Vec<ExtensionSpec>, engine: &Engine) -> Self {
        let mut order = Vec::with_capacity(entries.len());
        let mut instances = HashMap::with_capacity(entries.len());

        for entry in entries {
            match entry.factory.build(engine, &entry.options) {
                Ok(extension) => {
                    tracing::debug!(name = %entry.name, class = entry.factory.class_name(), "loaded extension");
                    order.push(entry.name.clone());
                    instances.insert(entry.name, Arc::from(extension));
                }
                Err(error) => {
                    tracing::error!(name = %entry.name, class = entry.factory.class_name(), %error, "failed to load extension, skipping");
                }
            }
        }

        Self { order: std::sync::Mutex::new(order), instances: std::sync::Mutex::new(instances) }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    /// Runs each extension's `setup` in configured order. An extension whose
    /// `setup` fails is removed from the registry (both `order` and
    /// `instances`) so `cleanup` never runs on it, matching the original's
    /// `self.extensions.pop(name, None)` on a failed setup.
    pub async fn setup(&self) {
        let names: Vec<String> = self.order.lock().unwrap().clone();
        for name in names {
            let extension = self.instances.lock().unwrap().get(&name).cloned();
            let Some(extension) = extension else { continue };
            if let Err(error) = extension.setup().await {
                tracing::error!(%name, %error, "extension setup failed, removing from registry");
                self.instances.lock().unwrap().remove(&name);
                self.order.lock().unwrap().retain(|n| n != &name);
            }
        }
    }

    pub async fn cleanup(&self) {
        let names: Vec<String> = self.order.lock().unwrap().iter().rev().cloned().collect();
        for name in names {
            let extension = self.instances.lock().unwrap().get(&name).cloned();
            let Some(extension) = extension else { continue };
            if let Err(error) = extension.cleanup().await {
                tracing::error!(%name, %error, "extension cleanup failed");
            }
        }
    }
}
