//! Owns every live [`Channel`] and coordinates fleet-wide shutdown.
//!
//! Grounded on `os_aio_pod_channel.manager.ChannelManager` for the
//! semantics, and on the teacher's `shutdown.rs`/`server.rs` pairing for
//! the "no new work once shutting down, wait for in-flight work to finish"
//! shape (spec §4.4, §8 "No new channels during shutdown").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::channel::{Channel, ChannelVariant};
use crate::endpoint::Endpoint;
use crate::error::ManagerError;
use crate::middleware::MiddlewarePipeline;

/// Fleet-close strategy selected by `close_channel_mode` (spec §6). `Serial`
/// awaits each live channel's `close()` one at a time; `Parallel` awaits all
/// of them concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseChannelMode {
    Serial,
    Parallel,
}

impl Default for CloseChannelMode {
    fn default() -> Self {
        CloseChannelMode::Serial
    }
}

struct State {
    channels: HashMap<u64, Arc<Channel>>,
    closing: bool,
}

/// Sole owner of the channel map. Channels never remove or close themselves
/// except through their own `transport()` teardown; the manager is the only
/// thing that decides when a fleet-wide shutdown begins.
pub struct ChannelManager {
    self_weak: Weak<ChannelManager>,
    state: Mutex<State>,
    next_id: AtomicU64,
    pipeline: Arc<MiddlewarePipeline>,
    read_max: usize,
    debug: bool,
    variant: ChannelVariant,
    dumb_connect_timeout: Option<Duration>,
    close_channel_mode: CloseChannelMode,
}

impl ChannelManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline: Arc<MiddlewarePipeline>,
        read_max: usize,
        debug: bool,
        variant: ChannelVariant,
        dumb_connect_timeout: Option<Duration>,
        close_channel_mode: CloseChannelMode,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            state: Mutex::new(State { channels: HashMap::new(), closing: false }),
            next_id: AtomicU64::new(1),
            pipeline,
            read_max,
            debug,
            variant,
            dumb_connect_timeout,
            close_channel_mode,
        })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.channels.len()
    }

    /// Whether `close` has already begun (spec §6, "To the listener").
    pub async fn is_closing(&self) -> bool {
        self.state.lock().await.closing
    }

    /// Registers a new channel and spawns its transport task. Rejected once
    /// the manager has started shutting down (spec §8, "No new channels
    /// during shutdown").
    pub async fn new_channel(&self, frontend: Endpoint, backend: Option<Endpoint>) -> Result<Arc<Channel>, ManagerError> {
        let mut state = self.state.lock().await;
        if state.closing {
            return Err(ManagerError::ShuttingDown);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let channel = Channel::new(
            self.self_weak.clone(),
            id,
            Arc::new(frontend),
            backend,
            self.read_max,
            self.dumb_connect_timeout,
            self.debug,
            Arc::clone(&self.pipeline),
            self.variant,
        );
        state.channels.insert(id, Arc::clone(&channel));
        drop(state);

        let manager = self.self_weak.upgrade().expect("manager outlives its own spawned cleanup task");
        let running = Arc::clone(&channel);
        tokio::spawn(async move {
            running.transport().await;
            manager.state.lock().await.channels.remove(&id);
        });

        Ok(channel)
    }

    /// Looks up a live channel by id, e.g. for an out-of-band close request.
    pub async fn channel(&self, id: u64) -> Option<Arc<Channel>> {
        self.state.lock().await.channels.get(&id).cloned()
    }

    /// Closes one channel by id; a no-op if it has already finished.
    pub async fn close_channel(&self, id: u64, timeout: Option<Duration>, now: Option<Instant>) {
        if let Some(channel) = self.channel(id).await {
            channel.close(timeout, now).await;
        }
    }

    /// Stops accepting new channels and closes every channel currently
    /// live, waiting for all of them to finish tearing down. `Parallel`
    /// mode awaits every channel's `close()` concurrently (spec §4.5,
    /// "concurrently await `close_channel` for every live channel"),
    /// bounding total wall-clock to roughly one channel's close regardless
    /// of fleet size; `Serial` mode (the configured default, spec §6) awaits
    /// them one at a time.
    pub async fn close(&self, timeout: Option<Duration>, now: Option<Instant>) {
        let live: Vec<Arc<Channel>> = {
            let mut state = self.state.lock().await;
            state.closing = true;
            state.channels.values().cloned().collect()
        };

        match self.close_channel_mode {
            CloseChannelMode::Parallel => {
                let mut closes = JoinSet::new();
                for channel in live {
                    closes.spawn(async move { channel.close(timeout, now).await });
                }
                while closes.join_next().await.is_some() {}
            }
            CloseChannelMode::Serial => {
                for channel in live {
                    channel.close(timeout, now).await;
                }
            }
        }
    }

    pub async fn setup(&self) {
        self.pipeline.setup().await;
    }

    pub async fn cleanup(&self) {
        self.pipeline.cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_new_channels_once_closing() {
        let manager = ChannelManager::new(
            Arc::new(MiddlewarePipeline::empty()),
            4096,
            false,
            ChannelVariant::SerialStart,
            None,
            CloseChannelMode::Serial,
        );
        manager.state.lock().await.closing = true;

        let result = manager.new_channel(Endpoint::null(), None).await;
        assert!(matches!(result, Err(ManagerError::ShuttingDown)));
    }

    #[tokio::test]
    async fn new_channel_self_removes_after_transport_finishes() {
        let manager = ChannelManager::new(
            Arc::new(MiddlewarePipeline::empty()),
            4096,
            false,
            ChannelVariant::SerialStart,
            None,
            CloseChannelMode::Serial,
        );
        let channel = manager.new_channel(Endpoint::null(), None).await.unwrap();
        // Null frontend reads as EOF immediately, so transport() finishes
        // on its own without any external close() call.
        for _ in 0..50 {
            if manager.len().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.len().await, 0);
        assert!(channel.is_closed());
    }
}
