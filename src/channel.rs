//! The per-connection state machine: two coordinated transfer tasks, the
//! connection-establishment handshake, error capture, and bounded-timeout
//! close (spec §3, §4.3, §4.4).
//!
//! Grounded on `os_aio_pod_channel.channel.FullDuplexChannel` for the
//! semantics. The action-slot machine is kept as literal fields (spec §3:
//! "two action slots... each holding the next step"), per spec §9's first
//! alternative ("a tagged state enum dispatched by a single loop") rather
//! than the source's function-pointer-in-a-slot trampoline, which has no
//! natural Rust analogue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::ChannelError;
use crate::manager::ChannelManager;
use crate::middleware::MiddlewarePipeline;

/// Regular transport lifecycle events (spec §3 "Channel event",  §8 scenario
/// traces). Kept as one flat enum of distinct symbolic names — spec §9's
/// "Open question: duplicate enum values" notes the source reuses the same
/// integer for two tags; a Rust enum can't do that by accident, so there is
/// nothing to resolve here beyond picking plain, non-overlapping names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    FrontendConnected,
    FrontendStartReading,
    BackendConnected,
    FrontendReadFinished,
    BackendReadFinished,
    FrontendClose,
    BackendClose,
    CleanupFinished,
    TransportFinished,

    // FrontendReadTimeout fires when `dumb_connect_timeout` elapses before a
    // backend is supplied (spec §6). BackendReadTimeout is reserved: nothing
    // currently bounds a wait on the backward side the way `dumb_connect_timeout`
    // bounds the forward handshake.
    FrontendReadTimeout,
    BackendReadTimeout,

    FrontendReadError,
    BackendReadError,
    FrontendWriteError,
    BackendWriteError,

    MiddlewareError,
    /// Reserved for a non-middleware, non-transport failure inside a
    /// direction's action. Rust's `Result`-based error propagation means
    /// every failure this engine can hit already arrives as either an I/O
    /// error (folded into a `*_ERROR` tag above) or a `MiddlewareError`;
    /// this tag is never emitted in normal operation.
    Unknown,

    ForwardTaskStart,
    BackwardTaskStart,
    ForwardTaskDone,
    BackwardTaskDone,
    ForwardTaskError,
    BackwardTaskError,
    ForwardTaskCancelled,
    BackwardTaskCancelled,
}

impl EventTag {
    fn is_failure(self) -> bool {
        matches!(
            self,
            EventTag::FrontendReadTimeout
                | EventTag::BackendReadTimeout
                | EventTag::FrontendReadError
                | EventTag::BackendReadError
                | EventTag::FrontendWriteError
                | EventTag::BackendWriteError
                | EventTag::MiddlewareError
                | EventTag::Unknown
                | EventTag::ForwardTaskError
                | EventTag::BackwardTaskError
        )
    }
}

/// `(event_tag, timestamp, optional_error)` — spec §3.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub tag: EventTag,
    pub at: Instant,
    pub detail: Option<String>,
}

/// Next step for the forward (frontend → backend) task, spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardAction {
    BuildConnection,
    Upstream,
    CloseBackend,
    Done,
}

/// Next step for the backward (backend → frontend) task, spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackwardAction {
    WaitConnection,
    Downstream,
    CloseFrontend,
    Done,
}

/// Which connection-establishment policy a channel follows (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelVariant {
    /// Both tasks launch at channel creation; the backward task parks in
    /// `wait_connection` until `set_backend` or the forward task's
    /// `close_backend` unblocks it.
    ParallelStart,
    /// Only the forward task launches at creation; the backward task is
    /// spawned by `set_backend`. The default (spec §6).
    SerialStart,
}

impl Default for ChannelVariant {
    fn default() -> Self {
        ChannelVariant::SerialStart
    }
}

struct ClosingTrigger {
    deadline: Instant,
    handle: JoinHandle<()>,
}

/// One relayed connection: a frontend endpoint, an eventual backend
/// endpoint, and the two tasks shuttling bytes between them through the
/// middleware pipeline (spec §3).
pub struct Channel {
    self_weak: Weak<Channel>,
    manager: Weak<ChannelManager>,
    id: u64,
    frontend: Arc<Endpoint>,
    backend: RwLock<Arc<Endpoint>>,
    read_max: usize,
    dumb_connect_timeout: Option<Duration>,
    pipeline: Arc<MiddlewarePipeline>,

    events: Option<std::sync::Mutex<Vec<ChannelEvent>>>,

    connected: AtomicBool,
    connected_notify: Notify,

    closed: AtomicBool,
    closing_notify: Notify,
    closing_trigger: Mutex<Option<ClosingTrigger>>,

    forward_action: Mutex<ForwardAction>,
    backward_action: Mutex<BackwardAction>,
    forward_task: Mutex<Option<JoinHandle<()>>>,
    backward_task: Mutex<Option<JoinHandle<()>>>,

    variant: ChannelVariant,
}

impl Channel {
    pub(crate) fn new(
        manager: Weak<ChannelManager>,
        id: u64,
        frontend: Arc<Endpoint>,
        backend: Option<Endpoint>,
        read_max: usize,
        dumb_connect_timeout: Option<Duration>,
        debug: bool,
        pipeline: Arc<MiddlewarePipeline>,
        variant: ChannelVariant,
    ) -> Arc<Self> {
        let backend_endpoint = backend.unwrap_or_else(Endpoint::null);
        let backend_known = !backend_endpoint.is_null();

        let channel = Arc::new_cyclic(|self_weak| Channel {
            self_weak: self_weak.clone(),
            manager,
            id,
            frontend,
            backend: RwLock::new(Arc::new(backend_endpoint)),
            read_max,
            dumb_connect_timeout,
            pipeline,
            events: if debug { Some(std::sync::Mutex::new(Vec::new())) } else { None },
            connected: AtomicBool::new(backend_known),
            connected_notify: Notify::new(),
            closed: AtomicBool::new(false),
            closing_notify: Notify::new(),
            closing_trigger: Mutex::new(None),
            forward_action: Mutex::new(ForwardAction::BuildConnection),
            backward_action: Mutex::new(BackwardAction::WaitConnection),
            forward_task: Mutex::new(None),
            backward_task: Mutex::new(None),
            variant,
        });

        channel.record_event(EventTag::FrontendConnected, None);
        if backend_known {
            channel.record_event(EventTag::BackendConnected, None);
        }
        channel
    }

    #[cfg(test)]
    pub(crate) fn for_pipeline_tests() -> Arc<Channel> {
        Channel::new(
            Weak::new(),
            0,
            Arc::new(Endpoint::null()),
            None,
            crate::config::DEFAULT_READ_MAX,
            None,
            false,
            Arc::new(MiddlewarePipeline::empty()),
            ChannelVariant::SerialStart,
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn manager(&self) -> Option<Arc<ChannelManager>> {
        self.manager.upgrade()
    }

    /// Snapshot of recorded events; empty unless the channel was built with
    /// debug tracing enabled.
    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events
            .as_ref()
            .map(|events| events.lock().unwrap().clone())
            .unwrap_or_default()
    }

    fn record_event(&self, tag: EventTag, detail: Option<String>) {
        if tag.is_failure() {
            tracing::warn!(channel = self.id, ?tag, detail = detail.as_deref(), "channel event");
        } else {
            tracing::debug!(channel = self.id, ?tag, "channel event");
        }
        if let Some(events) = &self.events {
            events.lock().unwrap().push(ChannelEvent { tag, at: Instant::now(), detail });
        }
    }

    async fn backend_snapshot(&self) -> Arc<Endpoint> {
        self.backend.read().await.clone()
    }

    /// Supplies the backend endpoint. Spec §9 ("Open question: concurrent
    /// `set_backend`") resolves a second call as a precondition failure
    /// rather than an assertion.
    pub async fn set_backend(&self, endpoint: Endpoint) -> Result<(), ChannelError> {
        {
            let mut guard = self.backend.write().await;
            if !guard.is_null() {
                return Err(ChannelError::BackendAlreadySet);
            }
            *guard = Arc::new(endpoint);
        }
        self.record_event(EventTag::BackendConnected, None);

        let was_connected = self.connected.swap(true, Ordering::AcqRel);
        if !was_connected {
            self.connected_notify.notify_waiters();
        }

        if self.variant == ChannelVariant::SerialStart {
            self.spawn_backward_task_if_absent().await;
        }
        Ok(())
    }

    async fn spawn_backward_task_if_absent(&self) {
        let mut guard = self.backward_task.lock().await;
        if guard.is_none() {
            let channel = self.self_weak.upgrade().expect("channel outlives its own tasks");
            *guard = Some(tokio::spawn(async move { Channel::run_backward(channel).await }));
        }
    }

    /// Runs the channel until both directions have drained or been
    /// cancelled, then tears down endpoints, runs middleware close hooks,
    /// and flips `closed`. This is the only path that sets `closed` (spec
    /// §4.4).
    pub async fn transport(self: Arc<Self>) {
        self.start_tasks().await;
        self.await_tasks().await;

        self.close_endpoints_if_open().await;
        self.pipeline.close(&self).await;

        self.record_event(EventTag::CleanupFinished, None);
        self.record_event(EventTag::TransportFinished, None);

        self.closed.store(true, Ordering::Release);
        self.closing_notify.notify_waiters();
    }

    async fn start_tasks(&self) {
        {
            let mut guard = self.forward_task.lock().await;
            let channel = self.self_weak.upgrade().expect("channel outlives its own tasks");
            *guard = Some(tokio::spawn(async move { Channel::run_forward(channel).await }));
        }
        if self.variant == ChannelVariant::ParallelStart {
            let mut guard = self.backward_task.lock().await;
            let channel = self.self_weak.upgrade().expect("channel outlives its own tasks");
            *guard = Some(tokio::spawn(async move { Channel::run_backward(channel).await }));
        }
    }

    async fn await_tasks(&self) {
        let forward = self.forward_task.lock().await.take();
        let backward = self.backward_task.lock().await.take();
        if let Some(handle) = forward {
            self.await_one(handle, true).await;
        }
        if let Some(handle) = backward {
            self.await_one(handle, false).await;
        }
    }

    async fn await_one(&self, handle: JoinHandle<()>, forward: bool) {
        let (done, cancelled, error) = if forward {
            (EventTag::ForwardTaskDone, EventTag::ForwardTaskCancelled, EventTag::ForwardTaskError)
        } else {
            (EventTag::BackwardTaskDone, EventTag::BackwardTaskCancelled, EventTag::BackwardTaskError)
        };
        match handle.await {
            Ok(()) => self.record_event(done, None),
            Err(join_error) if join_error.is_cancelled() => self.record_event(cancelled, None),
            Err(join_error) => self.record_event(error, Some(join_error.to_string())),
        }
    }

    async fn close_endpoints_if_open(&self) {
        if !self.frontend.closed() {
            self.frontend.close().await;
            self.record_event(EventTag::FrontendClose, None);
        }
        let backend = self.backend_snapshot().await;
        if !backend.closed() {
            backend.close().await;
            self.record_event(EventTag::BackendClose, None);
        }
    }

    /// Cancels both in-flight tasks immediately, no deadline.
    async fn cancel_tasks(&self) {
        if let Some(handle) = self.forward_task.lock().await.as_ref() {
            handle.abort();
        }
        if let Some(handle) = self.backward_task.lock().await.as_ref() {
            handle.abort();
        }
    }

    /// Arranges termination (immediately, or at a deadline) and waits for
    /// it to land. Spec §4.4.
    pub async fn close(&self, timeout: Option<Duration>, now: Option<Instant>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        self.arm_close(timeout, now).await;

        let notified = self.closing_notify.notified();
        tokio::pin!(notified);
        if !self.closed.load(Ordering::Acquire) {
            notified.await;
        }
    }

    async fn arm_close(&self, timeout: Option<Duration>, now: Option<Instant>) {
        let Some(timeout) = timeout else {
            let mut guard = self.closing_trigger.lock().await;
            if let Some(trigger) = guard.take() {
                trigger.handle.abort();
            }
            drop(guard);
            self.cancel_tasks().await;
            return;
        };

        let now_monotonic = Instant::now();
        let elapsed = now.map(|t| now_monotonic.saturating_duration_since(t)).unwrap_or(Duration::ZERO);
        let remaining = timeout.saturating_sub(elapsed);
        let deadline = now_monotonic + remaining;

        let mut guard = self.closing_trigger.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.deadline <= deadline {
                return;
            }
            existing.handle.abort();
        }

        // The timer callback only needs to cancel tasks; it must not keep
        // the channel alive on its own, so it captures a weak reference
        // rather than cloning an owning `Arc`.
        let channel_for_timer = self.self_weak.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(channel) = channel_for_timer.upgrade() {
                channel.cancel_tasks().await;
            }
        });
        *guard = Some(ClosingTrigger { deadline, handle });
    }

    async fn run_forward(channel: Arc<Channel>) {
        channel.record_event(EventTag::ForwardTaskStart, None);
        let mut bypass: Option<Bytes> = None;
        loop {
            let action = *channel.forward_action.lock().await;
            match action {
                ForwardAction::BuildConnection => {
                    bypass = channel.do_build_connection().await;
                }
                ForwardAction::Upstream => {
                    channel.do_upstream(bypass.take()).await;
                }
                ForwardAction::CloseBackend => {
                    channel.do_close_backend().await;
                }
                ForwardAction::Done => break,
            }
        }
    }

    /// Read-before-connect: buffers/transforms frontend bytes until a
    /// backend exists, then hands the first post-handshake chunk off to
    /// `upstream` as the bypass value (spec §4.3, §5 ordering guarantee).
    async fn do_build_connection(&self) -> Option<Bytes> {
        self.record_event(EventTag::FrontendStartReading, None);
        let deadline = self.dumb_connect_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let read = self.frontend.read(self.read_max);
            let data = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, read).await {
                    Ok(result) => match result {
                        Ok(data) => data,
                        Err(_) => {
                            self.record_event(EventTag::FrontendReadError, None);
                            *self.forward_action.lock().await = ForwardAction::CloseBackend;
                            return None;
                        }
                    },
                    Err(_) => {
                        self.record_event(EventTag::FrontendReadTimeout, None);
                        *self.forward_action.lock().await = ForwardAction::CloseBackend;
                        return None;
                    }
                },
                None => match read.await {
                    Ok(data) => data,
                    Err(_) => {
                        self.record_event(EventTag::FrontendReadError, None);
                        *self.forward_action.lock().await = ForwardAction::CloseBackend;
                        return None;
                    }
                },
            };
            if data.is_empty() {
                self.record_event(EventTag::FrontendReadFinished, None);
                *self.forward_action.lock().await = ForwardAction::CloseBackend;
                return None;
            }

            match self.pipeline.forward(self, data).await {
                Ok(Some(transformed)) => {
                    if self.connected.load(Ordering::Acquire) {
                        *self.forward_action.lock().await = ForwardAction::Upstream;
                        return Some(transformed);
                    }
                    // Not connected yet: discard and keep reading. A
                    // middleware handshake is expected to call
                    // `set_backend` from within this same forward() call.
                }
                Ok(None) => {
                    // Dropped chunk; keep reading.
                }
                Err(error) => {
                    self.record_event(EventTag::MiddlewareError, Some(error.to_string()));
                    *self.forward_action.lock().await = ForwardAction::CloseBackend;
                    return None;
                }
            }
        }
    }

    /// Steady-state forwarding: write the bypass chunk (if any), then loop
    /// reading/transforming/writing until EOF or an error (spec §4.3).
    async fn do_upstream(&self, bypass: Option<Bytes>) {
        let mut pending = bypass;
        loop {
            if let Some(chunk) = pending.take() {
                if !chunk.is_empty() {
                    let backend = self.backend_snapshot().await;
                    if backend.flush_write(&chunk).await.is_err() {
                        self.record_event(EventTag::BackendWriteError, None);
                        *self.forward_action.lock().await = ForwardAction::CloseBackend;
                        return;
                    }
                }
            }

            let data = match self.frontend.read(self.read_max).await {
                Ok(data) => data,
                Err(_) => {
                    self.record_event(EventTag::FrontendReadError, None);
                    *self.forward_action.lock().await = ForwardAction::CloseBackend;
                    return;
                }
            };
            if data.is_empty() {
                self.record_event(EventTag::FrontendReadFinished, None);
                *self.forward_action.lock().await = ForwardAction::CloseBackend;
                return;
            }

            match self.pipeline.forward(self, data).await {
                Ok(Some(transformed)) => pending = Some(transformed),
                Ok(None) => pending = None,
                Err(error) => {
                    self.record_event(EventTag::MiddlewareError, Some(error.to_string()));
                    *self.forward_action.lock().await = ForwardAction::CloseBackend;
                    return;
                }
            }
        }
    }

    /// Terminal forward step: closes the backend if still open, and — if
    /// the channel never reached a connected state — sets `connected` now
    /// so a parked backward task unblocks into its own teardown.
    async fn do_close_backend(&self) {
        let backend = self.backend_snapshot().await;
        if !backend.closed() {
            self.record_event(EventTag::BackendClose, None);
            backend.close().await;
        }
        let was_connected = self.connected.swap(true, Ordering::AcqRel);
        if !was_connected {
            self.connected_notify.notify_waiters();
        }
        *self.forward_action.lock().await = ForwardAction::Done;
    }

    async fn run_backward(channel: Arc<Channel>) {
        channel.record_event(EventTag::BackwardTaskStart, None);
        loop {
            let action = *channel.backward_action.lock().await;
            match action {
                BackwardAction::WaitConnection => channel.do_wait_connection().await,
                BackwardAction::Downstream => channel.do_downstream().await,
                BackwardAction::CloseFrontend => {
                    channel.do_close_frontend().await;
                }
                BackwardAction::Done => break,
            }
        }
    }

    async fn do_wait_connection(&self) {
        // Register interest before checking the flag so a notification
        // that fires between the check and the await is never missed.
        let notified = self.connected_notify.notified();
        tokio::pin!(notified);
        if !self.connected.load(Ordering::Acquire) {
            notified.await;
        }
        *self.backward_action.lock().await = BackwardAction::Downstream;
    }

    async fn do_downstream(&self) {
        let backend = self.backend_snapshot().await;
        if backend.closed() {
            *self.backward_action.lock().await = BackwardAction::CloseFrontend;
            return;
        }

        loop {
            let data = match backend.read(self.read_max).await {
                Ok(data) => data,
                Err(_) => {
                    self.record_event(EventTag::BackendReadError, None);
                    break;
                }
            };
            if data.is_empty() {
                self.record_event(EventTag::BackendReadFinished, None);
                break;
            }

            match self.pipeline.backward(self, data).await {
                Ok(Some(transformed)) => {
                    if !transformed.is_empty() && self.frontend.flush_write(&transformed).await.is_err() {
                        self.record_event(EventTag::FrontendWriteError, None);
                        break;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    self.record_event(EventTag::MiddlewareError, Some(error.to_string()));
                    break;
                }
            }
        }

        *self.backward_action.lock().await = BackwardAction::CloseFrontend;
    }

    async fn do_close_frontend(&self) {
        if !self.frontend.closed() {
            self.frontend.close().await;
            self.record_event(EventTag::FrontendClose, None);
        }
        *self.backward_action.lock().await = BackwardAction::Done;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept_result, connect_result) = tokio::join!(listener.accept(), connect);
        (accept_result.unwrap().0, connect_result.unwrap())
    }

    #[tokio::test]
    async fn echo_proxy_serial_start_emits_expected_event_order() {
        let (frontend_server_side, mut frontend_client_side) = loopback_pair().await;
        let (backend_listener_side, echo_stream) = loopback_pair().await;

        // Echo server: bounce whatever it reads right back.
        tokio::spawn(async move {
            let mut echo_stream = echo_stream;
            let mut buf = [0u8; 1024];
            loop {
                let n = tokio::io::AsyncReadExt::read(&mut echo_stream, &mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                let _ = tokio::io::AsyncWriteExt::write_all(&mut echo_stream, &buf[..n]).await;
            }
        });

        let channel = Channel::new(
            Weak::new(),
            1,
            Arc::new(Endpoint::from_tcp_stream(frontend_server_side)),
            None,
            65536,
            None,
            true,
            Arc::new(MiddlewarePipeline::empty()),
            ChannelVariant::SerialStart,
        );

        channel.set_backend(Endpoint::from_tcp_stream(backend_listener_side)).await.unwrap();

        frontend_client_side.write_all(b"ping").await.unwrap();
        drop(frontend_client_side.shutdown().await);

        channel.clone().transport().await;

        let tags: Vec<EventTag> = channel.events().into_iter().map(|e| e.tag).collect();
        assert!(tags.contains(&EventTag::FrontendConnected));
        assert!(tags.contains(&EventTag::BackendConnected));
        assert!(tags.contains(&EventTag::FrontendReadFinished) || tags.contains(&EventTag::BackendReadFinished));
        assert_eq!(tags.last().copied(), Some(EventTag::TransportFinished));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn null_backend_traffic_drains_and_closes_cleanly() {
        let (server_side, mut client_side) = loopback_pair().await;

        let channel = Channel::new(
            Weak::new(),
            2,
            Arc::new(Endpoint::from_tcp_stream(server_side)),
            None,
            65536,
            None,
            true,
            Arc::new(MiddlewarePipeline::empty()),
            ChannelVariant::SerialStart,
        );

        client_side.write_all(b"hello").await.unwrap();
        drop(client_side.shutdown().await);

        channel.clone().transport().await;

        let tags: Vec<EventTag> = channel.events().into_iter().map(|e| e.tag).collect();
        assert!(tags.contains(&EventTag::FrontendReadFinished));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn set_backend_twice_is_rejected() {
        let (server_side, _client_side) = loopback_pair().await;
        let (other_side, _other_client) = loopback_pair().await;

        let channel = Channel::new(
            Weak::new(),
            3,
            Arc::new(Endpoint::from_tcp_stream(server_side)),
            None,
            65536,
            None,
            false,
            Arc::new(MiddlewarePipeline::empty()),
            ChannelVariant::ParallelStart,
        );

        channel.set_backend(Endpoint::from_tcp_stream(other_side)).await.unwrap();
        let (third_side, _third_client) = loopback_pair().await;
        let err = channel.set_backend(Endpoint::from_tcp_stream(third_side)).await.unwrap_err();
        assert!(matches!(err, ChannelError::BackendAlreadySet));

        channel.close(None, None).await;
    }

    // Real time: the blocked read is on a genuine socket, so paused virtual
    // time's auto-advance (which assumes every parked task is waiting on a
    // timer) isn't something to rely on here.
    #[tokio::test]
    async fn close_with_timeout_cancels_a_blocked_read() {
        let (server_side, _client_side) = loopback_pair().await;

        let channel = Channel::new(
            Weak::new(),
            4,
            Arc::new(Endpoint::from_tcp_stream(server_side)),
            None,
            65536,
            None,
            true,
            Arc::new(MiddlewarePipeline::empty()),
            ChannelVariant::SerialStart,
        );

        let running = channel.clone();
        let transport_handle = tokio::spawn(async move { running.transport().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.close(Some(Duration::from_millis(50)), Some(Instant::now())).await;

        transport_handle.await.unwrap();
        assert!(channel.is_closed());

        let tags: Vec<EventTag> = channel.events().into_iter().map(|e| e.tag).collect();
        assert!(!tags.contains(&EventTag::FrontendReadError));
    }
}
