//! Thread-safe client handle.
//!
//! [`Client`] composes the Sans-IO state machines from `pitaya-core` behind a
//! single lock and drives them from a tokio task:
//!
//! - caller operations (`connect`, `request`, ...) mutate the state machines
//!   directly and return immediately
//! - the driver task feeds transport reports and timer expiries into the same
//!   state machines
//! - everything user-visible (event callbacks, call completions) is appended
//!   to one outbox while the lock is held, then run by a single drainer with
//!   the lock released
//!
//! The outbox is what provides causal ordering: deliveries are queued in the
//! order the state machines produced them and only one thread runs them at a
//! time. Callbacks may call back into the client.
//!
//! With [`ClientConfig::enable_polling`] the driver never drains the outbox;
//! deliveries wait for [`Client::poll`] on the caller's thread.

use std::{
    cell::Cell,
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use pitaya_core::{
    AttemptId, CallError, CallId, CallKind, CallRegistry, CancelReason, ClientConfig, ClientState,
    Connection, ConnectionAction, Environment, Event, EventDispatcher, EventFilter, HandlerId,
    MAX_TIMEOUT, PinStore, Target, TransportEvent, TransportKind,
};
use pitaya_proto::Message;
use tokio::{
    runtime::{Handle, Runtime},
    sync::{Notify, mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, info, trace, warn};

use crate::{
    error::ClientError,
    system_env::SystemEnv,
    tls::TlsOptions,
    transport::{
        Connector, LinkEvent, LinkHandle, LinkReport, TcpConnector, TlsConnector, spawn_link,
    },
};

/// Completion for a request: the response body or the failure.
pub type ResponseCallback = Box<dyn FnOnce(Result<Vec<u8>, CallError>) + Send>;

/// Completion for a notify: `None` once written, the failure otherwise.
pub type NotifyCallback = Box<dyn FnOnce(Option<CallError>) + Send>;

/// Event handler callback.
pub type EventCallback = Box<dyn FnMut(&Event) + Send>;

/// Error code reported when an error response carries no decodable body.
const UNKNOWN_SERVER_ERROR: &str = "PIT-500";

thread_local! {
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

enum Completion {
    Request(ResponseCallback),
    Notify(NotifyCallback),
}

impl Completion {
    fn complete(self, outcome: Result<Vec<u8>, CallError>) {
        match self {
            Self::Request(callback) => callback(outcome),
            Self::Notify(callback) => callback(outcome.err()),
        }
    }
}

struct CallbackSlot {
    removed: AtomicBool,
    callback: Mutex<EventCallback>,
}

impl CallbackSlot {
    /// Stop deliveries to this slot.
    ///
    /// Waits out a delivery running on another thread. From inside a
    /// callback this thread is the drainer, so there is nothing to wait for.
    fn retire(&self) {
        self.removed.store(true, Ordering::Release);
        if !DRAINING.with(Cell::get) {
            drop(self.callback.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

#[derive(Clone)]
enum Handler {
    Callback(Arc<CallbackSlot>),
    Channel(mpsc::UnboundedSender<Event>),
}

enum Delivery {
    Event { handler: HandlerId, slot: Arc<CallbackSlot>, event: Event },
    Call { id: CallId, completion: Completion, outcome: Result<Vec<u8>, CallError> },
}

impl Delivery {
    fn run(self) {
        match self {
            Self::Event { handler, slot, event } => {
                let mut callback = slot.callback.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.removed.load(Ordering::Acquire) {
                    trace!(%handler, kind = ?event.kind, "handler removed, skipping");
                    return;
                }
                callback(&event);
            },
            Self::Call { id, completion, outcome } => {
                trace!(%id, ok = outcome.is_ok(), "call resolved");
                completion.complete(outcome);
            },
        }
    }
}

struct Core {
    conn: Connection<Instant>,
    calls: CallRegistry<Instant, Completion>,
    handlers: EventDispatcher<Handler>,
    links: HashMap<AttemptId, LinkHandle>,
    outbox: VecDeque<Delivery>,
}

struct Shared {
    core: Mutex<Core>,
    drain: Mutex<()>,
    wake: Notify,
    env: SystemEnv,
    runtime: Handle,
    connector: Arc<dyn Connector>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    polling: bool,
    default_timeout: Duration,
}

/// Whether a drain may wait for a concurrent drainer.
#[derive(Clone, Copy, PartialEq, Eq)]
enum DrainMode {
    IfIdle,
    Wait,
}

/// Resets the per-thread draining flag, even if a callback panics.
struct DrainingFlag;

impl DrainingFlag {
    fn set() -> Self {
        DRAINING.with(|d| d.set(true));
        Self
    }
}

impl Drop for DrainingFlag {
    fn drop(&mut self) {
        DRAINING.with(|d| d.set(false));
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Execute state machine actions. Called with the core lock held.
    fn execute(&self, core: &mut Core, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::OpenTransport { attempt, target } => {
                    let link = spawn_link(
                        &self.runtime,
                        attempt,
                        target,
                        self.connector.clone(),
                        self.link_events.clone(),
                    );
                    core.links.insert(attempt, link);
                },
                ConnectionAction::SendPacket { attempt, packet, ack } => {
                    let sent = core.links.get(&attempt).is_some_and(|link| link.send(packet, ack));
                    if !sent {
                        debug!(%attempt, "dropping packet for closed transport");
                    }
                },
                ConnectionAction::CloseTransport { attempt, reason } => {
                    if let Some(link) = core.links.remove(&attempt) {
                        link.close(reason);
                    }
                },
                ConnectionAction::Emit(event) => Self::emit(core, &event),
                ConnectionAction::FailPendingCalls(reason) => {
                    let calls = core.calls.drain();
                    if !calls.is_empty() {
                        debug!(count = calls.len(), %reason, "cancelling pending calls");
                    }
                    for call in calls {
                        core.outbox.push_back(Delivery::Call {
                            id: call.id,
                            completion: call.completion,
                            outcome: Err(CallError::Cancelled(reason)),
                        });
                    }
                },
                ConnectionAction::Response(message) => Self::resolve_response(core, message),
            }
        }
    }

    fn emit(core: &mut Core, event: &Event) {
        debug!(kind = ?event.kind, primary = ?event.primary, "event");
        for (handler, target) in core.handlers.route(event) {
            match target {
                Handler::Callback(slot) => {
                    core.outbox.push_back(Delivery::Event { handler, slot, event: event.clone() });
                },
                Handler::Channel(sender) => {
                    if sender.send(event.clone()).is_err() {
                        trace!(%handler, "subscriber dropped its receiver");
                    }
                },
            }
        }
    }

    fn resolve_response(core: &mut Core, message: Message) {
        let Some(seq) = message.id else {
            warn!("response without id");
            return;
        };
        let Some(call) = core.calls.take_response(seq) else {
            warn!(seq, "discarding response for unknown or expired call");
            return;
        };

        let outcome = if message.error {
            Err(match message.error_body() {
                Some(body) => CallError::Server { code: body.code, message: body.message },
                None => CallError::Server {
                    code: UNKNOWN_SERVER_ERROR.to_string(),
                    message: String::from_utf8_lossy(&message.body).into_owned(),
                },
            })
        } else {
            Ok(message.body)
        };

        core.outbox.push_back(Delivery::Call { id: call.id, completion: call.completion, outcome });
    }

    fn on_link_event(&self, event: LinkEvent) {
        let LinkEvent { attempt, report } = event;
        let now = self.env.now();
        let mut core = self.lock();

        match report {
            LinkReport::Transport(event) => {
                if matches!(
                    event,
                    TransportEvent::ConnectFailed(_) | TransportEvent::Disconnected { .. }
                ) {
                    core.links.remove(&attempt);
                }
                let actions = core.conn.handle_transport(attempt, event, now);
                self.execute(&mut core, actions);
            },
            LinkReport::Written(seq) => {
                if let Some(call) = core.calls.take_written(seq) {
                    core.outbox.push_back(Delivery::Call {
                        id: call.id,
                        completion: call.completion,
                        outcome: Ok(Vec::new()),
                    });
                }
            },
        }
    }

    fn on_timer(&self) {
        let now = self.env.now();
        let mut core = self.lock();

        let actions = core.conn.tick(now);
        self.execute(&mut core, actions);

        for call in core.calls.expire(now) {
            debug!(id = %call.id, route = %call.route, "call timed out");
            core.outbox.push_back(Delivery::Call {
                id: call.id,
                completion: call.completion,
                outcome: Err(CallError::Timeout),
            });
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let core = self.lock();
        match (core.conn.next_deadline(), core.calls.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn pop(&self) -> Option<Delivery> {
        self.lock().outbox.pop_front()
    }

    /// Run queued deliveries in order, one drainer at a time.
    fn drain(&self, mode: DrainMode) {
        // A callback further up this thread's stack is already draining
        if DRAINING.with(Cell::get) {
            return;
        }

        loop {
            let guard = match mode {
                DrainMode::Wait => self.drain.lock().unwrap_or_else(PoisonError::into_inner),
                DrainMode::IfIdle => match self.drain.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                    Err(TryLockError::WouldBlock) => return,
                },
            };

            {
                let _flag = DrainingFlag::set();
                while let Some(delivery) = self.pop() {
                    delivery.run();
                }
            }
            drop(guard);

            // Deliveries queued after our last pop but before the unlock
            if self.lock().outbox.is_empty() {
                return;
            }
        }
    }

    fn after_io(&self) {
        if !self.polling {
            self.drain(DrainMode::IfIdle);
        }
    }
}

async fn drive(
    shared: Arc<Shared>,
    mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let deadline = shared.next_deadline();
        let timer = async {
            match deadline {
                Some(deadline) => shared.env.sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some(event) = link_events.recv() => shared.on_link_event(event),
            () = shared.wake.notified() => {},
            () = timer => shared.on_timer(),
        }

        shared.after_io();
    }

    debug!("driver stopped");
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    pins: PinStore,
    tls: TlsOptions,
    connector: Option<Arc<dyn Connector>>,
    runtime: Option<Handle>,
}

impl ClientBuilder {
    /// Pin store consulted during TLS handshakes.
    #[must_use]
    pub fn pins(mut self, pins: PinStore) -> Self {
        self.pins = pins;
        self
    }

    /// CA roots for TLS connections.
    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Replace the transport selected by [`ClientConfig::transport`].
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Run on an existing tokio runtime.
    ///
    /// Defaults to the ambient runtime when built inside one, otherwise the
    /// client starts its own single-worker runtime.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Validate the configuration and start the client.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` for an invalid configuration
    /// - `ClientError::Tls` if the TLS configuration cannot be built
    /// - `ClientError::Runtime` if no runtime is available and none can be
    ///   started
    pub fn build(self) -> Result<Client, ClientError> {
        self.config.validate()?;

        let connector: Arc<dyn Connector> = match (self.connector, self.config.transport) {
            (Some(connector), _) => connector,
            (None, TransportKind::Tcp) => Arc::new(TcpConnector),
            (None, TransportKind::Tls) => {
                Arc::new(TlsConnector::new(&self.tls, self.pins.clone())?)
            },
        };

        let (owned_runtime, runtime) = match self.runtime.or_else(|| Handle::try_current().ok()) {
            Some(handle) => (None, handle),
            None => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .thread_name("pitaya-client")
                    .enable_all()
                    .build()
                    .map_err(|e| ClientError::Runtime(e.to_string()))?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            },
        };

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                conn: Connection::new(self.config.clone()),
                calls: CallRegistry::new(),
                handlers: EventDispatcher::new(),
                links: HashMap::new(),
                outbox: VecDeque::new(),
            }),
            drain: Mutex::new(()),
            wake: Notify::new(),
            env: SystemEnv::new(),
            runtime: runtime.clone(),
            connector,
            link_events: link_tx,
            polling: self.config.enable_polling,
            default_timeout: self.config.default_request_timeout,
        });

        runtime.spawn(drive(shared.clone(), link_rx, shutdown_rx));
        info!(transport = ?self.config.transport, polling = self.config.enable_polling, "client initialized");

        Ok(Client { shared, pins: self.pins, runtime: owned_runtime, shutdown: Some(shutdown_tx) })
    }
}

/// Pitaya client handle.
///
/// All methods are non-blocking. Connection outcomes surface as events,
/// call outcomes through the completion passed to [`Client::request`] or
/// [`Client::notify`].
///
/// Dropping the handle performs [`Client::cleanup`].
pub struct Client {
    shared: Arc<Shared>,
    pins: PinStore,
    runtime: Option<Runtime>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("state", &self.state()).finish_non_exhaustive()
    }
}

impl Client {
    /// Start a client with default pins and TLS options.
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::build`].
    pub fn init(config: ClientConfig) -> Result<Self, ClientError> {
        Self::builder(config).build()
    }

    /// Builder for a client with custom pins, TLS roots or transport.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder {
            config,
            pins: PinStore::new(),
            tls: TlsOptions::new(),
            connector: None,
            runtime: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        self.shared.lock().conn.state()
    }

    /// Round-trip estimate from recent heartbeats.
    pub fn rtt(&self) -> Option<Duration> {
        self.shared.lock().conn.rtt()
    }

    /// Pin store consulted by this client's TLS handshakes.
    pub fn pins(&self) -> &PinStore {
        &self.pins
    }

    /// Start connecting. `extra` is sent to the server in the handshake.
    ///
    /// # Errors
    ///
    /// - `ClientError::Connection` unless the client is `Inited`
    pub fn connect(&self, host: &str, port: u16, extra: Option<&str>) -> Result<(), ClientError> {
        let mut target = Target::new(host, port);
        target.handshake_data = extra.map(str::to_string);

        self.apply(|core, now| core.conn.connect(target, now))
    }

    /// Close the session.
    ///
    /// Pending calls fail with `Cancelled(Disconnected)` and a `Disconnect`
    /// event follows once the transport closed.
    ///
    /// # Errors
    ///
    /// - `ClientError::Connection` unless connected, or connecting with
    ///   reconnect enabled
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.apply(|core, now| core.conn.disconnect(now))
    }

    /// Release the client.
    ///
    /// Cancels reconnect work, closes the transport and resolves every pending
    /// call with `Cancelled(Cleanup)` before returning (unless another thread
    /// is mid-delivery, in which case that thread resolves them). No events
    /// are emitted and queued events are discarded.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the handle is consumed so a second cleanup
    /// cannot be expressed.
    pub fn cleanup(mut self) -> Result<(), ClientError> {
        self.release()
    }

    /// Register an event callback.
    ///
    /// The callback only sees events emitted after registration.
    ///
    /// # Errors
    ///
    /// - `ClientError::Handler` if the handler table is full
    pub fn add_event_handler<F>(&self, filter: EventFilter, callback: F) -> Result<HandlerId, ClientError>
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let slot = Arc::new(CallbackSlot {
            removed: AtomicBool::new(false),
            callback: Mutex::new(Box::new(callback)),
        });
        let id = self.shared.lock().handlers.add(filter, Handler::Callback(slot))?;
        debug!(%id, "event handler added");
        Ok(id)
    }

    /// Subscribe to events through a channel.
    ///
    /// The receiver yields events in emission order and ends when the
    /// subscription is removed or the client is cleaned up.
    ///
    /// # Errors
    ///
    /// - `ClientError::Handler` if the handler table is full
    pub fn subscribe(
        &self,
        filter: EventFilter,
    ) -> Result<(HandlerId, mpsc::UnboundedReceiver<Event>), ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.lock().handlers.add(filter, Handler::Channel(tx))?;
        Ok((id, rx))
    }

    /// Listen for pushes on `route`.
    ///
    /// `callback` receives the push body. Any number of callbacks may listen
    /// on one route; [`Client::off_route`] removes all of them, and
    /// [`Client::remove_event_handler`] removes one.
    ///
    /// # Errors
    ///
    /// - `ClientError::Handler` if the handler table is full
    pub fn on_route<F>(&self, route: &str, mut callback: F) -> Result<HandlerId, ClientError>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let slot = Arc::new(CallbackSlot {
            removed: AtomicBool::new(false),
            callback: Mutex::new(Box::new(move |event: &Event| {
                callback(event.secondary.as_deref().unwrap_or_default());
            })),
        });
        let id = self.shared.lock().handlers.add_route(route, Handler::Callback(slot))?;
        debug!(%id, route, "route handler added");
        Ok(id)
    }

    /// Stop listening on `route`. Returns how many callbacks were removed.
    ///
    /// Like [`Client::remove_event_handler`], none of them runs after this
    /// returns.
    pub fn off_route(&self, route: &str) -> usize {
        let removed = self.shared.lock().handlers.remove_route(route);
        for (_, handler) in &removed {
            if let Handler::Callback(slot) = handler {
                slot.retire();
            }
        }
        debug!(route, count = removed.len(), "route handlers removed");
        removed.len()
    }

    /// Unregister a handler or subscription.
    ///
    /// The handler receives nothing after this returns, including events
    /// already queued for it.
    ///
    /// # Errors
    ///
    /// - `ClientError::Handler` if `id` is unknown or already removed
    pub fn remove_event_handler(&self, id: HandlerId) -> Result<(), ClientError> {
        let handler = self.shared.lock().handlers.remove(id)?;
        if let Handler::Callback(slot) = handler {
            slot.retire();
        }
        debug!(%id, "event handler removed");
        Ok(())
    }

    /// Issue a request on `route`.
    ///
    /// `on_complete` runs exactly once with the response body or the failure
    /// (timeout, server error, cancellation). `timeout` defaults to
    /// [`ClientConfig::default_request_timeout`] and is clamped to
    /// [`MAX_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// - `CallError::InvalidState` unless connected
    /// - `CallError::DuplicateCallId` if `id` already has a pending call
    ///
    /// `on_complete` is dropped without running when an error is returned.
    pub fn request<F>(
        &self,
        id: CallId,
        route: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
        on_complete: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Result<Vec<u8>, CallError>) + Send + 'static,
    {
        self.issue(
            id,
            CallKind::Request,
            route,
            payload.into(),
            timeout,
            Completion::Request(Box::new(on_complete)),
        )
    }

    /// Issue a request and await its outcome.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn request_async(
        &self,
        id: CallId,
        route: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> Result<impl Future<Output = Result<Vec<u8>, CallError>> + Send + 'static, ClientError>
    {
        let (tx, rx) = oneshot::channel();
        self.request(id, route, payload, timeout, move |outcome| {
            let _ = tx.send(outcome);
        })?;

        Ok(async move { rx.await.unwrap_or(Err(CallError::Cancelled(CancelReason::Cleanup))) })
    }

    /// Send a notify on `route`.
    ///
    /// `on_result` runs exactly once: with `None` once the transport wrote
    /// the message, with the failure otherwise.
    ///
    /// # Errors
    ///
    /// Same as [`Client::request`].
    pub fn notify<F>(
        &self,
        id: CallId,
        route: &str,
        payload: impl Into<Vec<u8>>,
        timeout: Option<Duration>,
        on_result: F,
    ) -> Result<(), ClientError>
    where
        F: FnOnce(Option<CallError>) + Send + 'static,
    {
        self.issue(
            id,
            CallKind::Notify,
            route,
            payload.into(),
            timeout,
            Completion::Notify(Box::new(on_result)),
        )
    }

    /// Run queued events and completions on the calling thread.
    ///
    /// Required with polling enabled; without it deliveries run on the I/O
    /// thread and this only flushes what is already queued.
    pub fn poll(&self) {
        self.shared.drain(DrainMode::Wait);
    }

    fn apply<F>(&self, op: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut Core, Instant) -> Result<Vec<ConnectionAction>, pitaya_core::ConnectionError>,
    {
        let now = self.shared.env.now();
        let mut core = self.shared.lock();
        let actions = op(&mut *core, now)?;
        self.shared.execute(&mut core, actions);
        drop(core);

        self.shared.wake.notify_one();
        Ok(())
    }

    fn issue(
        &self,
        id: CallId,
        kind: CallKind,
        route: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
        completion: Completion,
    ) -> Result<(), ClientError> {
        let timeout = timeout.unwrap_or(self.shared.default_timeout).min(MAX_TIMEOUT);
        let deadline = self.shared.env.now() + timeout;
        let mut core = self.shared.lock();

        let state = core.conn.state();
        if state != ClientState::Connected {
            return Err(CallError::InvalidState(state).into());
        }

        let seq = core.calls.register(id, kind, route, deadline, completion)?;
        let (message, ack) = match kind {
            CallKind::Request => (Message::request(seq, route, payload), None),
            CallKind::Notify => (Message::notify(route, payload), Some(seq)),
        };

        let sent = message
            .into_packet()
            .map_err(ClientError::from)
            .and_then(|packet| core.conn.send_data(packet, ack).map_err(ClientError::from));
        let actions = match sent {
            Ok(actions) => actions,
            Err(err) => {
                core.calls.take(id);
                return Err(err);
            },
        };

        self.shared.execute(&mut core, actions);
        drop(core);

        debug!(%id, route, ?kind, seq, "call issued");
        self.shared.wake.notify_one();
        Ok(())
    }

    fn release(&mut self) -> Result<(), ClientError> {
        {
            let mut core = self.shared.lock();
            let actions = core.conn.cleanup()?;
            self.shared.execute(&mut core, actions);

            for (_, link) in core.links.drain() {
                link.close("cleanup".to_string());
            }
            core.outbox.retain(|delivery| matches!(delivery, Delivery::Call { .. }));
            core.handlers.clear();
        }

        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        self.shared.drain(DrainMode::Wait);
        info!("client cleaned up");
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.state() != ClientState::CleanedUp
            && let Err(error) = self.release()
        {
            warn!(%error, "cleanup on drop failed");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pitaya_core::{ConfigError, ConnectionError, HandlerError};

    use super::*;

    fn client() -> Client {
        Client::init(ClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn calls_require_connected_state() {
        let client = client();

        let err = client.request(CallId(1), "room.join", b"{}".to_vec(), None, |_| {}).unwrap_err();
        assert_eq!(err, ClientError::Call(CallError::InvalidState(ClientState::Inited)));

        let err = client.notify(CallId(2), "room.chat", b"{}".to_vec(), None, |_| {}).unwrap_err();
        assert_eq!(err.state(), Some(ClientState::Inited));
    }

    #[tokio::test]
    async fn lifecycle_operations_check_state() {
        let client = client();
        assert_eq!(client.disconnect().unwrap_err().state(), Some(ClientState::Inited));

        client.connect("127.0.0.1", 1, None).unwrap();
        assert_eq!(client.state(), ClientState::Connecting);

        let err = client.connect("127.0.0.1", 1, None).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Connection(ConnectionError::InvalidState {
                state: ClientState::Connecting,
                ..
            })
        ));

        client.cleanup().unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = ClientConfig { connect_timeout: Duration::ZERO, ..ClientConfig::default() };
        let err = Client::init(config).unwrap_err();
        assert_eq!(err, ClientError::Config(ConfigError::ZeroDuration { field: "connect_timeout" }));
    }

    #[tokio::test]
    async fn unschedulable_default_timeout_is_rejected() {
        let config =
            ClientConfig { default_request_timeout: Duration::MAX, ..ClientConfig::default() };
        assert!(matches!(
            Client::init(config),
            Err(ClientError::Config(ConfigError::DurationTooLong { .. }))
        ));
    }

    #[tokio::test]
    async fn handlers_can_be_removed_once() {
        let client = client();
        let id = client.add_event_handler(EventFilter::all(), |_| {}).unwrap();
        let (sub, _rx) = client.subscribe(EventFilter::all()).unwrap();
        assert_ne!(id, sub);

        client.remove_event_handler(id).unwrap();
        assert_eq!(
            client.remove_event_handler(id).unwrap_err(),
            ClientError::Handler(HandlerError::NotFound { id })
        );
    }

    #[tokio::test]
    async fn cleanup_ends_subscriptions() {
        let client = client();
        let (_, mut rx) = client.subscribe(EventFilter::all()).unwrap();

        client.cleanup().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn removed_handler_skips_queued_delivery() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let slot = Arc::new(CallbackSlot {
            removed: AtomicBool::new(false),
            callback: Mutex::new(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        });

        let delivery = |slot: &Arc<CallbackSlot>| Delivery::Event {
            handler: HandlerId(1),
            slot: slot.clone(),
            event: Event::new(pitaya_core::EventKind::Connected),
        };

        delivery(&slot).run();
        slot.removed.store(true, Ordering::Release);
        delivery(&slot).run();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retire_waits_for_running_delivery() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();
        let slot = Arc::new(CallbackSlot {
            removed: AtomicBool::new(false),
            callback: Mutex::new(Box::new(move |_| {
                entered_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                done.store(true, Ordering::SeqCst);
            })),
        });

        let running = slot.clone();
        let drainer = std::thread::spawn(move || {
            Delivery::Event {
                handler: HandlerId(1),
                slot: running,
                event: Event::new(pitaya_core::EventKind::Connected),
            }
            .run();
        });

        entered_rx.recv().unwrap();
        slot.retire();
        assert!(finished.load(Ordering::SeqCst));
        drainer.join().unwrap();
    }

    #[test]
    fn delivery_blocked_on_callback_skips_after_removal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let slot = Arc::new(CallbackSlot {
            removed: AtomicBool::new(false),
            callback: Mutex::new(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })),
        });

        // Another delivery is in progress
        let held = slot.callback.lock().unwrap();
        let queued = slot.clone();
        let drainer = std::thread::spawn(move || {
            Delivery::Event {
                handler: HandlerId(1),
                slot: queued,
                event: Event::new(pitaya_core::EventKind::Connected),
            }
            .run();
        });

        std::thread::sleep(Duration::from_millis(20));
        slot.removed.store(true, Ordering::Release);
        drop(held);
        drainer.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn retire_from_a_callback_does_not_wait_on_itself() {
        let slot = CallbackSlot {
            removed: AtomicBool::new(false),
            callback: Mutex::new(Box::new(|_| {})),
        };

        let _running = slot.callback.lock().unwrap();
        let _flag = DrainingFlag::set();
        slot.retire();
        assert!(slot.removed.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn handler_removed_inside_its_callback_stops_receiving() {
        let client = Arc::new(client());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None::<HandlerId>));

        let (seen, inner, id_cell) = (calls.clone(), Arc::downgrade(&client), own_id.clone());
        let id = client
            .add_event_handler(EventFilter::all(), move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                let id = id_cell.lock().unwrap().take();
                if let (Some(client), Some(id)) = (inner.upgrade(), id) {
                    client.remove_event_handler(id).unwrap();
                }
            })
            .unwrap();
        *own_id.lock().unwrap() = Some(id);

        // Two events queued back to back: the second must be skipped
        {
            let mut core = client.shared.lock();
            Shared::emit(&mut core, &Event::new(pitaya_core::EventKind::ReconnectStarted));
            Shared::emit(&mut core, &Event::new(pitaya_core::EventKind::ReconnectStarted));
        }
        client.poll();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(client.remove_event_handler(id).is_err());
    }

    #[test]
    fn notify_completion_reports_success_as_none() {
        let (tx, rx) = std::sync::mpsc::channel();
        Completion::Notify(Box::new(move |error| tx.send(error).unwrap())).complete(Ok(Vec::new()));
        assert_eq!(rx.recv().unwrap(), None);
    }

    #[test]
    fn owned_runtime_when_outside_tokio() {
        let client = client();
        assert!(client.runtime.is_some());
        client.cleanup().unwrap();
    }
}
