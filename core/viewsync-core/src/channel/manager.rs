//! One shared, lazily started, self-healing push-channel connection.
//!
//! A [`ChannelManager`] is an explicit value (no process globals): callers
//! construct one per transport and hand it to whoever needs the channel.
//! [`ChannelManager::connect`] returns a reference-counted
//! [`ChannelHandle`]; the first handle starts a single worker thread that
//! owns the socket, and dropping the last handle tears it down. Concurrent
//! `connect` calls never open a second socket.
//!
//! # State machine
//!
//! `Uninitialized -> Connecting -> Connected -> Disconnected -> Connecting ...`
//!
//! There is no terminal failure state. Transport errors are logged and
//! retried with [`ReconnectBackoff`]; callers only observe state changes.
//!
//! # Handlers
//!
//! Handlers registered while no connection exists are queued and attached
//! when the next connection comes up. Frames are decoded once, in the worker,
//! and handlers receive a typed [`ServerEvent`] in transport order. Malformed
//! frames are logged and dropped. A handler that panics is logged and skipped.

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use viewsync_protocol::{decode_frame, ClientFrame, EventKind, ServerEvent, ViewScope};

use super::backoff::ReconnectBackoff;
use super::transport::{Inbound, Link, Transport};
use crate::config::ChannelConfig;

// How often an idle worker re-checks whether it has been torn down.
const PUMP_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;
pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    kind: EventKind,
    handler: EventHandler,
}

struct Core {
    state: ConnectionState,
    /// Guards against a second worker (and so a second socket).
    worker_active: bool,
    /// Bumped on teardown; a worker from an older generation exits quietly.
    generation: u64,
    handles: usize,
    link: Option<Arc<dyn Link>>,
    queued: Vec<HandlerEntry>,
    attached: Vec<HandlerEntry>,
    state_listeners: Vec<(u64, StateListener)>,
    /// Resume state replayed after every reconnect.
    joined: BTreeSet<ViewScope>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    core: Mutex<Core>,
    changed: Condvar,
    next_id: AtomicU64,
}

pub struct ChannelManager {
    shared: Arc<Shared>,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                core: Mutex::new(Core {
                    state: ConnectionState::Uninitialized,
                    worker_active: false,
                    generation: 0,
                    handles: 0,
                    link: None,
                    queued: Vec::new(),
                    attached: Vec::new(),
                    state_listeners: Vec::new(),
                    joined: BTreeSet::new(),
                }),
                changed: Condvar::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Establishes the shared connection, or reuses it. Never blocks on the
    /// network; use [`ChannelHandle::wait_connected`] to wait.
    pub fn connect(&self) -> ChannelHandle {
        Shared::acquire(&self.shared);
        ChannelHandle {
            shared: Arc::clone(&self.shared),
            released: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn handle_count(&self) -> usize {
        self.shared.lock().handles
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        Shared::subscribe(&self.shared, kind, Arc::new(handler))
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        Shared::on_state_change(&self.shared, Arc::new(listener))
    }

    /// Handlers still waiting for a connection.
    pub fn queued_handlers(&self) -> usize {
        self.shared.lock().queued.len()
    }
}

/// A counted reference to the shared connection. Clones count separately;
/// the connection closes when the last one is released.
pub struct ChannelHandle {
    shared: Arc<Shared>,
    released: AtomicBool,
}

impl ChannelHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Blocks until connected or `timeout` elapses.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut core = self.shared.lock();
        while core.state != ConnectionState::Connected {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            core = match self.shared.changed.wait_timeout(core, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        Shared::subscribe(&self.shared, kind, Arc::new(handler))
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        Shared::on_state_change(&self.shared, Arc::new(listener))
    }

    /// Scopes server pushes to a view. Remembered and replayed on reconnect.
    pub fn join_view(&self, scope: ViewScope) {
        let link = {
            let mut core = self.shared.lock();
            if !core.joined.insert(scope.clone()) {
                return;
            }
            core.link.clone()
        };
        if let Some(link) = link {
            emit_logged(link.as_ref(), &ClientFrame::JoinView(scope));
        }
    }

    pub fn leave_view(&self, scope: &ViewScope) {
        let link = {
            let mut core = self.shared.lock();
            if !core.joined.remove(scope) {
                return;
            }
            core.link.clone()
        };
        if let Some(link) = link {
            emit_logged(link.as_ref(), &ClientFrame::LeaveView(scope.clone()));
        }
    }

    pub fn joined_views(&self) -> Vec<ViewScope> {
        self.shared.lock().joined.iter().cloned().collect()
    }

    /// Gives up this reference. Idempotent; also runs on drop.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        Shared::release(&self.shared);
    }
}

impl Clone for ChannelHandle {
    fn clone(&self) -> Self {
        Shared::acquire(&self.shared);
        Self {
            shared: Arc::clone(&self.shared),
            released: AtomicBool::new(false),
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scoped registration of an event handler or state listener. Dropping it
/// unregisters; [`Subscription::unsubscribe`] may be called any number of
/// times, including after the connection or manager is gone.
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
    released: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            let mut core = shared.lock();
            core.queued.retain(|entry| entry.id != self.id);
            core.attached.retain(|entry| entry.id != self.id);
            core.state_listeners.retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && self.shared.strong_count() > 0
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(shared: &Arc<Shared>) {
        let generation = {
            let mut core = shared.lock();
            core.handles += 1;
            if core.worker_active {
                return;
            }
            core.worker_active = true;
            core.generation += 1;
            core.generation
        };

        let worker_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("viewsync-channel".to_string())
            .spawn(move || run_worker(worker_shared, generation));
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn channel worker");
            let mut core = shared.lock();
            if core.generation == generation {
                core.worker_active = false;
            }
        }
    }

    fn release(shared: &Arc<Shared>) {
        let (link, listeners) = {
            let mut core = shared.lock();
            core.handles = core.handles.saturating_sub(1);
            if core.handles > 0 {
                return;
            }
            core.generation += 1;
            core.worker_active = false;
            let link = core.link.take();
            // Handlers outlive the connection and re-attach on the next one.
            let attached = std::mem::take(&mut core.attached);
            core.queued.extend(attached);
            let listeners = transition(&mut core, ConnectionState::Uninitialized);
            (link, listeners)
        };
        shared.changed.notify_all();
        if let Some(link) = link {
            link.close();
        }
        info!("Channel torn down after last handle released");
        notify_state(listeners, ConnectionState::Uninitialized);
    }

    fn subscribe(shared: &Arc<Shared>, kind: EventKind, handler: EventHandler) -> Subscription {
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut core = shared.lock();
            let entry = HandlerEntry { id, kind, handler };
            if core.link.is_some() {
                core.attached.push(entry);
            } else {
                core.queued.push(entry);
            }
        }
        Subscription {
            id,
            shared: Arc::downgrade(shared),
            released: AtomicBool::new(false),
        }
    }

    fn on_state_change(shared: &Arc<Shared>, listener: StateListener) -> Subscription {
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.lock().state_listeners.push((id, listener));
        Subscription {
            id,
            shared: Arc::downgrade(shared),
            released: AtomicBool::new(false),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn set_state(&self, generation: u64, state: ConnectionState) {
        let listeners = {
            let mut core = self.lock();
            if core.generation != generation {
                return;
            }
            transition(&mut core, state)
        };
        self.changed.notify_all();
        notify_state(listeners, state);
    }

    /// Publishes a fresh link: attaches queued handlers and replays joins.
    /// Returns false when this worker has been superseded.
    fn install_link(&self, generation: u64, link: Arc<dyn Link>) -> bool {
        let (joined, listeners, attached_now) = {
            let mut core = self.lock();
            if core.generation != generation {
                return false;
            }
            core.link = Some(Arc::clone(&link));
            let queued = std::mem::take(&mut core.queued);
            let attached_now = queued.len();
            core.attached.extend(queued);
            let listeners = transition(&mut core, ConnectionState::Connected);
            (core.joined.clone(), listeners, attached_now)
        };
        self.changed.notify_all();

        for scope in &joined {
            emit_logged(link.as_ref(), &ClientFrame::JoinView(scope.clone()));
        }
        info!(
            attached_handlers = attached_now,
            replayed_views = joined.len(),
            "Channel connected"
        );
        notify_state(listeners, ConnectionState::Connected);
        true
    }

    fn drop_link(&self, generation: u64) {
        let (link, listeners) = {
            let mut core = self.lock();
            if core.generation != generation {
                return;
            }
            let link = core.link.take();
            (link, transition(&mut core, ConnectionState::Disconnected))
        };
        self.changed.notify_all();
        if let Some(link) = link {
            link.close();
        }
        notify_state(listeners, ConnectionState::Disconnected);
    }

    fn dispatch(&self, event: &ServerEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .lock()
            .attached
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Arc::clone(&entry.handler))
            .collect();
        debug!(event = %kind, handlers = handlers.len(), "Dispatching event");
        for handler in handlers {
            // A panicking handler must not take the worker down with it.
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(event = %kind, "Event handler panicked");
            }
        }
    }

    /// Forwards inbound frames until the session closes or the worker is
    /// superseded.
    fn pump(&self, generation: u64, inbound: &Receiver<Inbound>) {
        loop {
            if !self.is_current(generation) {
                return;
            }
            match inbound.recv_timeout(PUMP_TICK) {
                Ok(Inbound::Frame(frame)) => match decode_frame(&frame) {
                    Ok(event) => self.dispatch(&event),
                    Err(err) => {
                        warn!(
                            event = %frame.event,
                            code = %err.code,
                            message = %err.message,
                            "Dropping malformed event"
                        );
                    }
                },
                Ok(Inbound::Closed(reason)) => {
                    warn!(reason = %reason, "Channel disconnected");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Transport dropped its inbound sender without closing");
                    return;
                }
            }
        }
    }

    /// Sleeps for `delay` unless torn down first. Returns whether to retry.
    fn wait_retry(&self, generation: u64, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        let mut core = self.lock();
        while core.generation == generation {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            core = match self.changed.wait_timeout(core, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        false
    }
}

fn run_worker(shared: Arc<Shared>, generation: u64) {
    let mut backoff = ReconnectBackoff::from_config(&shared.config);
    let timeout = shared.config.connect_timeout();

    while shared.is_current(generation) {
        shared.set_state(generation, ConnectionState::Connecting);
        let (sender, receiver) = mpsc::channel();

        match shared.transport.open(timeout, sender) {
            Ok(link) => {
                if !shared.install_link(generation, Arc::clone(&link)) {
                    link.close();
                    return;
                }
                backoff.reset();
                shared.pump(generation, &receiver);
                shared.drop_link(generation);
            }
            Err(err) => {
                warn!(
                    error = %err,
                    attempt = backoff.attempts() + 1,
                    "Channel connect failed"
                );
                shared.set_state(generation, ConnectionState::Disconnected);
            }
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        if !shared.wait_retry(generation, delay) {
            return;
        }
    }
}

fn transition(core: &mut Core, state: ConnectionState) -> Vec<StateListener> {
    if core.state == state {
        return Vec::new();
    }
    debug!(from = ?core.state, to = ?state, "Channel state change");
    core.state = state;
    core.state_listeners
        .iter()
        .map(|(_, listener)| Arc::clone(listener))
        .collect()
}

fn notify_state(listeners: Vec<StateListener>, state: ConnectionState) {
    for listener in listeners {
        if panic::catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
            warn!(state = ?state, "State listener panicked");
        }
    }
}

fn emit_logged(link: &dyn Link, frame: &ClientFrame) {
    if let Err(err) = link.emit(frame) {
        warn!(error = %err, frame = ?frame, "Failed to emit client frame");
    }
}
