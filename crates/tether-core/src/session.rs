//! Session handle.
//!
//! A [`Session`] is one attempt at holding a live connection. It owns
//! everything scoped to that attempt:
//!
//! - the connection handle returned by the transport
//! - an [`EventSurface`] the connection emits into, plus the
//!   [`Subscription`]s registered on it
//! - a [`TimerSet`] of settle timers and in-flight sequences
//! - a second [`TimerSet`] for the background tasks started once the
//!   session is fully initialized
//!
//! Nothing in a session is ever handed to another session. Teardown lives in
//! [`crate::cleanup`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::transport::{EventKind, GameConnection, TransportEvent};

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EventSurface
// ─────────────────────────────────────────────────────────────────────────────

type RepeatHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;
type OnceHandler = Box<dyn FnOnce(&TransportEvent) + Send>;

enum Handler {
    Repeat(RepeatHandler),
    Once(OnceHandler),
}

struct Entry {
    id: u64,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct SurfaceInner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Listener registry a connection emits its events into.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct EventSurface {
    inner: Arc<Mutex<SurfaceInner>>,
}

impl fmt::Debug for EventSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSurface")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventSurface {
    /// Create an empty surface.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener that fires on every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.insert(kind, Handler::Repeat(Arc::new(handler)))
    }

    /// Register a listener that fires at most once and then removes itself.
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: FnOnce(&TransportEvent) + Send + 'static,
    {
        self.insert(kind, Handler::Once(Box::new(handler)))
    }

    fn insert(&self, kind: EventKind, handler: Handler) -> Subscription {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(Entry { id, kind, handler });
        Subscription {
            id,
            kind,
            surface: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an event to every matching listener.
    ///
    /// Handlers run after the registry lock is released, so a handler may
    /// subscribe or unsubscribe freely. Returns how many listeners ran.
    pub fn emit(&self, event: &TransportEvent) -> usize {
        let kind = event.kind();
        let mut repeat: Vec<RepeatHandler> = Vec::new();
        let mut once: Vec<OnceHandler> = Vec::new();

        {
            let mut inner = self.inner.lock();
            let mut i = 0;
            while i < inner.entries.len() {
                if inner.entries[i].kind != kind {
                    i += 1;
                    continue;
                }
                match &inner.entries[i].handler {
                    Handler::Repeat(h) => {
                        repeat.push(Arc::clone(h));
                        i += 1;
                    }
                    Handler::Once(_) => {
                        let entry = inner.entries.remove(i);
                        if let Handler::Once(h) = entry.handler {
                            once.push(h);
                        }
                    }
                }
            }
        }

        let delivered = repeat.len() + once.len();
        for h in repeat {
            h(event);
        }
        for h in once {
            h(event);
        }
        delivered
    }

    /// Drop every listener, tracked or not. Returns how many were removed.
    ///
    /// Handlers are dropped after the registry lock is released.
    pub fn clear(&self) -> usize {
        let entries = std::mem::take(&mut self.inner.lock().entries);
        entries.len()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of registered listeners for one kind.
    #[must_use]
    pub fn listener_count_for(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

/// Handle to one registered listener.
///
/// Dropping the handle unsubscribes. [`Subscription::unsubscribe`] is
/// idempotent.
pub struct Subscription {
    id: u64,
    kind: EventKind,
    surface: Weak<Mutex<SurfaceInner>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Event kind this subscription listens for.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Whether the listener is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.surface
            .upgrade()
            .is_some_and(|inner| inner.lock().entries.iter().any(|e| e.id == self.id))
    }

    /// Remove the listener. Returns `true` if it was still registered.
    pub fn unsubscribe(&self) -> bool {
        let Some(inner) = self.surface.upgrade() else {
            return false;
        };
        let mut inner = inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.id != self.id);
        inner.entries.len() != before
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TimerSet
// ─────────────────────────────────────────────────────────────────────────────

/// Called with the task label when a session-owned task panics.
pub type FaultHook = Arc<dyn Fn(&'static str) + Send + Sync>;

/// Tasks and timers owned by one session.
#[derive(Default)]
pub struct TimerSet {
    handles: Vec<(&'static str, JoinHandle<()>)>,
    fault_hook: Option<FaultHook>,
}

impl fmt::Debug for TimerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<&str> = self.handles.iter().map(|(l, _)| *l).collect();
        f.debug_struct("TimerSet").field("tasks", &labels).finish()
    }
}

impl TimerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set that reports panicking tasks to `hook`.
    #[must_use]
    pub fn with_fault_hook(hook: FaultHook) -> Self {
        Self {
            handles: Vec::new(),
            fault_hook: Some(hook),
        }
    }

    /// Spawn a task owned by this set.
    pub fn spawn<F>(&mut self, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.retain(|(_, h)| !h.is_finished());
        let hook = self.fault_hook.clone();
        let handle = tokio::spawn(async move {
            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                error!(task = label, "Session task panicked");
                if let Some(hook) = hook {
                    hook(label);
                }
            }
        });
        self.handles.push((label, handle));
    }

    /// Abort every task. Returns how many were still running.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for (label, handle) in self.handles.drain(..) {
            if !handle.is_finished() {
                cancelled += 1;
                debug!(task = label, "Cancelling session task");
            }
            handle.abort();
        }
        cancelled
    }

    /// Number of tracked handles, finished or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

/// One connection attempt and everything it owns.
pub struct Session {
    pub(crate) id: SessionId,
    pub(crate) surface: EventSurface,
    pub(crate) connection: Option<Arc<dyn GameConnection>>,
    pub(crate) ready: bool,
    pub(crate) tasks_initialized: bool,
    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) timers: TimerSet,
    pub(crate) background: TimerSet,
    pub(crate) created_at: Instant,
    pub(crate) destroyed: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("ready", &self.ready)
            .field("tasks_initialized", &self.tasks_initialized)
            .field("listeners", &self.surface.listener_count())
            .field("timers", &self.timers.len())
            .field("background", &self.background.len())
            .field("destroyed", &self.destroyed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with no connection yet.
    #[must_use]
    pub fn new(id: SessionId, fault_hook: Option<FaultHook>) -> Self {
        let (timers, background) = match fault_hook {
            Some(hook) => (
                TimerSet::with_fault_hook(Arc::clone(&hook)),
                TimerSet::with_fault_hook(hook),
            ),
            None => (TimerSet::new(), TimerSet::new()),
        };
        Self {
            id,
            surface: EventSurface::new(),
            connection: None,
            ready: false,
            tasks_initialized: false,
            subscriptions: Vec::new(),
            timers,
            background,
            created_at: Instant::now(),
            destroyed: false,
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// The surface the connection emits into.
    #[must_use]
    pub const fn surface(&self) -> &EventSurface {
        &self.surface
    }

    /// Attach the connection returned by the transport.
    pub fn attach(&mut self, connection: Box<dyn GameConnection>) {
        self.connection = Some(Arc::from(connection));
    }

    /// The live connection, if attached and not torn down.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<dyn GameConnection>> {
        self.connection.clone()
    }

    /// Track a listener so teardown can remove it.
    pub fn track(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    /// Spawn a settle timer or sequence owned by this session.
    pub fn spawn_timer<F>(&mut self, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.timers.spawn(label, fut);
    }

    /// Spawn a background task owned by this session.
    pub fn spawn_background<F>(&mut self, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.background.spawn(label, fut);
    }

    /// Whether the remote confirmed a playable state.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    /// Mark the session playable.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Whether the post-spawn task set has started.
    #[must_use]
    pub const fn tasks_initialized(&self) -> bool {
        self.tasks_initialized
    }

    /// Flip `tasks_initialized` to true. Returns `false` if it already was.
    pub fn mark_tasks_initialized(&mut self) -> bool {
        if self.tasks_initialized || self.destroyed {
            return false;
        }
        self.tasks_initialized = true;
        true
    }

    /// Listeners still registered on this session's surface.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.surface.listener_count()
    }

    /// Timers and background tasks still tracked.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.len() + self.background.len()
    }

    /// Whether teardown has run.
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Time since this session was created.
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn repeat_listener_fires_every_time() {
        let surface = EventSurface::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = surface.subscribe(EventKind::Ended, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        surface.emit(&TransportEvent::Ended);
        surface.emit(&TransportEvent::Ended);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_listener_removes_itself() {
        let surface = EventSurface::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = surface.subscribe_once(EventKind::WindowClosed, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(surface.emit(&TransportEvent::WindowClosed), 1);
        assert_eq!(surface.emit(&TransportEvent::WindowClosed), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!sub.is_active());
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn listeners_only_see_their_kind() {
        let surface = EventSurface::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = surface.subscribe(EventKind::Kicked, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        surface.emit(&TransportEvent::Ended);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(surface.listener_count_for(EventKind::Kicked), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let surface = EventSurface::new();
        let sub = surface.subscribe(EventKind::Message, |_| {});
        assert_eq!(surface.listener_count(), 1);
        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        assert_eq!(surface.listener_count(), 0);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let surface = EventSurface::new();
        {
            let _sub = surface.subscribe(EventKind::Message, |_| {});
            assert_eq!(surface.listener_count(), 1);
        }
        assert_eq!(surface.listener_count(), 0);
    }

    #[test]
    fn clear_drops_untracked_listeners() {
        let surface = EventSurface::new();
        let held = surface.subscribe_once(EventKind::WindowOpened, |_| {});
        let _tracked = surface.subscribe(EventKind::Ended, |_| {});

        assert_eq!(surface.clear(), 2);
        assert_eq!(surface.listener_count(), 0);
        assert!(!held.is_active());
        assert!(!held.unsubscribe());
        assert_eq!(surface.emit(&TransportEvent::Ended), 0);
    }

    #[test]
    fn handler_may_unsubscribe_during_emit() {
        let surface = EventSurface::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let s = Arc::clone(&slot);
        let sub = surface.subscribe(EventKind::Ended, move |_| {
            if let Some(sub) = s.lock().take() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);

        surface.emit(&TransportEvent::Ended);
        assert_eq!(surface.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_aborts_pending_timers() {
        let mut timers = TimerSet::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        timers.spawn("settle", async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timers.len(), 1);

        assert_eq!(timers.cancel_all(), 1);
        assert!(timers.is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_task_reports_fault() {
        let faults = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&faults);
        let mut timers = TimerSet::with_fault_hook(Arc::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        }));
        timers.spawn("boom", async { panic!("boom") });

        for _ in 0..50 {
            if faults.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_initialized_flips_once() {
        let mut session = Session::new(SessionId(1), None);
        assert!(session.mark_tasks_initialized());
        assert!(!session.mark_tasks_initialized());
        assert!(session.tasks_initialized());
    }
}
