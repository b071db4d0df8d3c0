//! Test doubles for the connection engine.
//!
//! [`MockTransport`] hands out [`MockConnection`]s that record every
//! outbound action in a shared [`CallLog`] and let a test push events into
//! the session they belong to. [`RecordingNotifier`] keeps every
//! notification in order.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_core::machine::ConnectionState;
use tether_core::{
    EventSurface, GameConnection, GameTransport, Item, MouseButton, Notification, Notifier,
    TransportError, TransportEvent, TransportResult, Window,
};

// ─────────────────────────────────────────────────────────────────────────────
// Call log
// ─────────────────────────────────────────────────────────────────────────────

/// One outbound action.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// `chat(text)`
    Chat(String),
    /// `select_hotbar_slot(slot)`
    SelectSlot(u8),
    /// `activate_held_item()`
    ActivateItem,
    /// `click_window_slot(slot, button)`.
    Click {
        /// Slot index.
        slot: usize,
        /// Button.
        button: MouseButton,
        /// Observer result when the click was issued.
        observed: bool,
    },
    /// `close_window()`
    CloseWindow,
    /// `look_by(..)`
    Look,
    /// `set_sneak(enabled)`
    Sneak(bool),
    /// `destroy()`
    Destroy,
    /// `quit(reason)`
    Quit,
}

/// Shared, ordered record of outbound actions.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(usize, Call)>>>);

impl CallLog {
    fn push(&self, connection: usize, call: Call) {
        self.0.lock().push((connection, call));
    }

    /// Every call in order, without connection numbers.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.0.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    /// Calls made through one connection (1-based, in open order).
    #[must_use]
    pub fn calls_for(&self, connection: usize) -> Vec<Call> {
        self.0
            .lock()
            .iter()
            .filter(|(n, _)| *n == connection)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.0.lock().iter().filter(|(_, c)| pred(c)).count()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Behaviour
// ─────────────────────────────────────────────────────────────────────────────

type ClickObserver = Arc<dyn Fn() -> bool + Send + Sync>;
type ClickEffect = Arc<dyn Fn(&EventSurface) + Send + Sync>;

/// How mock connections react to actions.
#[derive(Clone, Default)]
pub struct Behavior {
    /// Window opened by `activate_held_item`.
    pub window_on_activate: Option<Window>,
    /// Window opened by any chat line starting with `/`.
    pub window_on_command: Option<Window>,
    /// Sampled when a click is issued and stored in [`Call::Click`].
    pub click_observer: Option<ClickObserver>,
    /// Run after a click is recorded, e.g. to emit a transfer kick.
    pub click_effect: Option<ClickEffect>,
    /// Frame returned by `capture_view`.
    pub frame: Option<Vec<u8>>,
    /// Panic inside `capture_view`.
    pub panic_on_capture: bool,
}

impl Behavior {
    /// Open `window` when the held item is used.
    #[must_use]
    pub fn opens_on_activate(mut self, window: Window) -> Self {
        self.window_on_activate = Some(window);
        self
    }

    /// Open `window` when a command is sent.
    #[must_use]
    pub fn opens_on_command(mut self, window: Window) -> Self {
        self.window_on_command = Some(window);
        self
    }

    /// Sample `observer` on every click.
    #[must_use]
    pub fn observe_click(mut self, observer: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.click_observer = Some(Arc::new(observer));
        self
    }

    /// Run `effect` after every click.
    #[must_use]
    pub fn after_click(mut self, effect: impl Fn(&EventSurface) + Send + Sync + 'static) -> Self {
        self.click_effect = Some(Arc::new(effect));
        self
    }

    /// Panic inside `capture_view`.
    #[must_use]
    pub const fn panicking_capture(mut self) -> Self {
        self.panic_on_capture = true;
        self
    }
}

/// A one-item window: slot 0 empty, the item in slot 1.
#[must_use]
pub fn window_with(id: u32, name: &str, display_name: &str) -> Window {
    Window {
        id,
        kind: "generic_9x1".into(),
        title: None,
        slots: vec![None, Some(Item::new(name, display_name))],
    }
}

impl std::fmt::Debug for Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Behavior")
            .field("window_on_activate", &self.window_on_activate.is_some())
            .field("window_on_command", &self.window_on_command.is_some())
            .field("panic_on_capture", &self.panic_on_capture)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection
// ─────────────────────────────────────────────────────────────────────────────

/// State of one mock connection, shared between the engine and the test.
#[derive(Debug)]
pub struct MockRemote {
    number: usize,
    surface: EventSurface,
    open: AtomicBool,
    window: Mutex<Option<u32>>,
    log: CallLog,
    behavior: Behavior,
}

impl MockRemote {
    /// 1-based open order.
    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    /// Push an event into the session's surface.
    pub fn emit(&self, event: &TransportEvent) -> usize {
        if let TransportEvent::WindowOpened(w) = event {
            *self.window.lock() = Some(w.id);
        }
        self.surface.emit(event)
    }

    /// Close the socket without any terminal event.
    pub fn half_close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Whether the engine still considers this socket open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Listeners still registered on this session's surface.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.surface.listener_count()
    }

    fn open_window(&self, window: &Window) {
        self.emit(&TransportEvent::WindowOpened(window.clone()));
    }
}

/// Connection handed to the engine.
#[derive(Debug)]
pub struct MockConnection {
    remote: Arc<MockRemote>,
}

impl MockConnection {
    fn record(&self, call: Call) {
        self.remote.log.push(self.remote.number, call);
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.remote.is_open() {
            Ok(())
        } else {
            Err(TransportError::closed("mock closed"))
        }
    }
}

#[async_trait]
impl GameConnection for MockConnection {
    async fn chat(&self, text: &str) -> TransportResult<()> {
        self.ensure_open()?;
        self.record(Call::Chat(text.to_string()));
        if text.starts_with('/') {
            if let Some(w) = &self.remote.behavior.window_on_command {
                self.remote.open_window(w);
            }
        }
        Ok(())
    }

    async fn select_hotbar_slot(&self, slot: u8) -> TransportResult<()> {
        self.ensure_open()?;
        self.record(Call::SelectSlot(slot));
        Ok(())
    }

    async fn activate_held_item(&self) -> TransportResult<()> {
        self.ensure_open()?;
        self.record(Call::ActivateItem);
        if let Some(w) = &self.remote.behavior.window_on_activate {
            self.remote.open_window(w);
        }
        Ok(())
    }

    async fn click_window_slot(&self, slot: usize, button: MouseButton) -> TransportResult<()> {
        self.ensure_open()?;
        let observed = self
            .remote
            .behavior
            .click_observer
            .as_ref()
            .is_some_and(|f| f());
        self.record(Call::Click {
            slot,
            button,
            observed,
        });
        if let Some(effect) = &self.remote.behavior.click_effect {
            effect(&self.remote.surface);
        }
        Ok(())
    }

    async fn close_window(&self) -> TransportResult<()> {
        self.ensure_open()?;
        self.record(Call::CloseWindow);
        *self.remote.window.lock() = None;
        Ok(())
    }

    fn current_window(&self) -> Option<u32> {
        *self.remote.window.lock()
    }

    async fn look_by(&self, _yaw: f32, _pitch: f32) -> TransportResult<()> {
        self.ensure_open()?;
        self.record(Call::Look);
        Ok(())
    }

    async fn set_sneak(&self, enabled: bool) -> TransportResult<()> {
        self.ensure_open()?;
        self.record(Call::Sneak(enabled));
        Ok(())
    }

    async fn capture_view(&self) -> TransportResult<Option<Vec<u8>>> {
        assert!(!self.remote.behavior.panic_on_capture, "capture exploded");
        Ok(self.remote.behavior.frame.clone())
    }

    fn is_open(&self) -> bool {
        self.remote.is_open()
    }

    fn destroy(&self) {
        self.record(Call::Destroy);
        self.remote.open.store(false, Ordering::SeqCst);
    }

    fn quit(&self, _reason: &str) -> TransportResult<()> {
        self.record(Call::Quit);
        self.ensure_open()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct TransportInner {
    remotes: Mutex<Vec<Arc<MockRemote>>>,
    fail_next: AtomicUsize,
    prior_clean: Mutex<Vec<bool>>,
    behavior: Mutex<Behavior>,
    log: CallLog,
}

/// Transport whose connections are driven by the test.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<TransportInner>,
}

impl MockTransport {
    /// Create a transport with default behaviour.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the behaviour used by connections opened from now on.
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.inner.behavior.lock() = behavior;
    }

    /// Make the next `n` opens fail synchronously.
    pub fn fail_next_opens(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Number of successful opens.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.inner.remotes.lock().len()
    }

    /// The connection opened most recently.
    ///
    /// # Panics
    /// Panics if nothing has been opened yet.
    #[must_use]
    pub fn latest(&self) -> Arc<MockRemote> {
        self.inner
            .remotes
            .lock()
            .last()
            .cloned()
            .expect("no connection opened yet")
    }

    /// Connection number `n` (1-based).
    ///
    /// # Panics
    /// Panics if fewer than `n` connections were opened.
    #[must_use]
    pub fn remote(&self, n: usize) -> Arc<MockRemote> {
        Arc::clone(&self.inner.remotes.lock()[n - 1])
    }

    /// For each open after the first: whether every earlier session had no
    /// listeners left at that moment.
    #[must_use]
    pub fn prior_sessions_clean(&self) -> Vec<bool> {
        self.inner.prior_clean.lock().clone()
    }

    /// Shared call log across all connections.
    #[must_use]
    pub fn log(&self) -> CallLog {
        self.inner.log.clone()
    }
}

impl GameTransport for MockTransport {
    fn open(&self, events: EventSurface) -> TransportResult<Box<dyn GameConnection>> {
        let pending = self.inner.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.inner.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::ConnectFailed("mock refused".into()));
        }

        let mut remotes = self.inner.remotes.lock();
        if !remotes.is_empty() {
            let clean = remotes.iter().all(|r| r.listener_count() == 0);
            self.inner.prior_clean.lock().push(clean);
        }
        let remote = Arc::new(MockRemote {
            number: remotes.len() + 1,
            surface: events,
            open: AtomicBool::new(true),
            window: Mutex::new(None),
            log: self.inner.log.clone(),
            behavior: self.inner.behavior.lock().clone(),
        });
        remotes.push(Arc::clone(&remote));
        Ok(Box::new(MockConnection { remote }))
    }
}

/// A standalone connection for driving the sequencer directly.
#[must_use]
pub fn standalone_connection(behavior: Behavior) -> (Arc<MockConnection>, Arc<MockRemote>, CallLog) {
    let log = CallLog::default();
    let remote = Arc::new(MockRemote {
        number: 1,
        surface: EventSurface::new(),
        open: AtomicBool::new(true),
        window: Mutex::new(None),
        log: log.clone(),
        behavior,
    });
    let conn = Arc::new(MockConnection {
        remote: Arc::clone(&remote),
    });
    (conn, remote, log)
}

impl MockRemote {
    /// The surface this connection emits into.
    #[must_use]
    pub const fn surface(&self) -> &EventSurface {
        &self.surface
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifier
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps every notification in delivery order.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    /// State changes received so far.
    #[must_use]
    pub fn states(&self) -> Vec<ConnectionState> {
        self.seen
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn on_chat_line(&self, text: &str) {
        self.seen.lock().push(Notification::ChatLine(text.into()));
    }

    async fn on_payment_detected(&self, sender: &str, amount: f64) {
        self.seen
            .lock()
            .push(Notification::PaymentDetected(tether_core::chat::Payment {
                sender: sender.into(),
                amount,
            }));
    }

    async fn on_server_confirmed(&self) {
        self.seen.lock().push(Notification::ServerConfirmed);
    }

    async fn on_connection_state_changed(&self, state: ConnectionState) {
        self.seen.lock().push(Notification::StateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::EventKind;

    #[tokio::test]
    async fn mock_records_prior_cleanliness() {
        let transport = MockTransport::new();
        let first = EventSurface::new();
        let sub = first.subscribe(EventKind::Ended, |_| {});
        let _a = transport.open(first).unwrap();
        let _b = transport.open(EventSurface::new()).unwrap();
        drop(sub);
        let _c = transport.open(EventSurface::new()).unwrap();
        assert_eq!(transport.prior_sessions_clean(), vec![false, true]);
    }

    #[tokio::test]
    async fn failing_opens_are_counted_down() {
        let transport = MockTransport::new();
        transport.fail_next_opens(1);
        assert!(transport.open(EventSurface::new()).is_err());
        assert!(transport.open(EventSurface::new()).is_ok());
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn closed_mock_rejects_actions() {
        let (conn, remote, log) = standalone_connection(Behavior::default());
        remote.half_close();
        assert!(conn.chat("hi").await.is_err());
        assert!(conn.quit("bye").is_err());
        assert_eq!(log.calls(), vec![Call::Quit]);
    }
}
