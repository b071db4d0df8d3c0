//! Connection state machine.
//!
//! A single task owns every piece of connection state and processes
//! [`MachineEvent`]s from one mailbox in order. Handlers never await: work
//! that needs to wait is spawned as a timer or session-owned task that posts
//! a follow-up event tagged with the session id (or backoff ticket) it was
//! started for. A follow-up whose tag no longer matches is stale and
//! ignored, so a replaced session can never be acted on.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──spawned──▶ Online
//!    ▲                   │                      │
//!    │ stop         terminal / creation failure │ terminal, dead transport
//!    │                   ▼                      ▼
//!    └──── Backoff ◀── CleaningUp ◀─────────────┘
//!          │   ▲
//!          └───┘ timer elapsed → Connecting (or Idle after a stop)
//! ```
//!
//! Control goes through a cloneable [`MachineHandle`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::backoff::{DisconnectClass, ReconnectPolicy};
use crate::background::{AntiIdle, run_capture};
use crate::chat::{ChatClassifier, format_number_short};
use crate::cleanup::{CleanupReport, cleanup};
use crate::config::TetherConfig;
use crate::error::{ControlError, ControlResult};
use crate::monitor::{self, LivenessSnapshot, LivenessVerdict};
use crate::notify::{self, Notification, NotificationSender, Notifier, TracingNotifier};
use crate::sequencer::{ExpectedDisconnect, SequenceKind, Sequencer};
use crate::session::{FaultHook, Session, SessionId};
use crate::transport::{EventKind, GameTransport, SpawnReason, TransportEvent};

// ─────────────────────────────────────────────────────────────────────────────
// States and events
// ─────────────────────────────────────────────────────────────────────────────

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session and nothing scheduled.
    #[default]
    Idle,
    /// A session exists and is waiting to spawn.
    Connecting,
    /// The session spawned.
    Online,
    /// The session is being torn down.
    CleaningUp,
    /// Waiting for the reconnect timer.
    Backoff,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Online => write!(f, "online"),
            Self::CleaningUp => write!(f, "cleaning_up"),
            Self::Backoff => write!(f, "backoff"),
        }
    }
}

/// Terminal transport signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The server kicked us.
    Kicked,
    /// The transport failed.
    Error,
    /// The connection ended.
    Ended,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kicked => write!(f, "kicked"),
            Self::Error => write!(f, "error"),
            Self::Ended => write!(f, "ended"),
        }
    }
}

/// Mailbox messages.
#[derive(Debug)]
pub(crate) enum MachineEvent {
    Connect,
    /// Manual stop. With `exit` set the machine task ends afterwards and
    /// `ack` fires only once the notification pump has drained.
    Stop {
        ack: Option<oneshot::Sender<()>>,
        exit: bool,
    },
    Transport {
        session: SessionId,
        event: TransportEvent,
    },
    InitializeTasks {
        session: SessionId,
    },
    BackoffElapsed {
        ticket: u64,
    },
    LivenessTick {
        reply: Option<oneshot::Sender<LivenessVerdict>>,
    },
    Fault {
        session: Option<SessionId>,
        origin: String,
    },
    RunSequence {
        kind: SequenceKind,
        reply: oneshot::Sender<ControlResult<()>>,
    },
    Say {
        text: String,
        reply: oneshot::Sender<ControlResult<()>>,
    },
}

impl MachineEvent {
    const fn label(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Stop { .. } => "stop",
            Self::Transport { .. } => "transport",
            Self::InitializeTasks { .. } => "initialize_tasks",
            Self::BackoffElapsed { .. } => "backoff_elapsed",
            Self::LivenessTick { .. } => "liveness_tick",
            Self::Fault { .. } => "fault",
            Self::RunSequence { .. } => "run_sequence",
            Self::Say { .. } => "say",
        }
    }
}

/// Snapshot of the machine, republished after every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MachineStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Current session, if any.
    pub session: Option<SessionId>,
    /// Whether the session spawned.
    pub ready: bool,
    /// Whether the session's background tasks started.
    pub tasks_initialized: bool,
    /// Backoff attempt counter.
    pub attempts: u32,
    /// Whether a manual stop is in effect.
    pub manual_stop: bool,
    /// Whether the expected-disconnect flag is armed.
    pub expected_disconnect: bool,
    /// Sessions created since start.
    pub sessions_created: u64,
    /// Last successful spawn.
    pub last_success: Option<DateTime<Utc>>,
    /// Class of the last disconnect.
    pub last_disconnect: Option<DisconnectClass>,
    /// Delay of the pending or last reconnect, in milliseconds.
    pub backoff_delay_ms: Option<u64>,
    /// Report of the last cleanup.
    pub last_cleanup: Option<CleanupReport>,
}

impl MachineStatus {
    /// Online, spawned, and past task initialization.
    #[must_use]
    pub fn is_online_and_ready(&self) -> bool {
        self.state == ConnectionState::Online && self.ready && self.tasks_initialized
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Control handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable control surface for the command layer.
#[derive(Debug, Clone)]
pub struct MachineHandle {
    tx: mpsc::UnboundedSender<MachineEvent>,
    status: watch::Receiver<MachineStatus>,
}

impl MachineHandle {
    fn post(&self, event: MachineEvent) -> ControlResult<()> {
        self.tx.send(event).map_err(|_| ControlError::MachineGone)
    }

    /// Clear any manual stop and connect if idle.
    ///
    /// # Errors
    /// Returns [`ControlError::MachineGone`] if the machine has stopped.
    pub fn request_connect(&self) -> ControlResult<()> {
        self.post(MachineEvent::Connect)
    }

    /// Tear down the session and stay idle until the next connect request.
    ///
    /// Resolves once the machine is idle. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns [`ControlError::MachineGone`] if the machine has stopped.
    pub async fn request_manual_stop(&self) -> ControlResult<()> {
        let (ack, rx) = oneshot::channel();
        self.post(MachineEvent::Stop {
            ack: Some(ack),
            exit: false,
        })?;
        rx.await.map_err(|_| ControlError::MachineGone)
    }

    /// Whether commands may act on the session.
    #[must_use]
    pub fn is_online_and_ready(&self) -> bool {
        self.status.borrow().is_online_and_ready()
    }

    /// Start an interaction sequence on the live session.
    ///
    /// Resolves once the sequence has been started; its outcome is logged.
    ///
    /// # Errors
    /// Returns [`ControlError::NotReady`] unless online and ready.
    pub async fn run_interaction_sequence(&self, kind: SequenceKind) -> ControlResult<()> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineEvent::RunSequence { kind, reply })?;
        rx.await.map_err(|_| ControlError::MachineGone)?
    }

    /// Send a chat line through the live session.
    ///
    /// # Errors
    /// Returns [`ControlError::NotReady`] unless online and ready, or
    /// [`ControlError::Transport`] if the send failed.
    pub async fn say(&self, text: impl Into<String>) -> ControlResult<()> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineEvent::Say {
            text: text.into(),
            reply,
        })?;
        rx.await.map_err(|_| ControlError::SessionEnded)?
    }

    /// Run a liveness check now and return its verdict.
    ///
    /// # Errors
    /// Returns [`ControlError::MachineGone`] if the machine has stopped.
    pub async fn check_liveness(&self) -> ControlResult<LivenessVerdict> {
        let (reply, rx) = oneshot::channel();
        self.post(MachineEvent::LivenessTick { reply: Some(reply) })?;
        rx.await.map_err(|_| ControlError::MachineGone)
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> MachineStatus {
        self.status.borrow().clone()
    }

    /// A receiver that sees every published status.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<MachineStatus> {
        self.status.clone()
    }

    /// Wait until the machine reaches `state`.
    ///
    /// # Errors
    /// Returns [`ControlError::MachineGone`] if the machine stops first.
    pub async fn wait_for_state(&self, state: ConnectionState) -> ControlResult<MachineStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| ControlError::MachineGone)?;
        Ok(status.clone())
    }

    /// Stop the session and end the machine task.
    ///
    /// # Errors
    /// Returns [`ControlError::MachineGone`] if the machine already stopped.
    pub async fn shutdown(&self) -> ControlResult<()> {
        let (ack, rx) = oneshot::channel();
        self.post(MachineEvent::Stop {
            ack: Some(ack),
            exit: true,
        })?;
        rx.await.map_err(|_| ControlError::MachineGone)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Configures and starts a [`ConnectionStateMachine`].
pub struct MachineBuilder {
    config: TetherConfig,
    transport: Arc<dyn GameTransport>,
    notifier: Arc<dyn Notifier>,
    rng: Option<StdRng>,
    monitor: bool,
}

impl fmt::Debug for MachineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineBuilder")
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl MachineBuilder {
    /// Start from a config and a transport.
    #[must_use]
    pub fn new(config: TetherConfig, transport: Arc<dyn GameTransport>) -> Self {
        Self {
            config,
            transport,
            notifier: Arc::new(TracingNotifier),
            rng: None,
            monitor: true,
        }
    }

    /// Builder: deliver notifications to `notifier`.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Builder: seed the jitter RNG.
    #[must_use]
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Builder: do not start the periodic liveness monitor.
    #[must_use]
    pub const fn without_monitor(mut self) -> Self {
        self.monitor = false;
        self
    }

    /// Spawn the machine task. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(self) -> (MachineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(MachineStatus::default());
        let (notify, pump) = notify::spawn_pump(self.notifier);
        let monitor = self
            .monitor
            .then(|| monitor::spawn_ticker(self.config.monitor.period(), tx.clone()));

        let expected = ExpectedDisconnect::new();
        let machine = ConnectionStateMachine {
            policy: self.config.reconnect_policy(),
            classifier: ChatClassifier::new(self.config.chat.clone()),
            sequencer: Sequencer::new(self.config.sequencer.clone(), expected.clone()),
            config: self.config,
            transport: self.transport,
            state: ConnectionState::Idle,
            session: None,
            next_session: 0,
            attempts: 0,
            manual_stop: false,
            expected,
            backoff_timer: None,
            backoff_ticket: 0,
            backoff_delay: None,
            last_spawn: None,
            last_success: None,
            last_disconnect: None,
            last_cleanup: None,
            rng: self.rng.unwrap_or_else(StdRng::from_entropy),
            notify,
            mailbox: tx.clone(),
            status: status_tx,
        };

        let task = tokio::spawn(machine.run(rx, monitor, pump));
        (
            MachineHandle {
                tx,
                status: status_rx,
            },
            task,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Machine
// ─────────────────────────────────────────────────────────────────────────────

/// Owns the connection lifecycle. Created through [`MachineBuilder`].
pub struct ConnectionStateMachine {
    config: TetherConfig,
    policy: ReconnectPolicy,
    classifier: ChatClassifier,
    sequencer: Sequencer,
    transport: Arc<dyn GameTransport>,

    state: ConnectionState,
    session: Option<Session>,
    next_session: u64,
    attempts: u32,
    manual_stop: bool,
    expected: ExpectedDisconnect,

    backoff_timer: Option<JoinHandle<()>>,
    backoff_ticket: u64,
    backoff_delay: Option<Duration>,

    last_spawn: Option<Instant>,
    last_success: Option<DateTime<Utc>>,
    last_disconnect: Option<DisconnectClass>,
    last_cleanup: Option<CleanupReport>,

    rng: StdRng,
    notify: NotificationSender,
    mailbox: mpsc::UnboundedSender<MachineEvent>,
    status: watch::Sender<MachineStatus>,
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("attempts", &self.attempts)
            .field("manual_stop", &self.manual_stop)
            .finish_non_exhaustive()
    }
}

impl ConnectionStateMachine {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<MachineEvent>,
        monitor: Option<JoinHandle<()>>,
        pump: JoinHandle<()>,
    ) {
        info!("Connection state machine started");
        let mut shutdown_ack = None;

        while let Some(event) = rx.recv().await {
            match event {
                MachineEvent::Stop { ack, exit: true } => {
                    self.dispatch(MachineEvent::Stop {
                        ack: None,
                        exit: true,
                    });
                    shutdown_ack = ack;
                    break;
                }
                event => self.dispatch(event),
            }
        }
        drop(rx);

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        info!("Connection state machine stopped");
        drop(self);
        let _ = pump.await;
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
    }

    /// Handle one event. A panicking handler is an uncaught fault.
    fn dispatch(&mut self, event: MachineEvent) {
        let label = event.label();
        if panic::catch_unwind(AssertUnwindSafe(|| self.handle(event))).is_err() {
            error!(event = label, "Event handler panicked");
            if panic::catch_unwind(AssertUnwindSafe(|| self.recover_from_fault(label))).is_err() {
                error!("Fault recovery panicked");
            }
        }
        self.publish_status();
    }

    fn handle(&mut self, event: MachineEvent) {
        match event {
            MachineEvent::Connect => self.request_connect(),
            MachineEvent::Stop { ack, .. } => {
                self.request_manual_stop();
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            MachineEvent::Transport { session, event } => self.on_transport_event(session, event),
            MachineEvent::InitializeTasks { session } => self.initialize_tasks(session),
            MachineEvent::BackoffElapsed { ticket } => self.on_backoff_elapsed(ticket),
            MachineEvent::LivenessTick { reply } => {
                let verdict = self.check_liveness();
                if let Some(reply) = reply {
                    let _ = reply.send(verdict);
                }
            }
            MachineEvent::Fault { session, origin } => {
                if session.is_some() && session != self.current_session_id() {
                    debug!(origin, "Fault from a replaced session ignored");
                    return;
                }
                self.recover_from_fault(&origin);
            }
            MachineEvent::RunSequence { kind, reply } => {
                let _ = reply.send(self.start_sequence(kind));
            }
            MachineEvent::Say { text, reply } => self.say(text, reply),
        }
    }

    fn current_session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(Session::id)
    }

    fn is_online_and_ready(&self) -> bool {
        self.state == ConnectionState::Online
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.is_ready() && s.tasks_initialized())
    }

    // ── transitions ─────────────────────────────────────────────────────────

    /// Every transition cancels the pending backoff timer.
    fn set_state(&mut self, to: ConnectionState) {
        if let Some(timer) = self.backoff_timer.take() {
            timer.abort();
        }
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(%from, %to, session = ?self.current_session_id(), "Connection state changed");
        let _ = self.notify.send(Notification::StateChanged(to));
        self.publish_status();
    }

    fn publish_status(&self) {
        let session = self.session.as_ref();
        let status = MachineStatus {
            state: self.state,
            session: session.map(Session::id),
            ready: session.is_some_and(Session::is_ready),
            tasks_initialized: session.is_some_and(Session::tasks_initialized),
            attempts: self.attempts,
            manual_stop: self.manual_stop,
            expected_disconnect: self.expected.is_armed(),
            sessions_created: self.next_session,
            last_success: self.last_success,
            last_disconnect: self.last_disconnect,
            backoff_delay_ms: self.backoff_delay.map(duration_ms),
            last_cleanup: self.last_cleanup.clone(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn request_connect(&mut self) {
        if self.manual_stop {
            info!("Manual stop cleared");
            self.manual_stop = false;
        }
        if self.state == ConnectionState::Idle && self.session.is_none() {
            self.connect();
        } else {
            debug!(state = %self.state, "Connect requested while active");
        }
    }

    fn request_manual_stop(&mut self) {
        let already = self.manual_stop;
        self.manual_stop = true;
        if self.session.is_some() {
            self.set_state(ConnectionState::CleaningUp);
            self.run_cleanup();
        }
        self.expected.retire();
        self.set_state(ConnectionState::Idle);
        if !already {
            info!("Manual stop requested");
        }
    }

    fn fault_hook(&self, session: SessionId) -> FaultHook {
        let mailbox = self.mailbox.clone();
        Arc::new(move |label: &'static str| {
            let _ = mailbox.send(MachineEvent::Fault {
                session: Some(session),
                origin: label.to_string(),
            });
        })
    }

    /// Create a session and open the transport.
    #[instrument(skip(self), fields(attempts = self.attempts))]
    fn connect(&mut self) {
        if self.manual_stop {
            self.set_state(ConnectionState::Idle);
            return;
        }
        if let Some(id) = self.current_session_id() {
            warn!(session = %id, "Connect skipped, a session still exists");
            return;
        }

        self.next_session += 1;
        let id = SessionId(self.next_session);
        let mut session = Session::new(id, Some(self.fault_hook(id)));
        self.set_state(ConnectionState::Connecting);

        for kind in [
            EventKind::Spawned,
            EventKind::Kicked,
            EventKind::Error,
            EventKind::Ended,
            EventKind::Message,
        ] {
            let mailbox = self.mailbox.clone();
            let sub = session.surface().subscribe(kind, move |event| {
                let _ = mailbox.send(MachineEvent::Transport {
                    session: id,
                    event: event.clone(),
                });
            });
            session.track(sub);
        }

        match self.transport.open(session.surface().clone()) {
            Ok(conn) => {
                session.attach(conn);
                info!(session = %id, "Session created");
                self.session = Some(session);
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Session creation failed");
                self.set_state(ConnectionState::CleaningUp);
                let mut failed = Some(session);
                self.last_cleanup = cleanup(&mut failed);
                self.schedule_reconnect(DisconnectClass::SessionCreationFailure);
            }
        }
    }

    fn run_cleanup(&mut self) {
        if let Some(report) = cleanup(&mut self.session) {
            if !report.is_complete() {
                warn!(?report, "Cleanup left resources behind");
            }
            self.last_cleanup = Some(report);
        }
    }

    fn schedule_reconnect(&mut self, class: DisconnectClass) {
        let plan = self.policy.plan(class, self.attempts, &mut self.rng);
        self.attempts = plan.attempts;
        self.last_disconnect = Some(class);
        self.backoff_delay = Some(plan.delay);
        self.set_state(ConnectionState::Backoff);

        self.backoff_ticket += 1;
        let ticket = self.backoff_ticket;
        let mailbox = self.mailbox.clone();
        self.backoff_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(plan.delay).await;
            let _ = mailbox.send(MachineEvent::BackoffElapsed { ticket });
        }));

        info!(
            %class,
            delay_ms = duration_ms(plan.delay),
            attempts = self.attempts,
            "Reconnect scheduled"
        );
    }

    fn on_backoff_elapsed(&mut self, ticket: u64) {
        if ticket != self.backoff_ticket || self.state != ConnectionState::Backoff {
            debug!(ticket, "Stale backoff timer ignored");
            return;
        }
        self.backoff_timer = None;
        if self.manual_stop {
            self.set_state(ConnectionState::Idle);
        } else {
            self.connect();
        }
    }

    // ── transport events ────────────────────────────────────────────────────

    fn on_transport_event(&mut self, session: SessionId, event: TransportEvent) {
        if self.current_session_id() != Some(session) {
            debug!(%session, kind = ?event.kind(), "Event from a replaced session ignored");
            return;
        }
        match event {
            TransportEvent::Spawned(reason) => self.notify_spawned(reason),
            TransportEvent::Kicked { reason } => {
                self.notify_disconnected(DisconnectCause::Kicked, &reason);
            }
            TransportEvent::Error { message } => {
                self.notify_disconnected(DisconnectCause::Error, &message);
            }
            TransportEvent::Ended => self.notify_disconnected(DisconnectCause::Ended, ""),
            TransportEvent::Message { raw } => self.on_message(&raw),
            TransportEvent::Login { .. }
            | TransportEvent::WindowOpened(_)
            | TransportEvent::WindowClosed => {}
        }
    }

    fn notify_spawned(&mut self, reason: SpawnReason) {
        if self.state != ConnectionState::Connecting {
            debug!(?reason, state = %self.state, "Spawn while not connecting");
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let id = session.id();
        session.mark_ready();
        self.attempts = 0;
        self.last_spawn = Some(Instant::now());
        self.last_success = Some(Utc::now());
        self.backoff_delay = None;
        self.set_state(ConnectionState::Online);

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.config.sequencer.run_on_spawn {
            if let Some(conn) = session.connection() {
                let settle = self.config.session.sequence_settle();
                let sequencer = self.sequencer.clone();
                let surface = session.surface().clone();
                session.spawn_timer("post_spawn_sequence", async move {
                    tokio::time::sleep(settle).await;
                    sequencer.run(SequenceKind::Emerald, conn, &surface).await;
                });
            }
        }

        let settle = self.config.session.tasks_settle();
        let mailbox = self.mailbox.clone();
        session.spawn_timer("tasks_settle", async move {
            tokio::time::sleep(settle).await;
            let _ = mailbox.send(MachineEvent::InitializeTasks { session: id });
        });
    }

    #[instrument(skip(self), fields(session = ?self.current_session_id()))]
    fn notify_disconnected(&mut self, cause: DisconnectCause, detail: &str) {
        if !matches!(
            self.state,
            ConnectionState::Online | ConnectionState::Connecting
        ) {
            debug!(state = %self.state, "Terminal event outside a live session ignored");
            return;
        }
        info!(%cause, detail, "Session ended");

        self.set_state(ConnectionState::CleaningUp);
        self.run_cleanup();

        let class = if self.expected.consume() {
            DisconnectClass::ExpectedTransfer
        } else {
            DisconnectClass::TransientTransportFailure
        };
        self.schedule_reconnect(class);
    }

    fn on_message(&mut self, raw: &str) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let classified = self.classifier.classify(raw, session.tasks_initialized());

        if let Some(payment) = classified.payment {
            info!(
                sender = %payment.sender,
                amount = %format_number_short(payment.amount),
                "Payment detected"
            );
            let _ = self.notify.send(Notification::PaymentDetected(payment));
        }
        if let Some(line) = classified.relay {
            let _ = self.notify.send(Notification::ChatLine(line));
        }
        if classified.server_confirmed {
            info!(session = %session.id(), "Target server confirmed, initializing tasks");
            self.expected.retire();
            let _ = self.notify.send(Notification::ServerConfirmed);

            let id = session.id();
            let settle = self.config.session.confirmation_settle();
            let mailbox = self.mailbox.clone();
            session.spawn_timer("confirmation_settle", async move {
                tokio::time::sleep(settle).await;
                let _ = mailbox.send(MachineEvent::InitializeTasks { session: id });
            });
        }
    }

    /// Start the background task set, once per session.
    fn initialize_tasks(&mut self, id: SessionId) {
        if self.current_session_id() != Some(id) || self.state != ConnectionState::Online {
            debug!(session = %id, "Task initialization for a stale session ignored");
            return;
        }
        let anti_idle_rng = StdRng::seed_from_u64(self.rng.r#gen());
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.mark_tasks_initialized() {
            return;
        }
        let Some(conn) = session.connection() else {
            return;
        };

        let cfg = &self.config.session;
        let anti_idle = AntiIdle::new(
            cfg.anti_idle_interval(),
            cfg.anti_idle_probability,
            anti_idle_rng,
        );
        session.spawn_background("anti_idle", anti_idle.run(Arc::clone(&conn)));
        if let Some(path) = cfg.capture_path.clone() {
            session.spawn_background("capture", run_capture(conn, cfg.capture_interval(), path));
        }
        info!(session = %id, "Session tasks initialized");
    }

    // ── faults and liveness ─────────────────────────────────────────────────

    fn recover_from_fault(&mut self, origin: &str) {
        error!(origin, state = %self.state, "Uncaught fault, forcing cleanup");
        if self.session.is_some() {
            self.set_state(ConnectionState::CleaningUp);
            self.run_cleanup();
        }
        if self.manual_stop {
            self.set_state(ConnectionState::Idle);
        } else {
            self.schedule_reconnect(DisconnectClass::UncaughtFault);
        }
    }

    fn check_liveness(&mut self) -> LivenessVerdict {
        let session = self.session.as_ref();
        let snapshot = LivenessSnapshot {
            state: self.state,
            manual_stop: self.manual_stop,
            has_session: session.is_some(),
            tasks_initialized: session.is_some_and(Session::tasks_initialized),
            transport_open: session.and_then(Session::connection).map(|c| c.is_open()),
            attempts: self.attempts,
            since_last_spawn: self.last_spawn.map(|t| t.elapsed()),
        };
        let verdict = monitor::assess(&snapshot, self.config.monitor.grace());

        match verdict {
            LivenessVerdict::DeadTransport => {
                warn!(session = ?self.current_session_id(), "Transport closed without a terminal event");
                self.set_state(ConnectionState::CleaningUp);
                self.run_cleanup();
                self.schedule_reconnect(DisconnectClass::DeadTransport);
            }
            LivenessVerdict::MissedConnect => {
                info!("No session and nothing scheduled, connecting");
                self.connect();
            }
            LivenessVerdict::Healthy | LivenessVerdict::Skipped(_) => {
                debug!(?verdict, "Liveness check");
            }
        }
        verdict
    }

    // ── commands ────────────────────────────────────────────────────────────

    fn start_sequence(&mut self, kind: SequenceKind) -> ControlResult<()> {
        if !self.is_online_and_ready() {
            return Err(ControlError::NotReady);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(ControlError::NotReady);
        };
        let Some(conn) = session.connection() else {
            return Err(ControlError::NotReady);
        };
        let sequencer = self.sequencer.clone();
        let surface = session.surface().clone();
        session.spawn_timer("sequence", async move {
            sequencer.run(kind, conn, &surface).await;
        });
        info!(%kind, "Interaction sequence started");
        Ok(())
    }

    fn say(&mut self, text: String, reply: oneshot::Sender<ControlResult<()>>) {
        if !self.is_online_and_ready() {
            let _ = reply.send(Err(ControlError::NotReady));
            return;
        }
        let Some(session) = self.session.as_mut() else {
            let _ = reply.send(Err(ControlError::NotReady));
            return;
        };
        let Some(conn) = session.connection() else {
            let _ = reply.send(Err(ControlError::NotReady));
            return;
        };
        session.spawn_timer("say", async move {
            let result = conn.chat(&text).await.map_err(ControlError::from);
            let _ = reply.send(result);
        });
    }
}
