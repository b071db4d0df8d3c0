//! Notification surface.
//!
//! The chat/economy collaborator learns about the connection only through a
//! [`Notifier`]. The state machine never awaits a notifier: it queues a
//! [`Notification`] and a pump task delivers them in order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chat::{Payment, format_number_short};
use crate::machine::ConnectionState;

/// One queued notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A relayable chat line.
    ChatLine(String),
    /// An in-game payment arrived.
    PaymentDetected(Payment),
    /// The transfer to the target server was confirmed.
    ServerConfirmed,
    /// The connection state changed.
    StateChanged(ConnectionState),
}

/// Receiver of connection notifications. All hooks default to no-ops.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// A chat line worth relaying.
    async fn on_chat_line(&self, _text: &str) {}

    /// A payment of `amount` from `sender`.
    async fn on_payment_detected(&self, _sender: &str, _amount: f64) {}

    /// The session reached the target server.
    async fn on_server_confirmed(&self) {}

    /// The state machine entered `state`.
    async fn on_connection_state_changed(&self, _state: ConnectionState) {}
}

/// Queue side of the notification pump.
pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// Deliver one notification.
pub async fn deliver(notifier: &dyn Notifier, notification: Notification) {
    match notification {
        Notification::ChatLine(text) => notifier.on_chat_line(&text).await,
        Notification::PaymentDetected(p) => notifier.on_payment_detected(&p.sender, p.amount).await,
        Notification::ServerConfirmed => notifier.on_server_confirmed().await,
        Notification::StateChanged(state) => notifier.on_connection_state_changed(state).await,
    }
}

/// Start a pump delivering queued notifications to `notifier`.
///
/// The pump ends when every sender is dropped.
#[must_use]
pub fn spawn_pump(notifier: Arc<dyn Notifier>) -> (NotificationSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        while let Some(n) = rx.recv().await {
            deliver(notifier.as_ref(), n).await;
        }
        debug!("Notification pump stopped");
    });
    (tx, handle)
}

/// Logs every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn on_chat_line(&self, text: &str) {
        info!(target: "tether::chat", "{text}");
    }

    async fn on_payment_detected(&self, sender: &str, amount: f64) {
        info!(sender, amount = %format_number_short(amount), "Payment detected");
    }

    async fn on_server_confirmed(&self) {
        info!("Server confirmed");
    }

    async fn on_connection_state_changed(&self, state: ConnectionState) {
        debug!(%state, "Connection state changed");
    }
}

/// Forwards every notification to several notifiers in order.
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl std::fmt::Debug for FanoutNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutNotifier")
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl FanoutNotifier {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a target.
    #[must_use]
    pub fn with(mut self, target: Arc<dyn Notifier>) -> Self {
        self.targets.push(target);
        self
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn on_chat_line(&self, text: &str) {
        for t in &self.targets {
            t.on_chat_line(text).await;
        }
    }

    async fn on_payment_detected(&self, sender: &str, amount: f64) {
        for t in &self.targets {
            t.on_payment_detected(sender, amount).await;
        }
    }

    async fn on_server_confirmed(&self) {
        for t in &self.targets {
            t.on_server_confirmed().await;
        }
    }

    async fn on_connection_state_changed(&self, state: ConnectionState) {
        for t in &self.targets {
            t.on_connection_state_changed(state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for Collect {
        async fn on_chat_line(&self, text: &str) {
            self.0.lock().push(format!("chat:{text}"));
        }
        async fn on_server_confirmed(&self) {
            self.0.lock().push("confirmed".into());
        }
        async fn on_connection_state_changed(&self, state: ConnectionState) {
            self.0.lock().push(format!("state:{state}"));
        }
    }

    #[tokio::test]
    async fn pump_delivers_in_order() {
        let sink = Arc::new(Collect::default());
        let (tx, handle) = spawn_pump(sink.clone());
        tx.send(Notification::StateChanged(ConnectionState::Connecting)).unwrap();
        tx.send(Notification::ServerConfirmed).unwrap();
        tx.send(Notification::ChatLine("hi".into())).unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            *sink.0.lock(),
            vec!["state:connecting", "confirmed", "chat:hi"]
        );
    }

    #[tokio::test]
    async fn fanout_reaches_every_target() {
        let a = Arc::new(Collect::default());
        let b = Arc::new(Collect::default());
        let fan = FanoutNotifier::new().with(a.clone()).with(b.clone());
        deliver(&fan, Notification::ServerConfirmed).await;
        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn default_hooks_are_no_ops() {
        struct Silent;
        impl Notifier for Silent {}
        deliver(
            &Silent,
            Notification::PaymentDetected(Payment {
                sender: "x".into(),
                amount: 1.0,
            }),
        )
        .await;
    }
}
