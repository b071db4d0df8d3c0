//! WebSocket gateway transport.
//!
//! The game protocol itself is terminated by a gateway process; this crate
//! speaks the gateway's JSON frames (see [`protocol`]) and adapts them to
//! the [`GameTransport`] seam. It is the only part of the workspace that
//! touches a socket.
//!
//! [`GameTransport::open`] only validates the URL and spawns the connection
//! task. Connect failures arrive later as `error` events, exactly like a
//! connection that drops after it was established.

#![forbid(unsafe_code)]

pub mod protocol;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use tether_core::{
    EventSurface, GameConnection, GameTransport, MouseButton, TransportError, TransportEvent,
    TransportResult,
};

use crate::protocol::{Inbound, Outbound};

/// Opens gateway connections.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    username: String,
    connect_timeout: Duration,
}

impl WsTransport {
    /// Create a transport for a gateway URL.
    #[must_use]
    pub fn new(url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Builder: set the handshake timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn parse_url(&self) -> TransportResult<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| TransportError::ConnectFailed(format!("invalid gateway URL: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(TransportError::ConnectFailed(format!(
                "unsupported scheme: {other}"
            ))),
        }
    }
}

impl GameTransport for WsTransport {
    fn open(&self, events: EventSurface) -> TransportResult<Box<dyn GameConnection>> {
        let url = self.parse_url()?;
        let shared = Arc::new(Shared::default());
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_connection(
            url,
            self.username.clone(),
            self.connect_timeout,
            Arc::clone(&shared),
            out_rx,
            events,
        ));

        Ok(Box::new(WsConnection {
            out: out_tx,
            shared,
            task,
        }))
    }
}

#[derive(Debug, Default)]
struct Shared {
    open: AtomicBool,
    window: Mutex<Option<u32>>,
    frame: Mutex<Option<Vec<u8>>>,
}

/// One gateway connection.
#[derive(Debug)]
pub struct WsConnection {
    out: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl WsConnection {
    fn send(&self, frame: Outbound) -> TransportResult<()> {
        if !self.shared.open.load(Ordering::SeqCst) {
            return Err(TransportError::closed("gateway not connected"));
        }
        self.out
            .send(frame)
            .map_err(|_| TransportError::SendFailed("connection task stopped".into()))
    }
}

#[async_trait]
impl GameConnection for WsConnection {
    async fn chat(&self, text: &str) -> TransportResult<()> {
        self.send(Outbound::Chat { text: text.into() })
    }

    async fn select_hotbar_slot(&self, slot: u8) -> TransportResult<()> {
        self.send(Outbound::SelectSlot { slot })
    }

    async fn activate_held_item(&self) -> TransportResult<()> {
        self.send(Outbound::ActivateItem)
    }

    async fn click_window_slot(&self, slot: usize, button: MouseButton) -> TransportResult<()> {
        let window_id = self
            .current_window()
            .ok_or_else(|| TransportError::Protocol("no window open".into()))?;
        self.send(Outbound::ClickWindow {
            window_id,
            slot,
            button: button.code(),
            mode: 0,
        })
    }

    async fn close_window(&self) -> TransportResult<()> {
        let Some(window_id) = self.shared.window.lock().take() else {
            return Ok(());
        };
        self.send(Outbound::CloseWindow { window_id })
    }

    fn current_window(&self) -> Option<u32> {
        *self.shared.window.lock()
    }

    async fn look_by(&self, yaw: f32, pitch: f32) -> TransportResult<()> {
        self.send(Outbound::Look { yaw, pitch })
    }

    async fn set_sneak(&self, enabled: bool) -> TransportResult<()> {
        self.send(Outbound::Sneak { enabled })
    }

    async fn capture_view(&self) -> TransportResult<Option<Vec<u8>>> {
        Ok(self.shared.frame.lock().clone())
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn destroy(&self) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.task.abort();
    }

    fn quit(&self, reason: &str) -> TransportResult<()> {
        self.send(Outbound::Quit {
            reason: reason.into(),
        })
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Connect, then pump frames both ways until either side closes.
#[instrument(skip_all, fields(url = %url))]
async fn run_connection(
    url: Url,
    username: String,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    events: EventSurface,
) {
    info!("Connecting to gateway");
    let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            warn!(error = %e, "Gateway connect failed");
            events.emit(&TransportEvent::Error {
                message: format!("connect failed: {e}"),
            });
            return;
        }
        Err(_) => {
            warn!(timeout_secs = connect_timeout.as_secs(), "Gateway connect timed out");
            events.emit(&TransportEvent::Error {
                message: TransportError::Timeout(connect_timeout).to_string(),
            });
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    shared.open.store(true, Ordering::SeqCst);

    match serde_json::to_string(&Outbound::Hello { username }) {
        Ok(hello) => {
            if let Err(e) = write.send(WsMessage::Text(hello.into())).await {
                shared.open.store(false, Ordering::SeqCst);
                events.emit(&TransportEvent::Error {
                    message: format!("hello failed: {e}"),
                });
                return;
            }
        }
        Err(e) => error!(error = %e, "Failed to encode hello"),
    }

    let terminal = loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = write.close().await;
                    break TransportEvent::Ended;
                };
                let quitting = matches!(frame, Outbound::Quit { .. });
                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    break TransportEvent::Error { message: format!("send failed: {e}") };
                }
                if quitting {
                    let _ = write.close().await;
                    break TransportEvent::Ended;
                }
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let inbound: Inbound = match serde_json::from_str(&text) {
                            Ok(f) => f,
                            Err(e) => {
                                warn!(error = %e, "Failed to parse gateway frame");
                                continue;
                            }
                        };
                        if let Some(event) = apply_inbound(&shared, inbound) {
                            let terminal = matches!(event, TransportEvent::Kicked { .. });
                            events.emit(&event);
                            if terminal {
                                shared.open.store(false, Ordering::SeqCst);
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(frame = ?frame, "Gateway closed the connection");
                        break TransportEvent::Ended;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket error");
                        break TransportEvent::Error { message: e.to_string() };
                    }
                    None => {
                        info!("Gateway stream ended");
                        break TransportEvent::Ended;
                    }
                }
            }
        }
    };

    shared.open.store(false, Ordering::SeqCst);
    debug!(event = ?terminal.kind(), "Connection task finished");
    events.emit(&terminal);
}

/// Update local mirrors of remote state and map the frame to an event.
fn apply_inbound(shared: &Shared, frame: Inbound) -> Option<TransportEvent> {
    match &frame {
        Inbound::WindowOpen { window } => *shared.window.lock() = Some(window.id),
        Inbound::WindowClose => *shared.window.lock() = None,
        Inbound::Frame { png_b64 } => {
            match BASE64.decode(png_b64) {
                Ok(bytes) => *shared.frame.lock() = Some(bytes),
                Err(e) => debug!(error = %e, "Bad frame encoding"),
            }
        }
        _ => {}
    }
    frame.into_event()
}
