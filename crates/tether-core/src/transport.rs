//! Transport seam.
//!
//! The engine never touches a socket directly. A [`GameTransport`] opens
//! connections; each [`GameConnection`] pushes its lifecycle events into the
//! [`EventSurface`](crate::session::EventSurface) it was opened with and
//! accepts the handful of outbound actions the engine needs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportResult;
use crate::session::EventSurface;

/// Why the remote placed us in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnReason {
    /// First spawn after login.
    Initial,
    /// Respawn or world change within the same connection.
    Respawn,
}

/// An item stack inside a server-side window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Internal registry name, e.g. `emerald_block`.
    pub name: String,
    /// Human readable name, e.g. `Block of Emerald`.
    #[serde(default)]
    pub display_name: String,
    /// Stack size.
    #[serde(default = "default_count")]
    pub count: u8,
}

const fn default_count() -> u8 {
    1
}

impl Item {
    /// Create an item with a display name.
    #[must_use]
    pub fn new(name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: display_name.into(),
            count: 1,
        }
    }
}

/// A container-like UI the server opened for us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Server-assigned window id.
    pub id: u32,
    /// Window type as reported by the server.
    #[serde(default)]
    pub kind: String,
    /// Title, if any.
    #[serde(default)]
    pub title: Option<String>,
    /// Slot contents; `None` is an empty slot.
    #[serde(default)]
    pub slots: Vec<Option<Item>>,
}

impl Window {
    /// Number of occupied slots.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Mouse button semantics for a window click.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    /// Left click.
    Primary,
    /// Right click.
    Secondary,
}

impl MouseButton {
    /// Protocol button number.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }
}

/// Events a connection emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Authenticated; not yet in the world.
    Login {
        /// Account name in use.
        username: String,
    },
    /// Placed in the world; the session is playable.
    Spawned(SpawnReason),
    /// The server kicked us.
    Kicked {
        /// Kick reason as sent by the server.
        reason: String,
    },
    /// Transport-level error.
    Error {
        /// Error description.
        message: String,
    },
    /// The connection is gone.
    Ended,
    /// One chat/system line.
    Message {
        /// Raw text, formatting codes included.
        raw: String,
    },
    /// The server opened a window.
    WindowOpened(Window),
    /// The open window was closed.
    WindowClosed,
}

impl TransportEvent {
    /// Discriminant used for subscription matching.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Login { .. } => EventKind::Login,
            Self::Spawned(_) => EventKind::Spawned,
            Self::Kicked { .. } => EventKind::Kicked,
            Self::Error { .. } => EventKind::Error,
            Self::Ended => EventKind::Ended,
            Self::Message { .. } => EventKind::Message,
            Self::WindowOpened(_) => EventKind::WindowOpened,
            Self::WindowClosed => EventKind::WindowClosed,
        }
    }
}

/// Kinds of [`TransportEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`TransportEvent::Login`].
    Login,
    /// See [`TransportEvent::Spawned`].
    Spawned,
    /// See [`TransportEvent::Kicked`].
    Kicked,
    /// See [`TransportEvent::Error`].
    Error,
    /// See [`TransportEvent::Ended`].
    Ended,
    /// See [`TransportEvent::Message`].
    Message,
    /// See [`TransportEvent::WindowOpened`].
    WindowOpened,
    /// See [`TransportEvent::WindowClosed`].
    WindowClosed,
}

impl EventKind {
    /// Events that end a session.
    pub const TERMINAL: [Self; 3] = [Self::Kicked, Self::Error, Self::Ended];
}

/// Factory for connections.
pub trait GameTransport: Send + Sync + 'static {
    /// Begin a connection attempt.
    ///
    /// Must return quickly: the handshake itself runs in the background and
    /// reports through `events`. Returning `Err` means the attempt could not
    /// even start, which the state machine treats as a session creation
    /// failure.
    ///
    /// # Errors
    /// Returns a [`TransportError`](crate::error::TransportError) if the
    /// connection cannot be started.
    fn open(&self, events: EventSurface) -> TransportResult<Box<dyn GameConnection>>;
}

/// One live connection.
#[async_trait]
pub trait GameConnection: Send + Sync {
    /// Send a chat line or command.
    async fn chat(&self, text: &str) -> TransportResult<()>;

    /// Select a hotbar slot (0-8).
    async fn select_hotbar_slot(&self, slot: u8) -> TransportResult<()>;

    /// Use the item in hand.
    async fn activate_held_item(&self) -> TransportResult<()>;

    /// Click a slot in the currently open window.
    async fn click_window_slot(&self, slot: usize, button: MouseButton) -> TransportResult<()>;

    /// Close the currently open window.
    async fn close_window(&self) -> TransportResult<()>;

    /// Id of the currently open window, if any.
    fn current_window(&self) -> Option<u32>;

    /// Nudge the view direction by small deltas (radians).
    async fn look_by(&self, yaw: f32, pitch: f32) -> TransportResult<()>;

    /// Press or release sneak.
    async fn set_sneak(&self, enabled: bool) -> TransportResult<()>;

    /// Latest rendered view, if the remote provides one.
    async fn capture_view(&self) -> TransportResult<Option<Vec<u8>>>;

    /// The transport's own liveness indicator.
    fn is_open(&self) -> bool;

    /// Forcibly close the underlying socket. Must not block or panic.
    fn destroy(&self);

    /// Graceful protocol-level quit. Errors if the transport is already gone.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`](crate::error::TransportError::Closed)
    /// when the peer already dropped the connection.
    fn quit(&self, reason: &str) -> TransportResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_counts_occupied_slots() {
        let window = Window {
            id: 1,
            kind: "generic_9x3".into(),
            title: None,
            slots: vec![None, Some(Item::new("emerald", "Emerald")), None],
        };
        assert_eq!(window.occupied(), 1);
    }

    #[test]
    fn event_kind_matches_variant() {
        assert_eq!(TransportEvent::Ended.kind(), EventKind::Ended);
        assert_eq!(
            TransportEvent::Kicked { reason: "x".into() }.kind(),
            EventKind::Kicked
        );
        assert!(EventKind::TERMINAL.contains(&EventKind::Error));
        assert!(!EventKind::TERMINAL.contains(&EventKind::Message));
    }

    #[test]
    fn item_deserializes_with_defaults() {
        let item: Item = serde_json::from_str(r#"{"name":"lime_stained_glass_pane"}"#).unwrap();
        assert_eq!(item.count, 1);
        assert!(item.display_name.is_empty());
    }

    #[test]
    fn primary_button_is_zero() {
        assert_eq!(MouseButton::Primary.code(), 0);
        assert_eq!(MouseButton::Secondary.code(), 1);
    }
}
