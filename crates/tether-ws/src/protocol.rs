//! Gateway wire format.
//!
//! Every frame is a JSON text message tagged by `op`.

use serde::{Deserialize, Serialize};
use tether_core::{SpawnReason, TransportEvent, Window};

/// Frames the gateway sends us.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Inbound {
    /// Authenticated.
    Login {
        /// Account in use.
        username: String,
    },
    /// Placed in the world.
    Spawn {
        /// Initial spawn or respawn.
        #[serde(default = "default_reason")]
        reason: SpawnReason,
    },
    /// Kicked by the server.
    Kicked {
        /// Kick reason.
        #[serde(default)]
        reason: String,
    },
    /// Gateway-side error.
    Error {
        /// Error text.
        #[serde(default)]
        message: String,
    },
    /// One chat line.
    Message {
        /// Raw text with formatting codes.
        text: String,
    },
    /// A window opened.
    WindowOpen {
        /// Window contents.
        window: Window,
    },
    /// The window closed.
    WindowClose,
    /// Latest rendered view.
    Frame {
        /// PNG bytes, base64 encoded.
        png_b64: String,
    },
}

const fn default_reason() -> SpawnReason {
    SpawnReason::Initial
}

impl Inbound {
    /// The engine event for this frame. `Frame` has none.
    #[must_use]
    pub fn into_event(self) -> Option<TransportEvent> {
        Some(match self {
            Self::Login { username } => TransportEvent::Login { username },
            Self::Spawn { reason } => TransportEvent::Spawned(reason),
            Self::Kicked { reason } => TransportEvent::Kicked { reason },
            Self::Error { message } => TransportEvent::Error { message },
            Self::Message { text } => TransportEvent::Message { raw: text },
            Self::WindowOpen { window } => TransportEvent::WindowOpened(window),
            Self::WindowClose => TransportEvent::WindowClosed,
            Self::Frame { .. } => return None,
        })
    }
}

/// Frames we send the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Outbound {
    /// First frame after connecting.
    Hello {
        /// Account to log in with.
        username: String,
    },
    /// Chat line or command.
    Chat {
        /// Text to send.
        text: String,
    },
    /// Change the held hotbar slot.
    SelectSlot {
        /// Slot 0-8.
        slot: u8,
    },
    /// Use the held item.
    ActivateItem,
    /// Click a window slot.
    ClickWindow {
        /// Target window.
        window_id: u32,
        /// Slot index.
        slot: usize,
        /// Mouse button code.
        button: u8,
        /// Click mode; 0 is a plain click.
        mode: u8,
    },
    /// Close a window.
    CloseWindow {
        /// Target window.
        window_id: u32,
    },
    /// Nudge the view.
    Look {
        /// Yaw delta.
        yaw: f32,
        /// Pitch delta.
        pitch: f32,
    },
    /// Press or release sneak.
    Sneak {
        /// Pressed.
        enabled: bool,
    },
    /// Leave the server.
    Quit {
        /// Quit reason.
        reason: String,
    },
}
