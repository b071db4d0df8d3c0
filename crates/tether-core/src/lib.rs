//! Connection lifecycle engine for a persistent game-protocol client.
//!
//! Keeps exactly one live session to a remote game server, reconnects with
//! the right delay for each kind of disconnect, and never lets resources of
//! an old session leak into a new one.
//!
//! - [`backoff`]: pure reconnect delay policy
//! - [`session`]: one connection attempt and everything it owns
//! - [`cleanup`]: idempotent session teardown
//! - [`machine`]: the state machine actor and its control handle
//! - [`sequencer`]: scripted window interactions that trigger a transfer
//! - [`monitor`]: periodic liveness reconciliation
//! - [`transport`]: the seam a concrete protocol plugs into
//! - [`notify`]: notifications for the chat/economy layer

#![forbid(unsafe_code)]

pub mod backoff;
pub mod background;
pub mod chat;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod machine;
pub mod monitor;
pub mod notify;
pub mod sequencer;
pub mod session;
pub mod transport;

pub use backoff::{DisconnectClass, ReconnectPlan, ReconnectPolicy};
pub use cleanup::CleanupReport;
pub use config::TetherConfig;
pub use error::{
    ConfigError, ConfigResult, ControlError, ControlResult, TransportError, TransportResult,
};
pub use machine::{ConnectionState, MachineBuilder, MachineHandle, MachineStatus};
pub use monitor::LivenessVerdict;
pub use notify::{Notification, Notifier, TracingNotifier};
pub use sequencer::{ExpectedDisconnect, SequenceKind, SequenceOutcome, Sequencer};
pub use session::{EventSurface, Session, SessionId, Subscription};
pub use transport::{
    EventKind, GameConnection, GameTransport, Item, MouseButton, SpawnReason, TransportEvent,
    Window,
};
