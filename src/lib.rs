//! Saber Link
//!
//! Talks to a saber lighting controller over Bluetooth LE: connects,
//! discovers the request and response characteristics, and exchanges
//! text commands one at a time.

pub mod domain;
pub mod infrastructure;

pub use domain::command::{Command, Verb, WifiSettings};
pub use domain::error::{CodecError, SessionError, TransportError};
pub use domain::models::{DeviceHandle, Response, SaberEntry, SessionEvent};
pub use domain::state::SessionState;
pub use infrastructure::bluetooth::{spawn_session, SessionConfig, SessionHandle};
