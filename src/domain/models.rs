use crate::domain::error::SessionError;
use crate::domain::state::SessionState;
use std::fmt;

/// Identifies a BLE peripheral by its address, e.g. `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(String);

impl DeviceHandle {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One saber reported by `get_sabers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaberEntry {
    pub address: String,
}

/// Decoded reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Sabers(Vec<SaberEntry>),
    Ack,
    /// The controller answered with an error marker.
    Rejected(String),
    /// Payload without a known structure, surfaced as-is.
    Text(String),
}

impl Response {
    pub fn sabers(&self) -> Option<&[SaberEntry]> {
        match self {
            Self::Sabers(entries) => Some(entries),
            _ => None,
        }
    }
}

/// Events a session publishes for the surrounding application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    UnsolicitedData(Vec<u8>),
    CommandResult(Result<Response, SessionError>),
    Status(StatusMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
