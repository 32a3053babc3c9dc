use crate::domain::command::Verb;
use crate::domain::state::SessionState;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a BLE transport backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("bluetooth adapter is off or unavailable")]
    AdapterUnavailable,

    #[error("device {0} is unreachable")]
    Unreachable(String),

    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("not connected")]
    NotConnected,

    #[error("GATT busy")]
    GattBusy,

    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("notification subscription failed: {0}")]
    Subscription(String),

    #[error("connection lost")]
    LinkLost,

    #[error("GATT error: {0}")]
    Gatt(String),
}

impl TransportError {
    /// Whether the error means the radio link itself is gone.
    pub fn is_link_loss(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable | Self::Unreachable(_) | Self::NotConnected | Self::LinkLost
        )
    }
}

/// Malformed command text or an undecodable response payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown verb: {0}")]
    UnknownVerb(String),

    #[error("{verb} expects parameters {expected:?}, got {found:?}")]
    ParameterMismatch {
        verb: Verb,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("missing parameter {key} for {verb}")]
    MissingParameter { verb: Verb, key: String },

    #[error("{0} takes no parameters")]
    UnexpectedParameters(Verb),

    #[error("command is not terminated with ';'")]
    MissingTerminator,

    #[error("payload is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("malformed saber list: {0}")]
    MalformedList(String),
}

/// Errors surfaced by a connection session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(TransportError),

    #[error("service discovery failed: {0}")]
    Discovery(TransportError),

    #[error("write failed: {0}")]
    Write(TransportError),

    #[error("reading the response characteristic failed: {0}")]
    Read(TransportError),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("a command is already pending")]
    Busy,

    #[error("session is not ready (state: {0})")]
    NotReady(SessionState),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
}

impl SessionError {
    /// Caller may retry the same command once the session is back in `Ready`.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Write(e) | Self::Read(e) => !e.is_link_loss(),
            _ => false,
        }
    }

    /// The session is unusable and a new one has to be created.
    pub fn requires_new_session(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Discovery(_) => true,
            Self::Write(e) | Self::Read(e) => e.is_link_loss(),
            _ => false,
        }
    }
}
