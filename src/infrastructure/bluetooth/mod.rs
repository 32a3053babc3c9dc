//! Bluetooth Module
//!
//! BLE session engine for the saber lighting controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SessionHandle                        │
//! │   (public API: connect, send_command, disconnect)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SessionActor                         │
//! │   state machine + single pending request correlator      │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Transport
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌────────────────┐        ┌─────────────────────┐
//! │ WinRtTransport │        │ SimulatedPeripheral │
//! │   (Windows)    │        │  (tests, --simulate)│
//! └────────────────┘        └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Characteristic UUIDs and address helpers
//! - [`transport`] - The contract a radio backend implements
//! - [`session`] - Session task and its caller handle
//! - [`simulated`] - In-memory controller
//! - `winrt` - Windows backend

pub mod protocol;
pub mod session;
pub mod simulated;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

pub use session::{spawn_session, SessionConfig, SessionHandle, SessionSnapshot};
pub use simulated::SimulatedPeripheral;
pub use transport::{CharacteristicSet, Subscription, Transport};
#[cfg(windows)]
pub use winrt::WinRtTransport;
