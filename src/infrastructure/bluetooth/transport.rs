//! BLE Transport Adapter
//!
//! The contract a radio backend implements so a session can drive it.
//! Backends own their platform handles; sessions only see an opaque
//! [`Transport::Connection`].

use crate::domain::error::TransportError;
use crate::domain::models::DeviceHandle;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Characteristics found during service discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CharacteristicSet {
    characteristics: BTreeSet<Uuid>,
}

impl CharacteristicSet {
    pub fn contains(&self, characteristic: &Uuid) -> bool {
        self.characteristics.contains(characteristic)
    }

    pub fn len(&self) -> usize {
        self.characteristics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characteristics.is_empty()
    }

    /// First of `required` that was not discovered.
    pub fn first_missing(&self, required: &[Uuid]) -> Option<Uuid> {
        required.iter().find(|uuid| !self.contains(uuid)).copied()
    }
}

impl FromIterator<Uuid> for CharacteristicSet {
    fn from_iter<I: IntoIterator<Item = Uuid>>(iter: I) -> Self {
        Self {
            characteristics: iter.into_iter().collect(),
        }
    }
}

/// Notification values pushed on one characteristic.
///
/// The stream ends when the backend drops its sender, which happens on
/// disconnect or link loss. Dropping the subscription cancels it.
#[derive(Debug)]
pub struct Subscription {
    characteristic: Uuid,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    /// Create a subscription and the sender a backend feeds it with.
    pub fn channel(characteristic: Uuid) -> (mpsc::UnboundedSender<Vec<u8>>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            sender,
            Self {
                characteristic,
                receiver,
            },
        )
    }

    pub fn characteristic(&self) -> Uuid {
        self.characteristic
    }

    /// Next notification value, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn connect(&self, device: &DeviceHandle) -> Result<Self::Connection, TransportError>;

    async fn discover_services(
        &self,
        connection: &Self::Connection,
    ) -> Result<CharacteristicSet, TransportError>;

    async fn read(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<Subscription, TransportError>;

    /// Close the connection and end every subscription on it. Calling it
    /// again on a closed connection succeeds.
    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), TransportError>;
}
