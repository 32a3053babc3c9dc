//! WinRT BLE Backend
//!
//! [`Transport`] over `Windows.Devices.Bluetooth`. Devices are addressed by
//! their `AA:BB:CC:DD:EE:FF` Bluetooth address.

use crate::domain::error::TransportError;
use crate::domain::models::DeviceHandle;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{CharacteristicSet, Subscription, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// Sending side of one subscription. Emptied to end the stream.
type Slot = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>;
type Slots = Arc<Mutex<Vec<Slot>>>;

fn close_all(slots: &Mutex<Vec<Slot>>) {
    for slot in lock(slots).drain(..) {
        lock(&slot).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn gatt_error(e: windows::core::Error) -> TransportError {
    TransportError::Gatt(e.message().to_string())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn buffer_bytes(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// An open link to one controller.
pub struct WinRtConnection {
    device: BluetoothLEDevice,
    status_token: i64,
    /// Every live subscription; closed when the link drops.
    slots: Slots,
    characteristics: Mutex<HashMap<Uuid, GattCharacteristic>>,
    value_tokens: Mutex<Vec<(GattCharacteristic, i64)>>,
}

impl WinRtConnection {
    fn characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic, TransportError> {
        lock(&self.characteristics)
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::CharacteristicNotFound(uuid))
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        match self.device.ConnectionStatus() {
            Ok(BluetoothConnectionStatus::Connected) => Ok(()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

/// Stateless; all link state lives in [`WinRtConnection`].
#[derive(Debug, Default)]
pub struct WinRtTransport;

impl WinRtTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WinRtTransport {
    type Connection = WinRtConnection;

    async fn connect(&self, device: &DeviceHandle) -> Result<Self::Connection, TransportError> {
        let address = protocol::parse_mac_address(device.address())?;
        info!("Connecting to Bluetooth device: {:#X}", address);

        let ble_device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(|_| TransportError::AdapterUnavailable)?
            .await
            .map_err(|_| TransportError::Unreachable(device.address().to_string()))?;
        info!("Device connected: {:?}", ble_device.Name().unwrap_or_default());

        let slots: Slots = Arc::default();
        let on_status = Arc::clone(&slots);
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if let Ok(BluetoothConnectionStatus::Disconnected) = dev.ConnectionStatus() {
                        warn!("Device reported disconnect");
                        close_all(&on_status);
                    }
                }
                Ok(())
            });
        let status_token = ble_device
            .ConnectionStatusChanged(&status_handler)
            .map_err(gatt_error)?;

        Ok(WinRtConnection {
            device: ble_device,
            status_token,
            slots,
            characteristics: Mutex::default(),
            value_tokens: Mutex::default(),
        })
    }

    async fn discover_services(
        &self,
        connection: &Self::Connection,
    ) -> Result<CharacteristicSet, TransportError> {
        let services_result = connection
            .device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(gatt_error)?
            .await
            .map_err(gatt_error)?;
        let status = services_result.Status().map_err(gatt_error)?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Discovery(format!(
                "Failed to get GATT services: {:?}",
                status
            )));
        }

        let services = services_result.Services().map_err(gatt_error)?;
        let mut found = HashMap::new();
        for i in 0..services.Size().map_err(gatt_error)? {
            let service = services.GetAt(i).map_err(gatt_error)?;
            let chars_result = service
                .GetCharacteristicsAsync()
                .map_err(gatt_error)?
                .await
                .map_err(gatt_error)?;
            if chars_result.Status().map_err(gatt_error)? != GattCommunicationStatus::Success {
                debug!("Skipping service {} with unreadable characteristics", i);
                continue;
            }

            let characteristics = chars_result.Characteristics().map_err(gatt_error)?;
            for j in 0..characteristics.Size().map_err(gatt_error)? {
                let c = characteristics.GetAt(j).map_err(gatt_error)?;
                let uuid = to_uuid(c.Uuid().map_err(gatt_error)?);
                found.insert(uuid, c);
            }
        }

        let set = found.keys().copied().collect();
        *lock(&connection.characteristics) = found;
        Ok(set)
    }

    async fn read(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, TransportError> {
        connection.check_connected()?;
        let c = connection.characteristic(characteristic)?;

        let result = c
            .ReadValueWithCacheModeAsync(BluetoothCacheMode::Uncached)
            .map_err(gatt_error)?
            .await
            .map_err(gatt_error)?;
        match result.Status().map_err(gatt_error)? {
            GattCommunicationStatus::Success => {}
            GattCommunicationStatus::Unreachable => return Err(TransportError::LinkLost),
            status => return Err(TransportError::Gatt(format!("Read failed: {:?}", status))),
        }

        let value = result.Value().map_err(gatt_error)?;
        buffer_bytes(&value).map_err(gatt_error)
    }

    async fn write(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        connection.check_connected()?;
        let c = connection.characteristic(characteristic)?;

        let writer = DataWriter::new().map_err(gatt_error)?;
        writer.WriteBytes(payload).map_err(gatt_error)?;
        let buffer = writer.DetachBuffer().map_err(gatt_error)?;

        let status = c
            .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithResponse)
            .map_err(gatt_error)?
            .await
            .map_err(gatt_error)?;
        match status {
            GattCommunicationStatus::Success => Ok(()),
            GattCommunicationStatus::Unreachable => Err(TransportError::LinkLost),
            status => Err(TransportError::Gatt(format!("Write failed: {:?}", status))),
        }
    }

    async fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: Uuid,
    ) -> Result<Subscription, TransportError> {
        let c = connection.characteristic(characteristic)?;

        info!("Enabling notifications...");
        let status = c
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(|e| TransportError::Subscription(e.message().to_string()))?
            .await
            .map_err(|e| TransportError::Subscription(e.message().to_string()))?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Subscription(format!(
                "Notification subscription returned status: {:?}",
                status
            )));
        }

        let (sender, subscription) = Subscription::channel(characteristic);
        let slot: Slot = Arc::new(Mutex::new(Some(sender)));
        lock(&connection.slots).push(Arc::clone(&slot));

        let data_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    if let Ok(bytes) = args.CharacteristicValue().and_then(|v| buffer_bytes(&v)) {
                        if let Some(sender) = lock(&slot).as_ref() {
                            let _ = sender.send(bytes);
                        }
                    }
                }
                Ok(())
            },
        );
        let token = c.ValueChanged(&data_handler).map_err(gatt_error)?;
        lock(&connection.value_tokens).push((c, token));

        Ok(subscription)
    }

    async fn disconnect(&self, connection: &Self::Connection) -> Result<(), TransportError> {
        for (c, token) in lock(&connection.value_tokens).drain(..) {
            let _ = c.RemoveValueChanged(token);
        }
        let _ = connection
            .device
            .RemoveConnectionStatusChanged(connection.status_token);
        close_all(&connection.slots);
        lock(&connection.characteristics).clear();

        // Close is idempotent on an already closed device
        let _ = connection.device.Close();
        info!("Disconnected from device");
        Ok(())
    }
}
