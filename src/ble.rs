use btleplug::{
    api::{
        Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
        PeripheralProperties, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::StreamExt;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use async_trait::async_trait;

use crate::{
    codec::DeviceFamily,
    error::{Result, ScaleError},
    transport::{Transport, TransportEvent, MANUFACTURER_DATA},
    types::{ConnectionParams, ConnectionStatus, DeviceInfo},
};

/// BLE scanner finding supported scales
pub struct BleScanner {
    manager: Manager,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BleScanner {
    /// Create a new scanner
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn adapter(&self) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ScaleError::DeviceNotFound)
    }

    /// Scan for scales of a supported family
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::DeviceNotFound`] if no Bluetooth adapter is available,
    /// or [`ScaleError::Ble`] for other Bluetooth-related errors.
    pub async fn scan(&self, params: &ConnectionParams) -> Result<Vec<DeviceInfo>> {
        info!("Starting scan for scales...");

        let central = self.adapter().await?;
        // several families only show up through manufacturer data, so no service filter
        central.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_millis(params.scan_timeout_ms)).await;
        central.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in central.peripherals().await? {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let device = device_info(&properties);

            if let Some(family) = DeviceFamily::detect(&device) {
                info!("Found {} scale: {}", family, device.name);
                self.peripherals
                    .lock()
                    .await
                    .insert(device.settings_key(), peripheral);
                devices.push(device);
            }
        }

        info!("Scan completed. Found {} scale(s)", devices.len());
        Ok(devices)
    }

    /// Transport for a scanned device, with its event stream.
    ///
    /// With `advertisements` set, manufacturer data of the device is
    /// forwarded as [`MANUFACTURER_DATA`] notifications; scales that never
    /// accept a connection report their readings that way.
    ///
    /// # Errors
    ///
    /// Returns [`ScaleError::DeviceNotFound`] if the device was not seen by
    /// [`scan`](Self::scan), or [`ScaleError::Ble`] if the adapter's event
    /// stream cannot be opened.
    pub async fn transport(
        &self,
        device: &DeviceInfo,
        params: &ConnectionParams,
        advertisements: bool,
    ) -> Result<(BleTransport, mpsc::UnboundedReceiver<TransportEvent>)> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&device.settings_key())
            .cloned()
            .ok_or(ScaleError::DeviceNotFound)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let central = self.adapter().await?;
        let watcher = tokio::spawn(forward_central_events(
            central,
            peripheral.id(),
            advertisements,
            sender.clone(),
        ));

        Ok((
            BleTransport {
                peripheral,
                events: sender,
                connect_timeout_ms: params.timeout_ms,
                tasks: vec![watcher],
            },
            receiver,
        ))
    }
}

/// Device description from advertised properties
#[must_use]
pub fn device_info(properties: &PeripheralProperties) -> DeviceInfo {
    let name = properties.local_name.clone().unwrap_or_default();
    let mut device = DeviceInfo::new(name, properties.rssi.unwrap_or(0))
        .with_mac_address(&properties.address.to_string());

    device.services.clone_from(&properties.services);
    device.manufacturer_ids = properties.manufacturer_data.keys().copied().collect();
    device.manufacturer_ids.sort_unstable();
    device
}

/// Manufacturer data as a notification payload: little-endian company id, then the data
#[must_use]
pub fn manufacturer_payload(company: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = company.to_le_bytes().to_vec();
    payload.extend_from_slice(data);
    payload
}

/// GATT link to one scale
pub struct BleTransport {
    peripheral: Peripheral,
    events: mpsc::UnboundedSender<TransportEvent>,
    connect_timeout_ms: u64,
    tasks: Vec<JoinHandle<()>>,
}

impl BleTransport {
    fn characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| {
                ScaleError::Protocol(format!(
                    "characteristic {characteristic} not found in service {service}"
                ))
            })
    }

    fn status(&self, status: ConnectionStatus) {
        if self.events.send(TransportEvent::Status(status)).is_err() {
            debug!("Nobody listens for {} any more", status);
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&mut self) -> Result<()> {
        self.status(ConnectionStatus::Connecting);

        timeout(
            Duration::from_millis(self.connect_timeout_ms),
            self.peripheral.connect(),
        )
        .await
        .map_err(|_| ScaleError::Timeout {
            timeout_ms: self.connect_timeout_ms,
        })?
        .map_err(|e| ScaleError::ConnectionFailed(e.to_string()))?;

        self.peripheral.discover_services().await?;

        let forwarder = tokio::spawn({
            let peripheral = self.peripheral.clone();
            let sender = self.events.clone();
            async move {
                if let Err(e) = forward_notifications(peripheral, sender).await {
                    warn!("Notification stream ended: {}", e);
                }
            }
        });
        self.tasks.push(forwarder);

        info!("Connected to {}", self.peripheral.address());
        self.status(ConnectionStatus::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn write_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let target = self.characteristic(service, characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        debug!("Writing {:02X?} to {}", data, characteristic);

        self.peripheral
            .write(&target, data, write_type)
            .await
            .map_err(|e| ScaleError::Protocol(format!("Failed to write {characteristic}: {e}")))
    }

    async fn subscribe_notify(&mut self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(service, characteristic)?;
        self.peripheral.subscribe(&target).await?;
        Ok(())
    }

    async fn subscribe_indicate(&mut self, service: Uuid, characteristic: Uuid) -> Result<()> {
        // btleplug picks indications when that is what the characteristic offers
        self.subscribe_notify(service, characteristic).await
    }

    async fn read_characteristic(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>> {
        let target = self.characteristic(service, characteristic)?;
        Ok(self.peripheral.read(&target).await?)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Forward notifications from the device
///
/// # Errors
///
/// Returns [`ScaleError::Ble`] if the notification stream cannot be opened.
pub async fn forward_notifications(
    peripheral: Peripheral,
    sender: mpsc::UnboundedSender<TransportEvent>,
) -> Result<()> {
    let mut notification_stream = peripheral.notifications().await?;

    while let Some(data) = notification_stream.next().await {
        let event = TransportEvent::Notify {
            characteristic: data.uuid,
            data: data.value,
        };
        if sender.send(event).is_err() {
            break;
        }
    }

    Ok(())
}

async fn forward_central_events(
    central: Adapter,
    id: PeripheralId,
    advertisements: bool,
    sender: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut events = match central.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("Adapter events unavailable: {}", e);
            return;
        }
    };
    if advertisements {
        if let Err(e) = central.start_scan(ScanFilter::default()).await {
            warn!("Could not restart scanning for advertisements: {}", e);
        }
    }

    while let Some(event) = events.next().await {
        let forwarded = match event {
            CentralEvent::ManufacturerDataAdvertisement {
                id: ref source,
                ref manufacturer_data,
            } if advertisements && *source == id => manufacturer_data
                .iter()
                .map(|(company, data)| TransportEvent::Notify {
                    characteristic: MANUFACTURER_DATA,
                    data: manufacturer_payload(*company, data),
                })
                .collect(),
            CentralEvent::DeviceDisconnected(ref source) if *source == id => {
                vec![TransportEvent::Status(ConnectionStatus::Disconnected)]
            }
            _ => Vec::new(),
        };

        for event in forwarded {
            if sender.send(event).is_err() {
                return;
            }
        }
    }
}
