//! btleplug-backed central transport.
//!
//! Implements [`CentralTransport`] on top of the platform BLE stack:
//! adapter events are translated into [`TransportEvent`]s, discovered peers
//! are cached so later reconnects can skip the service-directory fetch, and
//! per-peer notification streams are forwarded into the shared event
//! channel.

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{CentralTransport, CharacteristicHandle, ConnectionHandle, TargetId, TransportEvent};
use crate::error::{Error, Result};

use async_trait::async_trait;

/// Central transport backed by the platform BLE adapter.
pub struct BleCentral {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Peers seen while scanning, kept for cheap reconnects.
    known_peers: Arc<RwLock<HashMap<TargetId, Peripheral>>>,
    /// The service UUID the current scan is filtering on.
    scan_service: Arc<RwLock<Option<Uuid>>>,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Channel for transport events.
    event_tx: broadcast::Sender<TransportEvent>,
    /// Handle to the adapter event loop task.
    event_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    /// Per-peer notification forwarder tasks.
    notify_tasks: Arc<RwLock<HashMap<TargetId, tokio::task::JoinHandle<()>>>>,
}

impl BleCentral {
    /// Create a new central transport on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter).await
    }

    /// Create a new central transport with a specific adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Self> {
        let (event_tx, _) = broadcast::channel(256);

        let central = Self {
            adapter,
            known_peers: Arc::new(RwLock::new(HashMap::new())),
            scan_service: Arc::new(RwLock::new(None)),
            is_scanning: Arc::new(RwLock::new(false)),
            event_tx,
            event_task: RwLock::new(None),
            notify_tasks: Arc::new(RwLock::new(HashMap::new())),
        };

        central.start_event_loop().await?;

        Ok(central)
    }

    /// Spawn the persistent adapter event loop.
    ///
    /// This outlives individual scans so disconnect events still arrive
    /// after scanning has been stopped.
    async fn start_event_loop(&self) -> Result<()> {
        let mut events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        let adapter = self.adapter.clone();
        let known_peers = self.known_peers.clone();
        let scan_service = self.scan_service.clone();
        let is_scanning = self.is_scanning.clone();
        let event_tx = self.event_tx.clone();
        let notify_tasks = self.notify_tasks.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::ServicesAdvertisement { id, services } => {
                        let wanted = *scan_service.read();
                        let matches = wanted.map(|svc| services.contains(&svc)).unwrap_or(false);
                        if *is_scanning.read() && matches {
                            Self::process_advertiser(&adapter, id, &known_peers, &event_tx).await;
                        }
                    }
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if *is_scanning.read() {
                            Self::process_candidate(
                                &adapter,
                                id,
                                &scan_service,
                                &known_peers,
                                &event_tx,
                            )
                            .await;
                        }
                    }
                    CentralEvent::DeviceConnected(id) => {
                        debug!("Device connected: {:?}", id);
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let target = id.to_string();
                        debug!("Device disconnected: {}", target);

                        if let Some(task) = notify_tasks.write().remove(&target) {
                            task.abort();
                        }

                        let _ = event_tx.send(TransportEvent::Disconnected { target });
                    }
                    CentralEvent::ManufacturerDataAdvertisement { .. } => {}
                    CentralEvent::ServiceDataAdvertisement { .. } => {}
                    CentralEvent::StateUpdate(_) => {}
                }
            }

            debug!("Adapter event loop ended");
        });

        *self.event_task.write() = Some(handle);

        Ok(())
    }

    /// Check a discovered peripheral's properties against the scanned
    /// service before reporting it.
    async fn process_candidate(
        adapter: &Adapter,
        id: PeripheralId,
        scan_service: &Arc<RwLock<Option<Uuid>>>,
        known_peers: &Arc<RwLock<HashMap<TargetId, Peripheral>>>,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        let Some(wanted) = *scan_service.read() else {
            return;
        };

        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        if !properties.services.contains(&wanted) {
            return;
        }

        let target = id.to_string();
        trace!("Advertiser {} exposes service {}", target, wanted);

        known_peers.write().insert(target.clone(), peripheral);

        let _ = event_tx.send(TransportEvent::AdvertiserFound {
            target,
            rssi: properties.rssi,
        });
    }

    /// Report an advertiser already known to expose the scanned service.
    async fn process_advertiser(
        adapter: &Adapter,
        id: PeripheralId,
        known_peers: &Arc<RwLock<HashMap<TargetId, Peripheral>>>,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let rssi = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.rssi);

        let target = id.to_string();
        known_peers.write().insert(target.clone(), peripheral);

        let _ = event_tx.send(TransportEvent::AdvertiserFound { target, rssi });
    }

    /// Look up a cached peer by identity.
    fn peer(&self, target: &TargetId) -> Result<Peripheral> {
        self.known_peers
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| Error::ControllerNotFound {
                identifier: target.clone(),
            })
    }

    /// Find a characteristic object on a peer by UUID.
    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
    }
}

#[async_trait]
impl CentralTransport for BleCentral {
    async fn start_scan(&self, service: Uuid) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for service {}", service);

        *self.scan_service.write() = Some(service);

        self.adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;

        self.adapter.stop_scan().await.map_err(Error::Bluetooth)?;

        Ok(())
    }

    async fn connect(
        &self,
        target: &TargetId,
        refresh_services: bool,
    ) -> Result<ConnectionHandle> {
        let peripheral = self.peer(target)?;

        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peer {} already connected at BLE level", target);
        } else if let Err(e) = peripheral.connect().await {
            warn!("Connection to {} failed: {}", target, e);

            // A fresh connection object that never connected carries no
            // cached state worth keeping; release it so it does not leak.
            // Known peers keep their entry for the next reconnect attempt.
            if refresh_services {
                self.known_peers.write().remove(target);
            }

            return Err(Error::Bluetooth(e));
        }

        if refresh_services || peripheral.services().is_empty() {
            peripheral
                .discover_services()
                .await
                .map_err(Error::Bluetooth)?;
        } else {
            debug!("Reusing cached service directory for {}", target);
        }

        info!("Connected to {}", target);

        Ok(ConnectionHandle {
            target: target.clone(),
        })
    }

    async fn characteristic(
        &self,
        conn: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicHandle> {
        let peripheral = self.peer(&conn.target).ok()?;

        let services = peripheral.services();
        let service = services.iter().find(|s| s.uuid == service)?;

        service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .map(|c| CharacteristicHandle {
                target: conn.target.clone(),
                uuid: c.uuid,
            })
    }

    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
        let peripheral = self.peer(&characteristic.target)?;

        let chr = Self::find_characteristic(&peripheral, characteristic.uuid).ok_or_else(|| {
            Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            }
        })?;

        // btleplug's subscribe() picks notifications or indications from the
        // characteristic properties; reject characteristics with neither.
        if !chr.properties.contains(CharPropFlags::NOTIFY)
            && !chr.properties.contains(CharPropFlags::INDICATE)
        {
            return Err(Error::NotSupported {
                operation: format!("subscribe to {}", characteristic.uuid),
            });
        }

        peripheral.subscribe(&chr).await.map_err(Error::Bluetooth)?;

        debug!(
            "Subscribed to {} on {}",
            characteristic.uuid, characteristic.target
        );

        // Forward this peer's notification stream into the event channel.
        let mut notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;
        let target = characteristic.target.clone();
        let uuid = characteristic.uuid;
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }

                trace!(
                    "Notification from {}: {} bytes",
                    target,
                    notification.value.len()
                );

                let _ = event_tx.send(TransportEvent::Notification {
                    target: target.clone(),
                    data: Bytes::from(notification.value),
                });
            }

            debug!("Notification stream for {} ended", target);
        });

        if let Some(previous) = self
            .notify_tasks
            .write()
            .insert(characteristic.target.clone(), handle)
        {
            previous.abort();
        }

        Ok(())
    }

    async fn write(&self, characteristic: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        let peripheral = self.peer(&characteristic.target)?;

        let chr = Self::find_characteristic(&peripheral, characteristic.uuid).ok_or_else(|| {
            Error::CharacteristicNotFound {
                uuid: characteristic.uuid.to_string(),
            }
        })?;

        peripheral
            .write(&chr, data, WriteType::WithoutResponse)
            .await
            .map_err(Error::Bluetooth)?;

        trace!("Wrote {} bytes to {}", data.len(), characteristic.uuid);

        Ok(())
    }

    async fn disconnect(&self, conn: &ConnectionHandle) -> Result<()> {
        if let Some(task) = self.notify_tasks.write().remove(&conn.target) {
            task.abort();
        }

        let peripheral = self.peer(&conn.target)?;

        match peripheral.disconnect().await {
            Ok(()) => {
                info!("Disconnected from {}", conn.target);
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect from {}: {}", conn.target, e);
                Err(Error::Bluetooth(e))
            }
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BleCentral {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.write().take() {
            task.abort();
        }
        for (_, task) in self.notify_tasks.write().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_central_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BleCentral>();
    }
}
