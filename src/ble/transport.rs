//! Transport capability interfaces.
//!
//! The connection state machine never talks to a radio stack directly; it
//! consumes these traits and reacts to the events they push. Production code
//! plugs in [`crate::ble::central::BleCentral`]; tests substitute fakes or
//! mocks, which is what keeps the state machine testable without hardware.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Identity of a discovered peer, as reported by the underlying adapter.
pub type TargetId = String;

/// Handle to an established connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    /// The peer this connection belongs to.
    pub target: TargetId,
}

/// Handle to a characteristic on an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// The peer the characteristic lives on.
    pub target: TargetId,
    /// The characteristic's UUID.
    pub uuid: Uuid,
}

/// Events pushed up from a central-role transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An advertiser exposing the expected service was observed.
    AdvertiserFound {
        /// Identity of the advertiser.
        target: TargetId,
        /// Signal strength in dBm, if reported.
        rssi: Option<i16>,
    },
    /// The link to a peer dropped.
    Disconnected {
        /// Identity of the peer that disconnected.
        target: TargetId,
    },
    /// A notification payload arrived from a peer.
    Notification {
        /// Identity of the notifying peer.
        target: TargetId,
        /// The notification payload.
        data: Bytes,
    },
}

/// Central-role (scanning/client) transport capabilities.
///
/// One implementation serves all sessions; each session subscribes to the
/// event stream and filters by target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CentralTransport: Send + Sync {
    /// Start scanning for advertisers exposing `service`.
    async fn start_scan(&self, service: Uuid) -> Result<()>;

    /// Stop an active scan.
    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a previously discovered peer.
    ///
    /// `refresh_services: false` asks the transport to reuse its cached
    /// service directory for a known peer, which is faster and cheaper than
    /// a fresh handshake. A freshly created connection object that fails to
    /// connect must be released by the implementation, not leaked.
    async fn connect(&self, target: &TargetId, refresh_services: bool)
        -> Result<ConnectionHandle>;

    /// Look up a characteristic under a service on an open connection.
    async fn characteristic(
        &self,
        conn: &ConnectionHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Option<CharacteristicHandle>;

    /// Register for notifications, falling back to indications if the
    /// characteristic does not support notifications.
    async fn subscribe(&self, characteristic: &CharacteristicHandle) -> Result<()>;

    /// Write a command payload to a characteristic.
    async fn write(&self, characteristic: &CharacteristicHandle, data: &[u8]) -> Result<()>;

    /// Tear down an open connection.
    async fn disconnect(&self, conn: &ConnectionHandle) -> Result<()>;

    /// Subscribe to transport events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Peer lifecycle events seen by a peripheral-role transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// A central connected to us.
    Connected,
    /// The connected central went away.
    Disconnected,
}

/// Peripheral-role (advertising/server) transport capabilities, consumed by
/// the synthetic source.
#[async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Start advertising the given service.
    async fn advertise(&self, service: Uuid) -> Result<()>;

    /// Push a notification to the connected central.
    async fn notify(&self, data: &[u8]) -> Result<()>;

    /// Subscribe to peer lifecycle events.
    fn peer_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_variants_clone() {
        let event = TransportEvent::Notification {
            target: "aa:bb:cc".to_string(),
            data: Bytes::from_static(&[0xAA, 0x01]),
        };
        match event.clone() {
            TransportEvent::Notification { target, data } => {
                assert_eq!(target, "aa:bb:cc");
                assert_eq!(&data[..], &[0xAA, 0x01]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_handles_compare_by_value() {
        let a = ConnectionHandle {
            target: "x".to_string(),
        };
        let b = ConnectionHandle {
            target: "x".to_string(),
        };
        assert_eq!(a, b);
    }
}
