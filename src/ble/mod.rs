//! BLE communication module.
//!
//! This module provides the transport capability interfaces the state
//! machine consumes, the btleplug-backed central implementation, and the
//! default link UUIDs.

pub mod central;
pub mod transport;
pub mod uuids;

pub use central::BleCentral;
pub use transport::{
    CentralTransport, CharacteristicHandle, ConnectionHandle, PeerEvent, PeripheralTransport,
    TargetId, TransportEvent,
};
pub use uuids::*;
