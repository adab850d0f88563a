//! Error types for the fardriver-rust-ble crate.

use thiserror::Error;

use crate::protocol::frame::InvalidFrame;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The specified controller was not found.
    #[error("Controller not found: {identifier}")]
    ControllerNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a connection but the controller is not connected.
    #[error("Controller not connected")]
    NotConnected,

    /// Failed to establish a connection to the controller.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connection to the controller was lost.
    #[error("Connection lost")]
    ConnectionLost,

    /// Service not found on the device.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: String,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// The requested operation is not supported.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The maximum number of concurrent links has been reached.
    #[error("Maximum links ({max}) already active")]
    MaxLinksReached {
        /// The maximum number of links allowed.
        max: usize,
    },

    /// A frame failed to decode.
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] InvalidFrame),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
