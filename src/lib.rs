// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # fardriver-rust-ble
//!
//! A cross-platform Rust library for reading telemetry from FarDriver motor
//! controllers via Bluetooth Low Energy.
//!
//! The controller streams fixed 16-byte frames over a single notification
//! characteristic; each frame's second byte selects which instrument fields
//! it carries (rpm and currents, battery voltage, temperatures, throttle).
//! This library provides the frame codec, the connection state machine that
//! keeps a link alive on a flaky radio, the accumulated telemetry model, and
//! a synthetic controller for testing without hardware.
//!
//! ## Features
//!
//! - **Controller Discovery**: Scan for controllers by advertised service
//! - **Automatic Reconnect**: Configurable retry policy with cheap reconnects
//!   to known peers
//! - **Typed Telemetry**: rpm, gear, currents, voltage, temperatures and
//!   throttle folded into one state with staleness timestamps
//! - **Derived Readings**: electrical power and road speed computed from the
//!   raw fields
//! - **Multi-link Support**: Up to 3 controllers simultaneously
//! - **Emulator**: Peripheral-role synthetic source speaking the same codec
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fardriver_rust_ble::{BleCentral, ControllerSession, SessionConfig, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Bring up the central transport and start a session.
//!     let central = Arc::new(BleCentral::new().await?);
//!     let session = ControllerSession::new(central, SessionConfig::default());
//!     session.start();
//!
//!     // Wait for the link to come up and telemetry to accumulate.
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     let telemetry = session.telemetry();
//!     if let Some(rpm) = telemetry.rpm {
//!         println!("Motor speed: {} rpm", rpm);
//!     }
//!     if let Some(voltage) = telemetry.voltage {
//!         println!("Battery: {:.1} V", voltage);
//!     }
//!
//!     session.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for telemetry types

// Public modules
pub mod ble;
pub mod data;
pub mod emulator;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use error::{Error, Result};
pub use manager::{LinkManager, MAX_LINKS};
pub use session::{ControllerSession, RetryPolicy, SessionConfig, SessionState, StateChange};
pub use utils::{rpm_to_speed_kmh, speed_kmh_to_rpm};

// Re-export commonly used types from submodules
pub use ble::central::BleCentral;
pub use ble::transport::{
    CentralTransport, CharacteristicHandle, ConnectionHandle, PeerEvent, PeripheralTransport,
    TargetId, TransportEvent,
};
pub use ble::uuids::{FARDRIVER_CHARACTERISTIC_UUID, FARDRIVER_SERVICE_UUID};
pub use data::{Telemetry, UpdateTimes};
pub use emulator::{ControllerEmulator, EmulatorConfig, FrameSource};
pub use protocol::{Frame, Gear, InvalidFrame, FRAME_HEADER, FRAME_LEN, PAYLOAD_LEN};
