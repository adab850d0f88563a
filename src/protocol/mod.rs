//! Wire protocol for controller telemetry frames.
//!
//! This module contains the implementations for:
//! - Frame encoding and decoding
//! - The per-kind field layout tables shared by both

pub mod frame;
pub mod layout;

pub use frame::{
    Frame, Gear, InvalidFrame, CURRENT_SCALE, FRAME_HEADER, FRAME_LEN, KEEP_ALIVE_COMMAND,
    PAYLOAD_LEN, VOLTAGE_SCALE,
};
pub use layout::{Field, FieldSpec, Packing};
