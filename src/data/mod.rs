//! Data structures for controller telemetry.
//!
//! This module contains the accumulated telemetry state consumers fold
//! decoded frames into.

pub mod telemetry;

pub use telemetry::{Telemetry, UpdateTimes};
