//! Accumulated telemetry state.
//!
//! The controller spreads its instrument data across several frame kinds, so
//! a consumer folds frames into one [`Telemetry`] value as they arrive. Each
//! kind updates only its own fields; everything else keeps its last-known
//! value. Staleness is tracked out of band with per-kind update timestamps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::protocol::frame::{Frame, Gear, CURRENT_SCALE, PAYLOAD_LEN, VOLTAGE_SCALE};
use crate::utils::rpm_to_speed_kmh;

/// When each frame kind last updated the telemetry.
///
/// `None` means no frame of that kind has been folded yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UpdateTimes {
    /// Last main-data frame (gear, rpm, currents).
    pub main: Option<DateTime<Utc>>,
    /// Last voltage frame.
    pub voltage: Option<DateTime<Utc>>,
    /// Last controller-temperature frame.
    pub controller_temp: Option<DateTime<Utc>>,
    /// Last motor-temperature/throttle frame.
    pub motor_temp: Option<DateTime<Utc>>,
}

/// Telemetry accumulated from decoded frames.
///
/// Fields are `None` until the first frame of the owning kind arrives and
/// are never reset between updates.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Telemetry {
    /// Gear selector position.
    pub gear: Option<Gear>,
    /// Motor speed in rpm.
    pub rpm: Option<u16>,
    /// Quadrature current in amperes.
    pub iq_amps: Option<f64>,
    /// Direct current in amperes.
    pub id_amps: Option<f64>,
    /// Battery voltage in volts.
    pub voltage: Option<f64>,
    /// Controller temperature in degrees Celsius.
    pub controller_temp: Option<i8>,
    /// Motor temperature in degrees Celsius.
    pub motor_temp: Option<i8>,
    /// Throttle position in raw ADC counts.
    pub throttle: Option<u16>,
    /// Per-kind update timestamps for staleness tracking.
    pub updated: UpdateTimes,
    /// Last payload seen for each uninterpreted kind, preserved verbatim.
    unknown_payloads: BTreeMap<u8, [u8; PAYLOAD_LEN]>,
}

impl Telemetry {
    /// Create an empty telemetry value with no fields populated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one decoded frame into the accumulated state.
    ///
    /// Only the fields owned by the frame's kind change; unrelated fields
    /// keep their last-known values.
    pub fn fold(&mut self, frame: &Frame) {
        let now = Utc::now();

        match frame {
            Frame::Main {
                gear,
                rpm,
                iq_raw,
                id_raw,
            } => {
                self.gear = Some(*gear);
                self.rpm = Some(*rpm);
                self.iq_amps = Some(f64::from(*iq_raw) / CURRENT_SCALE);
                self.id_amps = Some(f64::from(*id_raw) / CURRENT_SCALE);
                self.updated.main = Some(now);
            }
            Frame::Voltage { voltage_raw } => {
                self.voltage = Some(f64::from(*voltage_raw) / VOLTAGE_SCALE);
                self.updated.voltage = Some(now);
            }
            Frame::ControllerTemp { celsius } => {
                self.controller_temp = Some(*celsius);
                self.updated.controller_temp = Some(now);
            }
            Frame::MotorTemp { celsius, throttle } => {
                self.motor_temp = Some(*celsius);
                self.throttle = Some(*throttle);
                self.updated.motor_temp = Some(now);
            }
            Frame::Unknown { kind, payload } => {
                self.unknown_payloads.insert(*kind, *payload);
            }
        }
    }

    /// Last payload seen for an uninterpreted kind, if any.
    pub fn unknown_payload(&self, kind: u8) -> Option<&[u8; PAYLOAD_LEN]> {
        self.unknown_payloads.get(&kind)
    }

    /// Electrical power in kilowatts, derived from the phase currents and
    /// battery voltage.
    ///
    /// Sign follows the current direction, matching the instrument firmware's
    /// power readout. Returns `None` until both a main-data and a voltage
    /// frame have arrived.
    pub fn power_kw(&self) -> Option<f64> {
        let iq = self.iq_amps?;
        let id = self.id_amps?;
        let voltage = self.voltage?;

        let magnitude = (iq * iq + id * id).sqrt();
        let mut power = -magnitude * voltage / 1000.0;
        if iq < 0.0 || id < 0.0 {
            power = -power;
        }
        Some(power)
    }

    /// Road speed in km/h derived from motor rpm.
    ///
    /// `wheel_circumference_m` and `gear_ratio` describe the vehicle, not the
    /// protocol; see [`crate::utils`] for reference values.
    pub fn speed_kmh(&self, wheel_circumference_m: f64, gear_ratio: f64) -> Option<f64> {
        self.rpm
            .map(|rpm| rpm_to_speed_kmh(f64::from(rpm), wheel_circumference_m, gear_ratio))
    }
}
