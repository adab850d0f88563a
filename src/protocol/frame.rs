//! Telemetry frame encoding and decoding.
//!
//! The controller streams fixed 16-byte frames over a single notification
//! channel. Byte 0 is a constant header, byte 1 selects the frame kind, and
//! bytes 2-15 carry kind-specific big-endian fields (zero-padded). Decode is
//! a pure function of the 16 input bytes; frames either arrive whole or are
//! not decoded at all.

use thiserror::Error;

use crate::protocol::layout::{self, Field};

/// Total frame length in bytes.
pub const FRAME_LEN: usize = 16;

/// Length of the kind-specific payload region (bytes 2-15).
pub const PAYLOAD_LEN: usize = 14;

/// Constant header byte at offset 0 of every frame.
pub const FRAME_HEADER: u8 = 0xAA;

/// Command the central writes periodically to keep the controller streaming.
///
/// Observed controller behavior: notifications stop a few seconds after the
/// last write, so consumers resend this on an interval.
pub const KEEP_ALIVE_COMMAND: [u8; 8] = [0xAA, 0x13, 0xEC, 0x07, 0x01, 0xF1, 0xA2, 0x5D];

/// Scale divisor from raw current values to amperes.
pub const CURRENT_SCALE: f64 = 100.0;

/// Scale divisor from raw voltage values to volts.
pub const VOLTAGE_SCALE: f64 = 10.0;

/// A frame that could not be decoded.
///
/// Invalid frames are dropped by consumers; they never affect session state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidFrame {
    /// The input was not exactly 16 bytes.
    #[error("wrong frame length: {len} bytes (expected 16)")]
    WrongLength {
        /// The length that was received.
        len: usize,
    },

    /// Byte 0 did not match the header constant.
    #[error("bad frame header: {byte:#04x} (expected 0xaa)")]
    BadHeader {
        /// The byte that was received at offset 0.
        byte: u8,
    },
}

/// Gear selector position reported by the controller.
///
/// The wire value is a 2-bit field; displayed gears are 1-3 and out-of-range
/// raw values are clamped, matching the instrument firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Gear {
    /// Gear 1 (eco).
    Low = 1,
    /// Gear 2 (normal).
    #[default]
    Mid = 2,
    /// Gear 3 (sport).
    High = 3,
}

impl Gear {
    /// Create from the raw 2-bit wire value, clamping to the valid range.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 | 1 => Self::Low,
            2 => Self::Mid,
            _ => Self::High,
        }
    }

    /// Convert to the raw wire value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }
}

impl std::fmt::Display for Gear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// A decoded telemetry frame.
///
/// One variant per interpreted kind; everything else decodes to `Unknown`
/// with its payload carried through untouched, since the controller firmware
/// emits more kinds than this crate assigns meaning to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Kind 0: gear, rpm, and the two motor phase currents.
    Main {
        /// Gear selector position.
        gear: Gear,
        /// Motor speed in rpm.
        rpm: u16,
        /// Quadrature current in centiamperes.
        iq_raw: i16,
        /// Direct current in centiamperes.
        id_raw: i16,
    },
    /// Kind 1: battery voltage.
    Voltage {
        /// Battery voltage in decivolts.
        voltage_raw: u16,
    },
    /// Kind 4: controller temperature.
    ControllerTemp {
        /// Temperature in degrees Celsius.
        celsius: i8,
    },
    /// Kind 13: motor temperature and throttle position.
    MotorTemp {
        /// Temperature in degrees Celsius.
        celsius: i8,
        /// Throttle position in raw ADC counts.
        throttle: u16,
    },
    /// Any kind this crate does not interpret.
    Unknown {
        /// The kind discriminator from byte 1.
        kind: u8,
        /// The 14 payload bytes, preserved verbatim.
        payload: [u8; PAYLOAD_LEN],
    },
}

impl Frame {
    /// Kind discriminator for main data (gear, rpm, currents).
    pub const KIND_MAIN: u8 = 0;
    /// Kind discriminator for battery voltage.
    pub const KIND_VOLTAGE: u8 = 1;
    /// Kind discriminator for controller temperature.
    pub const KIND_CONTROLLER_TEMP: u8 = 4;
    /// Kind discriminator for motor temperature and throttle.
    pub const KIND_MOTOR_TEMP: u8 = 13;

    /// Get the kind discriminator for this frame.
    pub fn kind(&self) -> u8 {
        match self {
            Self::Main { .. } => Self::KIND_MAIN,
            Self::Voltage { .. } => Self::KIND_VOLTAGE,
            Self::ControllerTemp { .. } => Self::KIND_CONTROLLER_TEMP,
            Self::MotorTemp { .. } => Self::KIND_MOTOR_TEMP,
            Self::Unknown { kind, .. } => *kind,
        }
    }

    /// Build a "no data available" frame for an arbitrary kind.
    ///
    /// Encoding a kind without defined fields is legal; the payload is
    /// zero-filled. Synthetic sources use this to stay forward compatible
    /// with kinds they do not model.
    pub fn no_data(kind: u8) -> Self {
        Self::Unknown {
            kind,
            payload: [0u8; PAYLOAD_LEN],
        }
    }

    /// Encode this frame into its 16-byte wire form.
    ///
    /// Unused payload bytes are zero-filled. Multi-byte fields are written
    /// big-endian through the same layout tables decode reads from.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[0] = FRAME_HEADER;
        buf[1] = self.kind();

        if let Self::Unknown { payload, .. } = self {
            buf[2..].copy_from_slice(payload);
            return buf;
        }

        if let Some(specs) = layout::layout_for(self.kind()) {
            for spec in specs {
                spec.write(&mut buf, self.field_value(spec.field));
            }
        }

        buf
    }

    /// Decode a 16-byte wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidFrame::WrongLength`] unless the input is exactly
    /// 16 bytes, and [`InvalidFrame::BadHeader`] unless byte 0 is `0xAA`.
    /// Unrecognized kinds are not errors; they decode to [`Frame::Unknown`].
    pub fn decode(data: &[u8]) -> Result<Self, InvalidFrame> {
        if data.len() != FRAME_LEN {
            return Err(InvalidFrame::WrongLength { len: data.len() });
        }

        if data[0] != FRAME_HEADER {
            return Err(InvalidFrame::BadHeader { byte: data[0] });
        }

        let mut buf = [0u8; FRAME_LEN];
        buf.copy_from_slice(data);
        let kind = buf[1];

        let Some(specs) = layout::layout_for(kind) else {
            let mut payload = [0u8; PAYLOAD_LEN];
            payload.copy_from_slice(&buf[2..]);
            return Ok(Self::Unknown { kind, payload });
        };

        let raw = |field: Field| -> i32 {
            specs
                .iter()
                .find(|s| s.field == field)
                .map(|s| s.read(&buf))
                .unwrap_or(0)
        };

        let frame = match kind {
            Self::KIND_MAIN => Self::Main {
                gear: Gear::from_raw(raw(Field::Gear) as u8),
                rpm: raw(Field::Rpm) as u16,
                iq_raw: raw(Field::IqRaw) as i16,
                id_raw: raw(Field::IdRaw) as i16,
            },
            Self::KIND_VOLTAGE => Self::Voltage {
                voltage_raw: raw(Field::VoltageRaw) as u16,
            },
            Self::KIND_CONTROLLER_TEMP => Self::ControllerTemp {
                celsius: raw(Field::ControllerTemp) as i8,
            },
            Self::KIND_MOTOR_TEMP => Self::MotorTemp {
                celsius: raw(Field::MotorTemp) as i8,
                throttle: raw(Field::Throttle) as u16,
            },
            // layout_for() only returns tables for the kinds above.
            _ => Self::no_data(kind),
        };

        Ok(frame)
    }

    /// Raw value for a logical field of this frame.
    ///
    /// Fields that do not belong to the frame's kind read as zero; the
    /// layout tables never ask for those.
    fn field_value(&self, field: Field) -> i32 {
        match (self, field) {
            (Self::Main { gear, .. }, Field::Gear) => i32::from(gear.to_raw()),
            (Self::Main { rpm, .. }, Field::Rpm) => i32::from(*rpm),
            (Self::Main { iq_raw, .. }, Field::IqRaw) => i32::from(*iq_raw),
            (Self::Main { id_raw, .. }, Field::IdRaw) => i32::from(*id_raw),
            (Self::Voltage { voltage_raw }, Field::VoltageRaw) => i32::from(*voltage_raw),
            (Self::ControllerTemp { celsius }, Field::ControllerTemp) => i32::from(*celsius),
            (Self::MotorTemp { celsius, .. }, Field::MotorTemp) => i32::from(*celsius),
            (Self::MotorTemp { throttle, .. }, Field::Throttle) => i32::from(*throttle),
            _ => 0,
        }
    }
}
