//! Utility functions for the fardriver-rust-ble crate.

/// Wheel circumference of the reference vehicle, in meters.
pub const DEFAULT_WHEEL_CIRCUMFERENCE_M: f64 = 1.350;

/// Motor-to-wheel gear ratio of the reference vehicle.
pub const DEFAULT_GEAR_RATIO: f64 = 4.0;

/// Convert motor rpm to road speed in km/h.
///
/// # Arguments
///
/// * `rpm` - Motor speed in revolutions per minute
/// * `wheel_circumference_m` - Wheel circumference in meters
/// * `gear_ratio` - Motor-to-wheel gear ratio
///
/// # Example
///
/// ```
/// use fardriver_rust_ble::rpm_to_speed_kmh;
///
/// let speed = rpm_to_speed_kmh(1000.0, 1.350, 4.0);
/// assert!((speed - 20.25).abs() < 0.001);
/// ```
#[inline]
pub fn rpm_to_speed_kmh(rpm: f64, wheel_circumference_m: f64, gear_ratio: f64) -> f64 {
    let wheel_rpm = rpm / gear_ratio;
    let distance_per_min = wheel_rpm * wheel_circumference_m;
    distance_per_min * 0.06
}

/// Convert road speed in km/h to motor rpm.
///
/// Inverse of [`rpm_to_speed_kmh`]; synthetic sources use this to derive a
/// plausible rpm from a target speed.
#[inline]
pub fn speed_kmh_to_rpm(speed_kmh: f64, wheel_circumference_m: f64, gear_ratio: f64) -> f64 {
    let wheel_rpm = (speed_kmh * 1000.0) / (60.0 * wheel_circumference_m);
    wheel_rpm * gear_ratio
}
