//! Apparent solar position for an instant and observer location.
//!
//! Low-precision solar coordinates (mean longitude, mean anomaly and a
//! three-term equation of centre) with a fixed J2000 obliquity, followed by
//! Bennett's refraction formula. Accuracy is well within what is needed to
//! place building shadows; more importantly the function is pure, so callers
//! can cache results keyed by approximate equality of the output.

use std::f64::consts::{PI, TAU};

use chrono::{DateTime, TimeZone, Utc};

/// Apparent altitude (degrees) at which the sun's upper limb touches the
/// horizon, refraction included.
pub const NIGHT_THRESHOLD_DEG: f64 = -0.833;

const JULIAN_DAY_UNIX_EPOCH: f64 = 2_440_587.5;
const JULIAN_DAY_J2000: f64 = 2_451_545.0;
const DAYS_PER_CENTURY: f64 = 36_525.0;
const MS_PER_DAY: f64 = 86_400_000.0;
const J2000_OBLIQUITY_DEG: f64 = 23.439_291;
/// Refraction is only applied above this geometric altitude (degrees).
const REFRACTION_GUARD_DEG: f64 = -1.0;

/// Sun position as seen by an observer. Both angles in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    /// Refraction-corrected altitude above the horizon.
    pub altitude: f64,
    /// Clockwise from true north, in `[0, 2π)`.
    pub azimuth: f64,
}

impl SunPosition {
    pub fn new(altitude: f64, azimuth: f64) -> Self {
        Self { altitude, azimuth }
    }

    /// Build from degrees, mostly for tests and host code.
    pub fn from_degrees(altitude_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            altitude: altitude_deg.to_radians(),
            azimuth: azimuth_deg.to_radians().rem_euclid(TAU),
        }
    }

    pub fn altitude_deg(&self) -> f64 {
        self.altitude.to_degrees()
    }

    pub fn azimuth_deg(&self) -> f64 {
        self.azimuth.to_degrees()
    }

    /// True when the sun is at or below `threshold_deg` apparent altitude.
    pub fn is_below(&self, threshold_deg: f64) -> bool {
        self.altitude <= threshold_deg.to_radians()
    }

    pub fn is_night(&self) -> bool {
        self.is_below(NIGHT_THRESHOLD_DEG)
    }

    /// Whether a shadow computed for `self` may be reused for `other`.
    pub fn is_close_to(&self, other: &SunPosition, altitude_tol: f64, azimuth_tol: f64) -> bool {
        (self.altitude - other.altitude).abs() < altitude_tol
            && angular_distance(self.azimuth, other.azimuth) < azimuth_tol
    }
}

/// Shortest-arc distance between two angles in radians.
pub fn angular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(TAU);
    d.min(TAU - d)
}

/// Julian Day (UT) for an instant.
pub fn julian_day<Tz: TimeZone>(instant: &DateTime<Tz>) -> f64 {
    let utc = instant.with_timezone(&Utc);
    utc.timestamp_millis() as f64 / MS_PER_DAY + JULIAN_DAY_UNIX_EPOCH
}

/// Bennett's refraction (degrees) for a geometric altitude in degrees.
///
/// The cotangent argument is clamped so the formula stays finite right at
/// and just below the horizon.
pub fn bennett_refraction_deg(altitude_deg: f64) -> f64 {
    let arg = (altitude_deg + 7.31 / (altitude_deg + 4.4)).clamp(0.1, 89.9);
    let arcminutes = 1.0 / arg.to_radians().tan();
    arcminutes / 60.0
}

/// Wrap an angle into `[-π, π)`.
fn normalize_signed(angle: f64) -> f64 {
    (angle + PI).rem_euclid(TAU) - PI
}

/// Apparent sun position for `instant` at the given latitude/longitude (degrees).
///
/// Inputs are not range-checked; out-of-range coordinates give defined but
/// meaningless angles.
pub fn sun_position<Tz: TimeZone>(
    instant: &DateTime<Tz>,
    latitude_deg: f64,
    longitude_deg: f64,
) -> SunPosition {
    let jd = julian_day(instant);
    let d = jd - JULIAN_DAY_J2000;
    let t = d / DAYS_PER_CENTURY;

    // Mean longitude and mean anomaly (degrees)
    let l0 = (280.466_46 + 36_000.769_83 * t + 0.000_303_2 * t * t).rem_euclid(360.0);
    let m = (357.529_11 + 35_999.050_29 * t - 0.000_153_7 * t * t).rem_euclid(360.0);
    let m_rad = m.to_radians();

    // Equation of centre
    let c = (1.914_602 - 0.004_817 * t - 0.000_014 * t * t) * m_rad.sin()
        + (0.019_993 - 0.000_101 * t) * (2.0 * m_rad).sin()
        + 0.000_289 * (3.0 * m_rad).sin();
    let lambda = (l0 + c).to_radians();

    let epsilon = J2000_OBLIQUITY_DEG.to_radians();
    let right_ascension = (epsilon.cos() * lambda.sin()).atan2(lambda.cos());
    let declination = (epsilon.sin() * lambda.sin()).asin();

    // Greenwich mean sidereal time (degrees)
    let gmst = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    let lst = (gmst + longitude_deg).to_radians();
    let hour_angle = normalize_signed(lst - right_ascension);

    let lat = latitude_deg.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_dec, cos_dec) = declination.sin_cos();

    let geometric = (sin_lat * sin_dec + cos_lat * cos_dec * hour_angle.cos())
        .clamp(-1.0, 1.0)
        .asin();
    let geometric_deg = geometric.to_degrees();
    let apparent_deg = if geometric_deg > REFRACTION_GUARD_DEG {
        geometric_deg + bennett_refraction_deg(geometric_deg)
    } else {
        geometric_deg
    };
    let altitude = apparent_deg.to_radians().clamp(-PI / 2.0, PI / 2.0);

    let azimuth = (-cos_dec * hour_angle.sin())
        .atan2(sin_dec * cos_lat - cos_dec * sin_lat * hour_angle.cos())
        .rem_euclid(TAU);

    SunPosition { altitude, azimuth }
}
