//! Rover telemetry piggybacked on acknowledgements.

use serde::{Deserialize, Serialize};

/// Number of trailing tokens a telemetry-bearing ACK carries.
pub const TELEMETRY_FIELDS: usize = 7;

const EARTH_DIAMETER_M: f64 = 12_742_000.0;

/// One telemetry sample reported by the rover.
///
/// Wire order: `state posX posY posZ lat long altitude`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub vehicle_state: String,
    pub pos_x: f64,
    pub pos_y: f64,
    pub pos_z: f64,
    pub lat: f64,
    pub long: f64,
    pub altitude: f64,
}

impl TelemetrySample {
    /// Build a sample from exactly [`TELEMETRY_FIELDS`] tokens.
    ///
    /// Returns the name of the first field that fails to parse.
    pub fn from_tokens(tokens: &[&str]) -> Result<Self, &'static str> {
        if tokens.len() != TELEMETRY_FIELDS {
            return Err("field count");
        }
        let num = |idx: usize, name: &'static str| tokens[idx].parse::<f64>().map_err(|_| name);
        Ok(TelemetrySample {
            vehicle_state: tokens[0].to_string(),
            pos_x: num(1, "posX")?,
            pos_y: num(2, "posY")?,
            pos_z: num(3, "posZ")?,
            lat: num(4, "lat")?,
            long: num(5, "long")?,
            altitude: num(6, "altitude")?,
        })
    }

    /// Great-circle distance in metres between this fix and `other`.
    pub fn distance_to(&self, other: &TelemetrySample) -> f64 {
        haversine_m((self.lat, self.long), (other.lat, other.long))
    }
}

/// Haversine distance in metres between two `(lat, long)` pairs in degrees.
pub fn haversine_m(start: (f64, f64), current: (f64, f64)) -> f64 {
    let p = std::f64::consts::PI / 180.0;
    let a = 0.5 - ((current.0 - start.0) * p).cos() / 2.0
        + (start.0 * p).cos() * (current.0 * p).cos() * (1.0 - ((current.1 - start.1) * p).cos()) / 2.0;
    EARTH_DIAMETER_M * a.sqrt().asin()
}
