//! Measurement, anchor, and result types exchanged with the surrounding I/O layer.

use serde::{Deserialize, Serialize};

/// A fixed UWB anchor or BLE beacon with a known position.
///
/// Positions are meters in the world frame. `layer` is the floor/zone the
/// device is mounted on; `building` groups layers into a project.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Anchor {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub layer: i32,
    #[serde(default)]
    pub building: i32,
}

/// One BLE reading: signed dBm as received off the air.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BleMeasurement {
    pub anchor_id: u32,
    pub rssi_dbm: i32,
}

/// One two-way-ranging reading in meters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TwrMeasurement {
    pub anchor_id: u32,
    pub range_m: f64,
}

/// Dead-reckoning sample: cumulative forward distance plus heading.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ImuSample {
    pub timestamp_ms: i64,
    pub cumulative_distance_m: f64,
    pub yaw_deg: f64,
}

/// A corridor constraint in world coordinates: a point pins the tag near a
/// location, a segment pins it to a line.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub enum DimMat {
    Point([f64; 3]),
    Segment([f64; 3], [f64; 3]),
}

impl DimMat {
    pub fn is_segment(&self) -> bool {
        matches!(self, DimMat::Segment(_, _))
    }
}

/// Internal BLE measurement row after anchor resolution.
#[derive(Clone, Copy, Debug)]
pub struct BleRow {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub strength: f64,
    pub anchor_id: u32,
    pub layer: i32,
}

/// Internal TWR measurement row after anchor resolution and gating.
#[derive(Clone, Copy, Debug)]
pub struct TwrRow {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub range: f64,
    pub anchor_id: u32,
    pub layer: i32,
}

/// One shaped measurement event handed to the EKF.
#[derive(Clone, Debug)]
pub struct EkfSample {
    pub timestamp_ms: i64,
    pub tag_id: u32,
    pub tag_height: f64,
    pub ble: Vec<BleRow>,
    pub twr: Vec<TwrRow>,
    pub dims: Vec<DimMat>,
}

/// Health of one pipeline step.
///
/// The signed integer codes on [`FusionResult`] are an external interface
/// only; everything inside the engine passes this enum around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    PredictOnly,
    Updated,
    StateReset,
    LayerUnknown,
    DivergenceRejected,
}

impl Outcome {
    pub fn flag(self) -> i32 {
        match self {
            Outcome::PredictOnly => 1,
            Outcome::Updated => 2,
            Outcome::StateReset => -2,
            Outcome::LayerUnknown => -1,
            Outcome::DivergenceRejected => -3,
        }
    }
}

/// Per-event output of the fusion pipeline.
///
/// `flag`: 2 updated, 1 predict-only, -1 layer unknown, -2 reset,
/// -3 divergence rejection. `used` counts (TWR, BLE) rows that survived
/// gating. `algo` is "1D" when a segment corridor was active, "0D" for
/// point constraints or none, "NA" after a reset.
#[derive(Clone, Debug, Serialize)]
pub struct FusionResult {
    pub timestamp_ms: i64,
    pub x: f64,
    pub y: f64,
    pub flag: i32,
    pub used: [usize; 2],
    pub num_beacons: usize,
    pub algo: &'static str,
    pub layer: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_flags() {
        assert_eq!(Outcome::PredictOnly.flag(), 1);
        assert_eq!(Outcome::Updated.flag(), 2);
        assert_eq!(Outcome::StateReset.flag(), -2);
        assert_eq!(Outcome::LayerUnknown.flag(), -1);
        assert_eq!(Outcome::DivergenceRejected.flag(), -3);
    }

    #[test]
    fn test_dim_mat_kind() {
        let p = DimMat::Point([1.0, 2.0, 0.0]);
        let s = DimMat::Segment([0.0, 0.0, 0.0], [1.0, 0.0, 0.0]);
        assert!(!p.is_segment());
        assert!(s.is_segment());
    }
}
