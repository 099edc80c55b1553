//! Engine constants shared by the filter, constraint, layer, and pipeline modules.

/// Path-loss exponent window (min, nominal, max); the exponent is estimated online.
pub const PATH_LOSS_EXP: [f64; 3] = [2.5, 3.0, 3.5];

/// BLE 1 m adjustment window (min, nominal, max); also estimated online.
pub const DELTA_A: [f64; 3] = [7.0, 8.0, 9.0];

/// Hard cap on tag speed in m/s.
pub const MAX_VEL: f64 = 1.5;

/// Base TWR ranging error in meters.
pub const TOF_ERR: f64 = 0.4;

/// Base BLE strength error in dB.
pub const BLE_ERR: f64 = 3.0;

/// Base corridor-constraint error in meters.
pub const DIM_ERR: f64 = 0.2;

pub const SIGMA_ACC: f64 = 0.08;
pub const SIGMA_N: f64 = 1e-3;
pub const SIGMA_A: f64 = 1e-2;
pub const SIGMA_POS: f64 = 5.0;
pub const SIGMA_VEL: f64 = 1.0;
pub const SIGMA_N0: f64 = 0.1;
pub const SIGMA_A0: f64 = 1.0;

/// Floor applied to every geometric distance before division.
pub const MIN_DISTANCE: f64 = 0.1;

pub const STATE_DIM: usize = 6;
pub const MAX_MEA_DIM: usize = 12;

pub const USE_ADAPTIVE: bool = true;
pub const FADING: f64 = 1.0;
pub const DECELERATION: f64 = 0.3;
pub const BETA_INIT: f64 = 1.0;
pub const BETA_B: f64 = 0.98;

/// Diagonal regularization added when a covariance loses positive definiteness.
pub const S_REG: f64 = 1e-9;

pub const PXK_FAC_WITH_BLE: f64 = 3.0;
pub const PXK_FAC_NO_BLE: f64 = 0.5;

/// Corridor constraints are dropped beyond this line distance in meters.
pub const DIS_LIMIT: f64 = 10.0;

/// Segment constraints are dropped beyond this endpoint distance in meters.
pub const ENDPOINT_LIMIT: f64 = 3.0;

/// Rolling window length for constraint health statistics.
pub const HISTORY_LEN: usize = 5;

pub const HDOP_MAX: f64 = 50.0;

/// Layer id reserved for outdoor positioning.
pub const OUTDOOR_LAYER: i32 = 1;

/// Most corridor constraints enabled for a single sample.
pub const DIM_CAP: usize = 5;

/// Chi-square inverse at p=0.99 for df 1..=10.
pub const CHI2_P99: [f64; 10] = [
    6.6349, 9.2103, 11.3449, 13.2767, 15.0863, 16.8119, 18.4753, 20.0902, 21.6660, 23.2093,
];

/// Chi-square inverse at p=0.95 for df 1..=10.
pub const CHI2_P95: [f64; 10] = [
    3.8415, 5.9915, 7.8147, 9.4877, 11.0705, 12.5916, 14.0671, 15.5073, 16.9189, 18.3070,
];
