//! Empirical noise-scaling curves and chi-square lookups.
//!
//! The curves were fitted against recorded deployments; inputs are
//! geometry-dependent quantities (HDOP, residual distance, raw range or
//! strength) and outputs are multiplicative scales on the base errors.

use nalgebra::DMatrix;

use crate::constants::{CHI2_P95, CHI2_P99};
use crate::linalg::pinv;

/// Which error curve to evaluate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoiseKind {
    /// Corridor-constraint distance scale.
    Dd,
    /// Corridor-constraint HDOP scale.
    Dh,
    /// BLE strength scale.
    Ble,
    /// TWR range scale.
    Tof,
    /// HDOP scale applied to all real measurements.
    Mh,
    Default,
}

/// Multiplicative noise scale for `x` under the given curve.
pub fn random_model(x: f64, kind: NoiseKind) -> f64 {
    match kind {
        NoiseKind::Dd => {
            if x <= 3.0 {
                5.0 * (2f64.powf(2.0 * x - 4.5) + 0.2)
            } else {
                5.0 * (-2f64.powf(-x + 5.58) + 9.0)
            }
        }
        NoiseKind::Dh => {
            if x <= 0.0 || x > 20.0 {
                0.5
            } else if x > 2.0 && x <= 6.0 {
                0.9
            } else if x > 6.0 {
                0.7
            } else {
                1.0
            }
        }
        NoiseKind::Ble => {
            if x <= 15.0 {
                (2f64.powf(0.45 * x - 5.3) + 0.2) / 3.0
            } else if x <= 40.0 {
                (-2f64.powf(-0.2 * x + 5.34) + 8.0) / 3.0
            } else {
                3.3
            }
        }
        NoiseKind::Tof => {
            if x < 0.1 {
                100.0
            } else if x < 10.0 {
                0.9
            } else if x < 30.0 {
                2.0
            } else if x < 50.0 {
                5.0
            } else {
                10.0
            }
        }
        NoiseKind::Mh => {
            if x <= 0.0 || x > 20.0 {
                2.0
            } else if x > 6.0 {
                1.5
            } else if x > 3.0 {
                1.1
            } else {
                1.0
            }
        }
        NoiseKind::Default => 1.0,
    }
}

/// Inverse chi-square for df clamped to 1..=10 at p=0.95 or p=0.99;
/// `p >= 0.97` selects the 0.99 table.
pub fn chi2_inv(p: f64, df: usize) -> f64 {
    let table = if p >= 0.97 { &CHI2_P99 } else { &CHI2_P95 };
    table[df.clamp(1, 10) - 1]
}

/// Innovation summary over the real measurement rows:
/// (mean, sample stddev, NIS = rk^T pinv(Pykk1) rk).
pub fn rk_statistics(mea_size: usize, rk: &[f64], pykk1: &DMatrix<f64>) -> [f64; 3] {
    let mut sum = 0.0;
    for i in 0..mea_size {
        sum += rk[i];
    }
    let mean = sum / mea_size as f64;

    let mut var = 0.0;
    for i in 0..mea_size {
        let d = rk[i] - mean;
        var += d * d;
    }
    let stddev = (var / ((mea_size - 1).max(1) as f64)).sqrt();

    let inv = pinv(pykk1);
    let mut nis = 0.0;
    for i in 0..mea_size {
        for j in 0..mea_size {
            nis += rk[i] * inv[(i, j)] * rk[j];
        }
    }
    [mean, stddev, nis]
}
