//! Loose-coupling secondary filter.
//!
//! Runs beside the main EKF: it ingests the EKF's accepted fixes plus raw
//! dead-reckoning reports and produces a responsive raw estimate and an
//! EWMA-smoothed shadow of it. The pipeline supervises it and rebuilds it
//! whenever it drifts away from the EKF.

use std::collections::VecDeque;

#[derive(Clone, Debug)]
pub struct LooseConfig {
    /// EWMA weight of the newest raw sample in the smoothed output.
    pub smoothing_alpha: f64,
    /// Raw estimates with no refresh for this many seconds are withheld.
    pub max_estimate_age_s: f64,
    /// Samples kept in the short horizon.
    pub horizon_len: usize,
}

impl Default for LooseConfig {
    fn default() -> Self {
        LooseConfig {
            smoothing_alpha: 0.3,
            max_estimate_age_s: 10.0,
            horizon_len: 50,
        }
    }
}

/// Absolute 2D fix handed down from the main EKF.
#[derive(Clone, Copy, Debug)]
pub struct UwbFix {
    pub x: f64,
    pub y: f64,
}

/// Dead-reckoning report: heading plus cumulative forward distance.
#[derive(Clone, Copy, Debug)]
pub struct ImuReport {
    pub yaw_deg: f64,
    pub speed_mps: f64,
    pub forward_dis_m: f64,
    /// 0 = stationary, anything else = moving.
    pub motion_code: i32,
    pub yaw_sigma_code: i32,
    pub ds_sigma_code: i32,
}

/// One ingest call. Timestamp is seconds; either input may be present.
#[derive(Clone, Copy, Debug, Default)]
pub struct SensorBatch {
    pub timestamp: f64,
    pub uwb: Option<UwbFix>,
    pub imu: Option<ImuReport>,
}

/// Output sample. Components are NaN while undefined.
#[derive(Clone, Copy, Debug)]
pub struct Estimate {
    pub raw_x: f64,
    pub raw_y: f64,
    pub smoothed_x: f64,
    pub smoothed_y: f64,
}

impl Default for Estimate {
    fn default() -> Self {
        Estimate {
            raw_x: f64::NAN,
            raw_y: f64::NAN,
            smoothed_x: f64::NAN,
            smoothed_y: f64::NAN,
        }
    }
}

pub struct LooseFusor {
    config: LooseConfig,
    raw: Option<(f64, f64)>,
    smoothed: Option<(f64, f64)>,
    last_ts: Option<f64>,
    last_raw_ts: Option<f64>,
    last_forward_dist: Option<f64>,
    /// (ts, x, y) raw history, newest at the back.
    horizon: VecDeque<(f64, f64, f64)>,
}

impl LooseFusor {
    pub fn new(config: LooseConfig) -> Self {
        LooseFusor {
            horizon: VecDeque::with_capacity(config.horizon_len),
            config,
            raw: None,
            smoothed: None,
            last_ts: None,
            last_raw_ts: None,
            last_forward_dist: None,
        }
    }

    /// Accept a fix and/or an IMU report. The IMU displaces the raw estimate
    /// between fixes; a fix re-anchors it.
    pub fn ingest_batch(&mut self, batch: &SensorBatch) {
        let mut raw_updated = false;

        if let Some(imu) = &batch.imu {
            if let Some(prev) = self.last_forward_dist {
                let delta = imu.forward_dis_m - prev;
                if imu.motion_code != 0 {
                    if let Some((x, y)) = self.raw {
                        let yaw = imu.yaw_deg.to_radians();
                        self.raw = Some((x + delta * yaw.cos(), y + delta * yaw.sin()));
                        raw_updated = true;
                    }
                }
            }
            self.last_forward_dist = Some(imu.forward_dis_m);
        }

        if let Some(fix) = &batch.uwb {
            self.raw = Some((fix.x, fix.y));
            raw_updated = true;
        }

        if raw_updated {
            if let Some((x, y)) = self.raw {
                let a = self.config.smoothing_alpha;
                self.smoothed = Some(match self.smoothed {
                    None => (x, y),
                    Some((sx, sy)) => (sx + a * (x - sx), sy + a * (y - sy)),
                });
                self.horizon.push_back((batch.timestamp, x, y));
                while self.horizon.len() > self.config.horizon_len {
                    self.horizon.pop_front();
                }
                self.last_raw_ts = Some(batch.timestamp);
            }
        }

        self.last_ts = Some(batch.timestamp);
    }

    /// Fill `out` with the current estimate. Returns false while no estimate
    /// exists or the last refresh is older than the configured age.
    pub fn latest(&self, out: &mut Estimate) -> bool {
        let (x, y) = match self.raw {
            Some(v) => v,
            None => return false,
        };
        if let (Some(last), Some(raw_ts)) = (self.last_ts, self.last_raw_ts) {
            if last - raw_ts > self.config.max_estimate_age_s {
                return false;
            }
        }
        out.raw_x = x;
        out.raw_y = y;
        match self.smoothed {
            Some((sx, sy)) => {
                out.smoothed_x = sx;
                out.smoothed_y = sy;
            }
            None => {
                out.smoothed_x = f64::NAN;
                out.smoothed_y = f64::NAN;
            }
        }
        true
    }

    /// Recent raw estimates as (ts, x, y), oldest first.
    pub fn recent_path(&self) -> impl Iterator<Item = &(f64, f64, f64)> {
        self.horizon.iter()
    }
}

impl Default for LooseFusor {
    fn default() -> Self {
        Self::new(LooseConfig::default())
    }
}
