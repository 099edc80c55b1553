//! Per-tag fusion pipeline.
//!
//! Owns the EKF, the loose fusor, and the world tables for one tag. Each
//! call runs to completion; the pipeline never returns an error, it encodes
//! health in the `FusionResult` flag and recovers by resetting itself.

use log::{debug, warn};

use crate::config::WorldModel;
use crate::constants::{DIM_CAP, OUTDOOR_LAYER};
use crate::filters::ekf::Ekf;
use crate::filters::loose::{Estimate, ImuReport, LooseFusor, SensorBatch, UwbFix};
use crate::layer_manager::LayerManager;
use crate::rssi::BleRssi;
use crate::types::{
    Anchor, BleMeasurement, BleRow, DimMat, EkfSample, FusionResult, Outcome,
    TwrMeasurement, TwrRow,
};
use std::collections::HashMap;

/// Events older than this gap hard-reset the filter.
const MAX_GAP_SECS: f64 = 30.0;

/// TWR readings further than this from the current state are outliers.
const TWR_STATE_GATE_M: f64 = 50.0;

/// Loose estimates further than this from the EKF mean force a rebuild.
const LOOSE_DIVERGENCE_M: f64 = 20.0;

/// Divergence rejections tolerated before a hard reset.
const MAX_DIVERGE_COUNT: u32 = 5;

pub struct FusionPipeline {
    anchors: HashMap<u32, Anchor>,
    rssi_model: BleRssi,
    ekf: Ekf,
    last_ts: Option<i64>,
    last_imu_dist: Option<f64>,
    initialized: bool,
    dim_map: HashMap<i32, Vec<DimMat>>,
    beacon_layer: HashMap<u32, i32>,
    beacon_dims: HashMap<u32, Vec<DimMat>>,
    layer_manager: Option<LayerManager>,
    diverge_count: u32,
    loose_fusor: LooseFusor,
}

impl FusionPipeline {
    pub fn new(world: WorldModel) -> Self {
        let WorldModel {
            mut anchors,
            rssi,
            dim_map,
            beacon_layer,
            beacon_dims,
            layer_manager,
            bounds,
        } = world;

        // Mirror short-id aliases once, at construction. Lookup never
        // aliases on the fly.
        let aliases: Vec<(u32, Anchor)> = anchors
            .iter()
            .filter_map(|(id, a)| {
                let short = id & 0xFFFF;
                if short != *id && !anchors.contains_key(&short) {
                    let mut alias = *a;
                    alias.id = short;
                    Some((short, alias))
                } else {
                    None
                }
            })
            .collect();
        for (short, alias) in aliases {
            anchors.insert(short, alias);
        }

        let mut ekf = Ekf::new();
        ekf.x_min[0] = bounds.min_x;
        ekf.x_max[0] = bounds.max_x;
        ekf.x_min[1] = bounds.min_y;
        ekf.x_max[1] = bounds.max_y;

        FusionPipeline {
            anchors,
            rssi_model: rssi,
            ekf,
            last_ts: None,
            last_imu_dist: None,
            initialized: false,
            dim_map,
            beacon_layer,
            beacon_dims,
            layer_manager,
            diverge_count: 0,
            loose_fusor: LooseFusor::default(),
        }
    }

    /// Configuration-time mutation only; see the concurrency notes.
    pub fn add_anchor(&mut self, anchor: Anchor) {
        self.anchors.insert(anchor.id, anchor);
    }

    pub fn has_anchor(&self, id: u32) -> bool {
        self.anchors.contains_key(&id)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn choose_layer(
        &self,
        ble_meas: &[BleMeasurement],
        twr_meas: &[TwrMeasurement],
        current: (f64, f64),
    ) -> Option<i32> {
        let lm = self.layer_manager.as_ref()?;
        let pos3 = if self.initialized {
            [current.0, current.1, 0.0]
        } else {
            // No state yet: anchor centroid stands in for the position.
            let mut sx = 0.0;
            let mut sy = 0.0;
            let mut n = 0usize;
            for id in twr_meas
                .iter()
                .map(|m| m.anchor_id)
                .chain(ble_meas.iter().map(|m| m.anchor_id))
            {
                if let Some(a) = self.anchors.get(&id) {
                    sx += a.x;
                    sy += a.y;
                    n += 1;
                }
            }
            if n > 0 {
                [sx / n as f64, sy / n as f64, 0.0]
            } else {
                [0.0, 0.0, 0.0]
            }
        };
        lm.get_layer(ble_meas, twr_meas, pos3, &self.rssi_model, &self.anchors)
    }

    /// Shape raw measurements into EKF rows: resolve anchors, gate outliers,
    /// pick corridor candidates.
    fn build_sample(
        &self,
        ts_ms: i64,
        tag_id: u32,
        ble_meas: &[BleMeasurement],
        twr_meas: &[TwrMeasurement],
        tag_height: f64,
        layer_sel: Option<i32>,
        current: (f64, f64),
    ) -> EkfSample {
        let mut ble_rows = Vec::new();
        let mut ble_est_ranges: Vec<f64> = Vec::new();
        for m in ble_meas {
            let a = match self.anchors.get(&m.anchor_id) {
                Some(a) => a,
                None => continue,
            };
            let strength = self.rssi_model.strength_from_dbm(m.rssi_dbm);
            ble_rows.push(BleRow {
                x: a.x,
                y: a.y,
                z: a.z,
                strength: f64::from(strength),
                anchor_id: m.anchor_id,
                layer: a.layer,
            });
            if self.rssi_model.valid_rssi(strength) {
                ble_est_ranges.push(0.01 * f64::from(self.rssi_model.rssi2range(strength)));
            }
        }

        let min_ble_est = ble_est_ranges.iter().copied().fold(f64::INFINITY, f64::min);

        let mut twr_rows = Vec::new();
        for m in twr_meas {
            let a = match self.anchors.get(&m.anchor_id) {
                Some(a) => a,
                None => continue,
            };
            if m.range_m < 0.01 || m.range_m > 400.0 {
                debug!("tag {tag_id}: TWR {} out of range ({})", m.anchor_id, m.range_m);
                continue;
            }
            if self.initialized {
                let dist = (a.x - current.0).hypot(a.y - current.1);
                if (m.range_m - dist).abs() > TWR_STATE_GATE_M {
                    debug!(
                        "tag {tag_id}: TWR {} inconsistent with state ({} vs {:.1})",
                        m.anchor_id, m.range_m, dist
                    );
                    continue;
                }
            }
            if !ble_est_ranges.is_empty() && m.range_m > (2.0 * min_ble_est).max(30.0) {
                debug!(
                    "tag {tag_id}: TWR {} inconsistent with BLE ranging ({})",
                    m.anchor_id, m.range_m
                );
                continue;
            }
            twr_rows.push(TwrRow {
                x: a.x,
                y: a.y,
                z: a.z,
                range: m.range_m,
                anchor_id: m.anchor_id,
                layer: a.layer,
            });
        }

        // Corridor candidates come from the closest beacons first.
        let mut ble_list: Vec<(u32, i32)> = ble_meas
            .iter()
            .filter(|m| self.anchors.contains_key(&m.anchor_id))
            .map(|m| (m.anchor_id, self.rssi_model.strength_from_dbm(m.rssi_dbm)))
            .collect();
        ble_list.sort_by_key(|(_, strength)| *strength);

        let mut dims: Vec<DimMat> = Vec::new();
        for (aid, _) in ble_list {
            if dims.len() >= DIM_CAP {
                break;
            }
            if let Some(sel) = layer_sel {
                let mut lay = self.beacon_layer.get(&aid).copied().unwrap_or(0);
                if lay == 0 {
                    if let Some(a) = self.anchors.get(&aid) {
                        lay = a.layer;
                    }
                }
                if lay != 0 && lay != sel {
                    continue;
                }
            }
            match self.beacon_dims.get(&aid) {
                Some(mats) if !mats.is_empty() => {
                    for m in mats {
                        dims.push(*m);
                        if dims.len() >= DIM_CAP {
                            break;
                        }
                    }
                }
                _ => {
                    if let Some(a) = self.anchors.get(&aid) {
                        dims.push(DimMat::Point([a.x, a.y, a.z]));
                    }
                }
            }
        }
        if let Some(sel) = layer_sel {
            if sel != OUTDOOR_LAYER {
                if let Some(mats) = self.dim_map.get(&sel) {
                    for m in mats {
                        if dims.len() >= DIM_CAP {
                            break;
                        }
                        dims.push(*m);
                    }
                }
            }
        }

        EkfSample {
            timestamp_ms: ts_ms,
            tag_id,
            tag_height,
            ble: ble_rows,
            twr: twr_rows,
            dims,
        }
    }

    /// Drop all estimation state and the loose fusor. The next measurement
    /// event re-bootstraps.
    fn hard_reset(&mut self) {
        self.ekf.reset_state();
        self.initialized = false;
        self.diverge_count = 0;
        self.loose_fusor = LooseFusor::default();
    }

    fn reset_result(ts_ms: i64, layer: Option<i32>) -> FusionResult {
        FusionResult {
            timestamp_ms: ts_ms,
            x: 0.0,
            y: 0.0,
            flag: Outcome::StateReset.flag(),
            used: [0, 0],
            num_beacons: 0,
            algo: "NA",
            layer,
        }
    }

    /// Fuse one measurement event for this tag.
    pub fn process(
        &mut self,
        ts_ms: i64,
        tag_id: u32,
        ble_meas: &[BleMeasurement],
        twr_meas: &[TwrMeasurement],
        tag_height: f64,
    ) -> FusionResult {
        let mut ts_ms = ts_ms;
        if self.last_ts.is_none() {
            self.last_ts = Some(ts_ms);
        }
        let current = if self.initialized {
            (self.ekf.xk[0], self.ekf.xk[1])
        } else {
            (0.0, 0.0)
        };

        let mut layer_sel = self.choose_layer(ble_meas, twr_meas, current);
        let sample =
            self.build_sample(ts_ms, tag_id, ble_meas, twr_meas, tag_height, layer_sel, current);

        if !self.initialized && (!sample.twr.is_empty() || !sample.ble.is_empty()) {
            // First absolute fix: start at the in-view centroid, offset by a
            // meter so co-located anchors cannot pin the gradient.
            let (sx, sy, n) = if !sample.ble.is_empty() {
                sample
                    .ble
                    .iter()
                    .fold((0.0, 0.0, 0usize), |(x, y, n), b| (x + b.x, y + b.y, n + 1))
            } else {
                sample
                    .twr
                    .iter()
                    .fold((0.0, 0.0, 0usize), |(x, y, n), t| (x + t.x, y + t.y, n + 1))
            };
            self.ekf.xk[0] = sx / n as f64 + 1.0;
            self.ekf.xk[1] = sy / n as f64 + 1.0;
            self.initialized = true;
            self.diverge_count = 0;
        }

        let last = self.last_ts.unwrap_or(ts_ms);
        if ts_ms <= last {
            ts_ms = last + 1;
        }
        let dt = (ts_ms - last) as f64 / 1000.0;
        if dt > MAX_GAP_SECS {
            warn!("tag {tag_id}: {dt:.0}s event gap, resetting filter");
            self.hard_reset();
            self.last_ts = Some(ts_ms);
            return Self::reset_result(ts_ms, layer_sel);
        }

        self.ekf.updt(dt.max(0.01));
        self.ekf.up_meas(&sample);
        self.ekf.kf_update(&sample);
        self.last_ts = Some(ts_ms);
        let mut outcome = self.ekf.outcome;

        // Covariance watchdog: a position sigma beyond 100 m means the
        // filter diverged no matter what the state says.
        if self.ekf.pxk[(0, 0)] > 10_000.0 || self.ekf.pxk[(1, 1)] > 10_000.0 {
            warn!("tag {tag_id}: covariance blew up, resetting filter");
            self.hard_reset();
            return Self::reset_result(ts_ms, layer_sel);
        }

        if outcome == Outcome::DivergenceRejected {
            self.diverge_count += 1;
            if self.diverge_count > MAX_DIVERGE_COUNT {
                warn!("tag {tag_id}: {} rejected updates, resetting filter", self.diverge_count);
                self.hard_reset();
                return Self::reset_result(ts_ms, layer_sel);
            }
        } else if matches!(outcome, Outcome::PredictOnly | Outcome::Updated) {
            self.diverge_count = 0;
        }

        if outcome == Outcome::PredictOnly {
            self.ekf.predict_constrain();
        }

        // Accepted fixes anchor the loose fusor.
        let ts_sec = ts_ms as f64 / 1000.0;
        if outcome == Outcome::Updated {
            self.loose_fusor.ingest_batch(&SensorBatch {
                timestamp: ts_sec,
                uwb: Some(UwbFix { x: self.ekf.xk[0], y: self.ekf.xk[1] }),
                imu: None,
            });
        }

        // Re-check the layer against the post-update position.
        if let Some(lm) = &self.layer_manager {
            let pos = [self.ekf.xk[0], self.ekf.xk[1], 0.0];
            match lm.get_layer(ble_meas, twr_meas, pos, &self.rssi_model, &self.anchors) {
                None => outcome = Outcome::LayerUnknown,
                Some(layer) => layer_sel = Some(layer),
            }
        }

        let mut algo = "0D";
        for (mat, enabled) in sample.dims.iter().zip(self.ekf.dc.enabled()) {
            if *enabled && mat.is_segment() {
                algo = "1D";
                break;
            }
        }

        let used = [self.ekf.used_mea[0], self.ekf.used_mea[1]];
        let mut out_x = self.ekf.xk[0];
        let mut out_y = self.ekf.xk[1];
        let mut est = Estimate::default();
        if self.loose_fusor.latest(&mut est) && !est.raw_x.is_nan() {
            let dist = (est.raw_x - self.ekf.xk[0]).hypot(est.raw_y - self.ekf.xk[1]);
            if dist > LOOSE_DIVERGENCE_M {
                // Trust the EKF and rebuild the loose fusor seeded from it.
                warn!("tag {tag_id}: loose estimate diverged by {dist:.1} m, rebuilding");
                self.loose_fusor = LooseFusor::default();
                self.loose_fusor.ingest_batch(&SensorBatch {
                    timestamp: ts_sec,
                    uwb: Some(UwbFix { x: out_x, y: out_y }),
                    imu: None,
                });
            } else {
                out_x = est.raw_x;
                out_y = est.raw_y;
            }
        }

        if out_x.is_nan() || out_y.is_nan() {
            warn!("tag {tag_id}: non-finite output, resetting filter");
            self.hard_reset();
            return Self::reset_result(ts_ms, layer_sel);
        }

        FusionResult {
            timestamp_ms: ts_ms,
            x: out_x,
            y: out_y,
            flag: outcome.flag(),
            used,
            num_beacons: sample.ble.len() + sample.twr.len(),
            algo,
            layer: layer_sel,
        }
    }

    /// Advance the filter with one dead-reckoning sample. IMU alone never
    /// initializes the pipeline: it is relative, an absolute fix needs
    /// TWR/BLE.
    pub fn process_imu(&mut self, ts_ms: i64, cumulative_distance_m: f64, yaw_deg: f64) {
        let mut ts_ms = ts_ms;
        if self.last_ts.is_none() {
            self.last_ts = Some(ts_ms);
            self.last_imu_dist = Some(cumulative_distance_m);
            return;
        }
        let delta_dist = match self.last_imu_dist {
            Some(prev) => cumulative_distance_m - prev,
            None => 0.0,
        };
        self.last_imu_dist = Some(cumulative_distance_m);

        let last = self.last_ts.unwrap_or(ts_ms);
        if ts_ms <= last {
            ts_ms = last + 1;
        }
        let dt = (ts_ms - last) as f64 / 1000.0;
        if dt > MAX_GAP_SECS {
            warn!("{dt:.0}s IMU gap, resetting filter");
            self.hard_reset();
            self.last_ts = Some(ts_ms);
            return;
        }

        // IMU glitches must not walk the filter away.
        if delta_dist.abs() > 5.0 || (dt > 0.0 && delta_dist.abs() / dt > 20.0) {
            debug!("IMU step rejected ({delta_dist:.2} m over {dt:.3} s)");
            return;
        }

        self.loose_fusor.ingest_batch(&SensorBatch {
            timestamp: ts_ms as f64 / 1000.0,
            uwb: None,
            imu: Some(ImuReport {
                yaw_deg,
                speed_mps: 0.0,
                forward_dis_m: cumulative_distance_m,
                motion_code: 1,
                yaw_sigma_code: 0,
                ds_sigma_code: 0,
            }),
        });

        self.ekf.updt(dt.max(0.01));
        self.ekf.predict();

        let yaw = yaw_deg.to_radians();
        let dx = delta_dist * yaw.cos();
        let dy = delta_dist * yaw.sin();
        self.ekf.xk[0] = (self.ekf.xk[0] + dx).clamp(self.ekf.x_min[0], self.ekf.x_max[0]);
        self.ekf.xk[1] = (self.ekf.xk[1] + dy).clamp(self.ekf.x_min[1], self.ekf.x_max[1]);

        if self.ekf.pxk[(0, 0)] > 10_000.0 || self.ekf.pxk[(1, 1)] > 10_000.0 {
            warn!("covariance blew up on IMU path, resetting filter");
            self.hard_reset();
            return;
        }

        if dt > 0.0 {
            let mut vx = dx / dt;
            let mut vy = dy / dt;
            let speed = vx.hypot(vy);
            if speed > self.ekf.x_max[2] {
                let scale = self.ekf.x_max[2] / speed;
                vx *= scale;
                vy *= scale;
            }
            self.ekf.xk[2] = vx;
            self.ekf.xk[3] = vy;
        }
        self.last_ts = Some(ts_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldModel;
    use crate::constants::MAX_VEL;

    fn anchor(id: u32, x: f64, y: f64, z: f64, layer: i32) -> Anchor {
        Anchor { id, x, y, z, layer, building: 1 }
    }

    fn world(anchors: Vec<Anchor>) -> WorldModel {
        let map = anchors.into_iter().map(|a| (a.id, a)).collect();
        WorldModel::with_anchors(map, BleRssi::new(3.0, 8.0, 1000))
    }

    fn two_anchor_world() -> WorldModel {
        world(vec![anchor(1, 0.0, 0.0, 0.0, 2), anchor(2, 10.0, 0.0, 0.0, 2)])
    }

    fn run_s1(pipeline: &mut FusionPipeline, steps: usize, start_ts: i64) -> FusionResult {
        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 5.0 },
            TwrMeasurement { anchor_id: 2, range_m: 5.0 },
        ];
        let mut ts = start_ts;
        let mut last = None;
        for _ in 0..steps {
            last = Some(pipeline.process(ts, 1, &[], &twr, 0.0));
            ts += 100;
        }
        last.expect("at least one step")
    }

    // S1: two-anchor TWR convergence.
    #[test]
    fn test_two_anchor_twr_convergence() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let r5 = run_s1(&mut p, 5, 1_000);
        assert_eq!(r5.flag, 2);
        assert!((r5.x - 5.0).abs() < 0.5, "x after 5 steps: {}", r5.x);
        assert!(r5.y.abs() < 0.5, "y after 5 steps: {}", r5.y);

        let r30 = run_s1(&mut p, 25, 1_500);
        assert_eq!(r30.flag, 2);
        assert!((r30.x - 5.0).abs() < 0.2, "x after 30 steps: {}", r30.x);
        assert!(r30.y.abs() < 0.2, "y after 30 steps: {}", r30.y);
        assert_eq!(r30.used, [2, 0]);
        assert_eq!(r30.algo, "0D");
    }

    // S2: BLE-only bootstrap.
    #[test]
    fn test_ble_only_bootstrap() {
        let w = world(vec![
            anchor(1, 0.0, 0.0, 2.0, 2),
            anchor(2, 10.0, 0.0, 2.0, 2),
            anchor(3, 5.0, 8.66, 2.0, 2),
        ]);
        let mut p = FusionPipeline::new(w);
        // Strength for a 5 m range under factor 3 / adjust 8.
        let strength = p.rssi_model.range2rssi(500);
        let ble: Vec<BleMeasurement> = [1, 2, 3]
            .iter()
            .map(|&id| BleMeasurement { anchor_id: id, rssi_dbm: -strength })
            .collect();

        let mut ts = 1_000;
        let first = p.process(ts, 1, &ble, &[], 0.0);
        assert!(p.is_initialized());
        assert_eq!(first.flag, 2);

        let mut last = first;
        for _ in 0..9 {
            ts += 100;
            last = p.process(ts, 1, &ble, &[], 0.0);
        }
        let err = (last.x - 5.0).hypot(last.y - 2.88);
        assert!(err < 2.0, "position error {err:.2} m at ({}, {})", last.x, last.y);
        assert_eq!(last.flag, 2);
        assert_eq!(last.used, [0, 3]);
    }

    // S3: outlier TWR rejection in steady state.
    #[test]
    fn test_outlier_twr_rejected() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let settled = run_s1(&mut p, 30, 1_000);

        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 5.0 },
            TwrMeasurement { anchor_id: 2, range_m: 500.0 },
        ];
        let r = p.process(4_000, 1, &[], &twr, 0.0);
        assert_eq!(r.flag, 2);
        assert_eq!(r.used, [1, 0], "outlier must not be counted");
        let moved = (r.x - settled.x).hypot(r.y - settled.y);
        assert!(moved < 0.1, "outlier moved the fix by {moved:.3} m");
    }

    // S4: dt gap reset and re-bootstrap.
    #[test]
    fn test_event_gap_resets_and_rebootstraps() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let r = run_s1(&mut p, 5, 1_000);
        assert_eq!(r.flag, 2);

        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 5.0 },
            TwrMeasurement { anchor_id: 2, range_m: 5.0 },
        ];
        let gap_ts = 1_400 + 35_000;
        let reset = p.process(gap_ts, 1, &[], &twr, 0.0);
        assert_eq!(reset.flag, -2);
        assert_eq!(reset.x, 0.0);
        assert_eq!(reset.y, 0.0);
        assert_eq!(reset.algo, "NA");
        assert!(!p.is_initialized());

        // Reset is idempotent: an immediate second gap behaves the same.
        let reset2 = p.process(gap_ts + 35_000, 1, &[], &twr, 0.0);
        assert_eq!(reset2.flag, -2);
        assert!(!p.is_initialized());

        let back = p.process(gap_ts + 35_100, 1, &[], &twr, 0.0);
        assert_eq!(back.flag, 2);
        assert!(p.is_initialized());
    }

    // S5: IMU-only dead reckoning never initializes.
    #[test]
    fn test_imu_only_dead_reckoning() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let mut ts = 1_000;
        p.process_imu(ts, 0.0, 90.0);
        for i in 1..=10 {
            ts += 100;
            p.process_imu(ts, 0.1 * i as f64, 90.0);
        }
        assert!(!p.is_initialized());
        // Walking 1 m of odometry along +y; prediction compounds the
        // velocity estimate on top of the explicit displacement.
        assert!(p.ekf.xk[1] > 0.8, "y = {}", p.ekf.xk[1]);
        assert!(p.ekf.xk[1] < 2.2, "y = {}", p.ekf.xk[1]);
        assert!(p.ekf.xk[0].abs() < 0.1, "x = {}", p.ekf.xk[0]);
        assert!(p.ekf.xk[2].hypot(p.ekf.xk[3]) <= MAX_VEL + 1e-9);
    }

    // S6: loose-fusor divergence snap-back.
    #[test]
    fn test_loose_divergence_snaps_back_to_ekf() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let settled = run_s1(&mut p, 30, 1_000);
        assert!((settled.x - 5.0).abs() < 0.2);

        p.loose_fusor.ingest_batch(&SensorBatch {
            timestamp: 4.0,
            uwb: Some(UwbFix { x: 50.0, y: 50.0 }),
            imu: None,
        });

        // A predict-only step reads the loose estimate before any new fix
        // can re-anchor it.
        let r = p.process(4_000, 1, &[], &[], 0.0);
        assert!((r.x - 5.0).abs() < 0.5, "snap-back x: {}", r.x);
        assert!(r.y.abs() < 0.5, "snap-back y: {}", r.y);

        // The fusor was rebuilt and seeded from the EKF state.
        let mut est = Estimate::default();
        assert!(p.loose_fusor.latest(&mut est));
        assert!((est.raw_x - r.x).abs() < 1e-9);
        assert!((est.raw_y - r.y).abs() < 1e-9);
    }

    #[test]
    fn test_duplicate_timestamps_are_bumped() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 5.0 },
            TwrMeasurement { anchor_id: 2, range_m: 5.0 },
        ];
        let r1 = p.process(1_000, 1, &[], &twr, 0.0);
        let r2 = p.process(1_000, 1, &[], &twr, 0.0);
        let r3 = p.process(900, 1, &[], &twr, 0.0);
        assert_eq!(r2.timestamp_ms, r1.timestamp_ms + 1);
        assert_eq!(r3.timestamp_ms, r2.timestamp_ms + 1);
    }

    #[test]
    fn test_state_clamps_hold_through_pipeline() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let mut ts = 1_000;
        for step in 0..40 {
            // Wildly inconsistent ranging keeps innovation pressure high.
            let r = 5.0 + if step % 2 == 0 { 3.0 } else { -3.0 };
            let twr = [
                TwrMeasurement { anchor_id: 1, range_m: r },
                TwrMeasurement { anchor_id: 2, range_m: 10.0 - r },
            ];
            p.process(ts, 1, &[], &twr, 0.0);
            ts += 100;
            assert!(p.ekf.xk[2].abs() <= MAX_VEL);
            assert!(p.ekf.xk[3].abs() <= MAX_VEL);
            assert!(p.ekf.xk[4] >= 2.5 && p.ekf.xk[4] <= 3.5);
            assert!(p.ekf.xk[5] >= 7.0 && p.ekf.xk[5] <= 9.0);
        }
    }

    #[test]
    fn test_twr_rejected_against_ble_estimate() {
        let w = world(vec![
            anchor(1, 0.0, 0.0, 0.0, 2),
            anchor(2, 10.0, 0.0, 0.0, 2),
            anchor(3, 5.0, 3.0, 2.0, 2),
        ]);
        let mut p = FusionPipeline::new(w);
        // Strength implying ~10 m, so the TWR cap is max(30, 20) = 30.
        let strength = p.rssi_model.range2rssi(1_000);
        let ble = [BleMeasurement { anchor_id: 3, rssi_dbm: -strength }];
        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 40.0 },
            TwrMeasurement { anchor_id: 2, range_m: 25.0 },
        ];
        let r = p.process(1_000, 1, &ble, &twr, 0.0);
        assert_eq!(r.used, [1, 1]);
        assert_eq!(r.num_beacons, 2);
    }

    #[test]
    fn test_unknown_anchors_leave_predict_only() {
        let mut p = FusionPipeline::new(two_anchor_world());
        let twr = [TwrMeasurement { anchor_id: 999, range_m: 5.0 }];
        let r = p.process(1_000, 1, &[], &twr, 0.0);
        assert_eq!(r.flag, 1);
        assert_eq!(r.used, [0, 0]);
        assert!(!p.is_initialized());
    }

    #[test]
    fn test_short_id_alias_resolves() {
        let mut w = two_anchor_world();
        w.anchors.insert(
            0x0001_0042,
            anchor(0x0001_0042, 3.0, 3.0, 0.0, 2),
        );
        let mut p = FusionPipeline::new(w);
        assert!(p.has_anchor(0x42));
        let twr = [TwrMeasurement { anchor_id: 0x42, range_m: 2.0 }];
        let r = p.process(1_000, 1, &[], &twr, 0.0);
        assert_eq!(r.used, [1, 0]);
    }

    #[test]
    fn test_segment_corridor_sets_algo_1d() {
        let mut w = world(vec![
            anchor(1, 0.0, 0.0, 0.0, 2),
            anchor(2, 10.0, 0.0, 0.0, 2),
            anchor(9, 5.0, 1.0, 2.0, 2),
        ]);
        w.beacon_dims.insert(
            9,
            vec![DimMat::Segment([0.0, 0.0, 0.0], [10.0, 0.0, 0.0])],
        );
        let mut p = FusionPipeline::new(w);
        let strength = p.rssi_model.range2rssi(500);
        let ble = [BleMeasurement { anchor_id: 9, rssi_dbm: -strength }];
        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 5.0 },
            TwrMeasurement { anchor_id: 2, range_m: 5.0 },
        ];
        let r = p.process(1_000, 1, &ble, &twr, 0.0);
        assert_eq!(r.flag, 2);
        assert_eq!(r.algo, "1D");
    }

    #[test]
    fn test_dim_candidates_capped() {
        let mut w = two_anchor_world();
        w.anchors.insert(9, anchor(9, 5.0, 1.0, 2.0, 2));
        let mats: Vec<DimMat> = (0..8)
            .map(|i| DimMat::Point([i as f64, 0.0, 0.0]))
            .collect();
        w.beacon_dims.insert(9, mats);
        let p = FusionPipeline::new(w);
        let strength = p.rssi_model.range2rssi(500);
        let ble = [BleMeasurement { anchor_id: 9, rssi_dbm: -strength }];
        let sample = p.build_sample(1_000, 1, &ble, &[], 0.0, None, (0.0, 0.0));
        assert_eq!(sample.dims.len(), DIM_CAP);
    }

    #[test]
    fn test_imu_glitch_rejected() {
        let mut p = FusionPipeline::new(two_anchor_world());
        p.process_imu(1_000, 0.0, 0.0);
        p.process_imu(1_100, 0.1, 0.0);
        let x_before = p.ekf.xk[0];
        // 8 m in one step is a glitch.
        p.process_imu(1_200, 8.1, 0.0);
        assert!((p.ekf.xk[0] - x_before).abs() < 1e-9);
    }

    #[test]
    fn test_layer_attached_to_results() {
        let mut w = world(vec![
            anchor(1, 0.0, 0.0, 0.0, 2),
            anchor(2, 10.0, 8.0, 0.0, 2),
        ]);
        let layers = HashMap::new();
        w.layer_manager = Some(LayerManager::from_layers(layers, &w.anchors));
        let mut p = FusionPipeline::new(w);
        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 6.4 },
            TwrMeasurement { anchor_id: 2, range_m: 6.4 },
        ];
        let r = p.process(1_000, 1, &[], &twr, 0.0);
        assert_eq!(r.layer, Some(2));
        assert!(r.flag > 0);
    }
}
