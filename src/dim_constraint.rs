//! Corridor constraints as virtual measurements.
//!
//! Point constraints pull the state toward a location, segment constraints
//! pull it onto a line. Each enabled constraint appends one row after the
//! real BLE/TWR rows. A rolling innovation check suppresses constraints
//! while they fight the real measurements.

use nalgebra::{DMatrix, DVector};

use crate::constants::{
    DIM_ERR, DIS_LIMIT, ENDPOINT_LIMIT, HISTORY_LEN, MIN_DISTANCE,
};
use crate::models::{chi2_inv, random_model, rk_statistics, NoiseKind};
use crate::types::DimMat;

#[derive(Clone, Debug)]
pub struct DimConstrain {
    his_len: usize,
    /// Most recent first: (innovation mean, stddev, NIS) per update.
    rk_examined: Vec<[f64; 3]>,
    /// Most recent first: (point seen, segment seen) activity flags.
    flags_history: Vec<[i32; 2]>,
    /// Per candidate: (line distance, endpoint distance) at selection time.
    selected_dist: Vec<[f64; 2]>,
    enabled: Vec<bool>,
    over_limit: bool,
}

impl DimConstrain {
    pub fn new(his_len: usize) -> Self {
        DimConstrain {
            his_len,
            rk_examined: vec![[0.0; 3]; his_len],
            flags_history: vec![[0; 2]; his_len],
            selected_dist: vec![[0.0; 2]; 2],
            enabled: Vec::new(),
            over_limit: false,
        }
    }

    pub fn enabled(&self) -> &[bool] {
        &self.enabled
    }

    pub fn over_limit(&self) -> bool {
        self.over_limit
    }

    /// Rolling (point seen, segment seen) activity flags, newest first.
    pub fn activity_history(&self) -> &[[i32; 2]] {
        &self.flags_history
    }

    /// (line distance, endpoint distance) from `point` to the constraint.
    /// The endpoint distance is zero while the perpendicular foot lies on
    /// the segment.
    fn distance_cal(point: (f64, f64), mat: &DimMat) -> (f64, f64) {
        match mat {
            DimMat::Point(p) => {
                let dx = point.0 - p[0];
                let dy = point.1 - p[1];
                (dx.hypot(dy), 0.0)
            }
            DimMat::Segment(p1, p2) => {
                let a = p2[1] - p1[1];
                let b = p1[0] - p2[0];
                let c = p2[0] * p1[1] - p1[0] * p2[1];
                let norm = a.hypot(b).max(MIN_DISTANCE);
                let dist_line = (a * point.0 + b * point.1 + c).abs() / norm;
                let seg_sq = (p2[0] - p1[0]).powi(2) + (p2[1] - p1[1]).powi(2);
                let t = ((point.0 - p1[0]) * (p2[0] - p1[0])
                    + (point.1 - p1[1]) * (p2[1] - p1[1]))
                    / seg_sq;
                let dist_ep = if t < 0.0 {
                    (point.0 - p1[0]).hypot(point.1 - p1[1])
                } else if t > 1.0 {
                    (point.0 - p2[0]).hypot(point.1 - p2[1])
                } else {
                    0.0
                };
                (dist_line, dist_ep)
            }
        }
    }

    /// Select which candidate constraints participate in this sample, gated
    /// against the current state. Returns the enabled count.
    pub fn determine(&mut self, dims: &[DimMat], state_xy: (f64, f64)) -> usize {
        let mut dim_type = [0i32; 2];
        self.enabled = vec![false; dims.len()];
        if self.selected_dist.len() < dims.len() {
            self.selected_dist.resize(dims.len(), [0.0; 2]);
        }

        let mut used = 0;
        if !dims.is_empty() && !self.over_limit {
            for (i, mat) in dims.iter().enumerate() {
                let (dist_line, dist_ep) = Self::distance_cal(state_xy, mat);
                if mat.is_segment() {
                    dim_type[1] = 1;
                } else {
                    dim_type[0] = 1;
                }
                if dist_line > DIS_LIMIT || dist_ep > ENDPOINT_LIMIT {
                    continue;
                }
                self.selected_dist[i] = [dist_line, dist_ep];
                self.enabled[i] = true;
                used += 1;
            }
        }

        for i in (1..self.flags_history.len()).rev() {
            self.flags_history[i] = self.flags_history[i - 1];
        }
        self.flags_history[0] = dim_type;
        used
    }

    /// Fill the virtual rows at indices `mea_size..` against the predicted
    /// state. Real rows must already be in place.
    #[allow(clippy::too_many_arguments)]
    pub fn build_rows(
        &self,
        dims: &[DimMat],
        xkk1_xy: (f64, f64),
        hdop: f64,
        mea_size: usize,
        ykk1: &mut DVector<f64>,
        hk: &mut DMatrix<f64>,
        rk: &mut DMatrix<f64>,
        rmin: &mut DMatrix<f64>,
        rmax: &mut DMatrix<f64>,
    ) {
        let f_hdop = random_model(hdop, NoiseKind::Dh);
        let mut row = mea_size;
        for (i, mat) in dims.iter().enumerate() {
            if !self.enabled.get(i).copied().unwrap_or(false) {
                continue;
            }
            match mat {
                DimMat::Point(p) => {
                    let dx = xkk1_xy.0 - p[0];
                    let dy = xkk1_xy.1 - p[1];
                    let d = dx.hypot(dy).max(MIN_DISTANCE);
                    ykk1[row] = d;
                    hk[(row, 0)] = dx / d;
                    hk[(row, 1)] = dy / d;
                }
                DimMat::Segment(p1, p2) => {
                    let mut a = p2[1] - p1[1];
                    let mut b = p1[0] - p2[0];
                    let mut c = p2[0] * p1[1] - p1[0] * p2[1];
                    let norm = a.hypot(b).max(MIN_DISTANCE);
                    a /= norm;
                    b /= norm;
                    c /= norm;
                    ykk1[row] = a * xkk1_xy.0 + b * xkk1_xy.1 + c;
                    hk[(row, 0)] = a;
                    hk[(row, 1)] = b;
                }
            }
            let f_dis = random_model(self.selected_dist[i][0], NoiseKind::Dd);
            let var = (DIM_ERR * f_hdop * f_dis).powi(2);
            rk[(row, row)] = var;
            rmax[(row, row)] = 100.0 * var;
            rmin[(row, row)] = 0.01 * var;
            row += 1;
        }
    }

    /// Update constraint health from the real-row innovations of the last
    /// update. Two of three abnormal statistics suppress constraints until
    /// the history recovers.
    pub fn rk_const(
        &mut self,
        used_dims: usize,
        mea_size: usize,
        rk: &[f64],
        pykk1: &DMatrix<f64>,
    ) {
        self.over_limit = false;
        if mea_size == 0 {
            return;
        }
        let py = pykk1.view((0, 0), (mea_size, mea_size)).into_owned();
        let stats = rk_statistics(mea_size, &rk[..mea_size], &py);

        for i in (1..self.rk_examined.len()).rev() {
            self.rk_examined[i] = self.rk_examined[i - 1];
        }
        self.rk_examined[0] = stats;

        let len = self.his_len as f64;
        let mut mean_avg = 0.0;
        let mut std_avg = 0.0;
        let mut nis_avg = 0.0;
        for s in &self.rk_examined {
            mean_avg += s[0];
            std_avg += s[1];
            nis_avg += s[2];
        }
        mean_avg /= len;
        std_avg /= len;
        nis_avg /= len;

        let chi_thr = chi2_inv(0.99, mea_size);
        let nis_ratio = if chi_thr > 0.0 { nis_avg / chi_thr } else { 0.0 };

        let mut abnormal = 0;
        if mean_avg.abs() > 0.3 {
            abnormal += 1;
        }
        if std_avg > 0.4 {
            abnormal += 1;
        }
        if nis_ratio > 1.0 {
            abnormal += 1;
        }
        if used_dims > 0 && abnormal >= 2 {
            self.over_limit = true;
        }
    }
}

impl Default for DimConstrain {
    fn default() -> Self {
        Self::new(HISTORY_LEN)
    }
}
