//! Adaptive Extended Kalman Filter over the 6D tag state.
//!
//! State vector: [x, y, vx, vy, n, A] where `n` is the BLE path-loss
//! exponent and `A` the BLE 1 m adjustment, both estimated online. The
//! measurement vector concatenates TWR ranges, BLE strengths, and the
//! enabled corridor rows. Measurement noise adapts per row with a
//! Sage-Husa fading recursion.

use nalgebra::{DMatrix, DVector, Matrix2};

use crate::constants::{
    BETA_B, BETA_INIT, BLE_ERR, DECELERATION, DELTA_A, FADING, HDOP_MAX, HISTORY_LEN,
    MAX_VEL, MIN_DISTANCE, PATH_LOSS_EXP, PXK_FAC_NO_BLE, PXK_FAC_WITH_BLE, SIGMA_A,
    SIGMA_A0, SIGMA_ACC, SIGMA_N, SIGMA_N0, SIGMA_POS, SIGMA_VEL, STATE_DIM, S_REG,
    TOF_ERR, USE_ADAPTIVE,
};
use crate::dim_constraint::DimConstrain;
use crate::linalg::{
    all_finite, all_finite_mat, gershgorin_lower_bound, invert2x2, pinv, rank2, symmetrize,
};
use crate::models::{random_model, NoiseKind};
use crate::types::{EkfSample, Outcome};

pub struct Ekf {
    n: usize,
    ts: f64,
    fading: f64,
    adaptive: bool,
    beta: f64,
    b: f64,

    xconstrain: [bool; STATE_DIM],
    pub x_min: [f64; STATE_DIM],
    pub x_max: [f64; STATE_DIM],

    /// Row counts: [TWR, BLE, reserved, corridor].
    pub used_mea: [usize; 4],
    pub outcome: Outcome,
    pub hdop: f64,
    /// Mahalanobis distance of the last innovation, for diagnostics.
    pub h_maha: f64,

    pub xk: DVector<f64>,
    pub pxk: DMatrix<f64>,
    phikk1: DMatrix<f64>,
    qk: DMatrix<f64>,

    yk: DVector<f64>,
    ykk1: DVector<f64>,
    hk: DMatrix<f64>,
    rk_mat: DMatrix<f64>,
    rmin: DMatrix<f64>,
    rmax: DMatrix<f64>,

    pub dc: DimConstrain,
    xkk1: DVector<f64>,
    pykk1: DMatrix<f64>,
    rk: DVector<f64>,
}

impl Ekf {
    pub fn new() -> Self {
        let n = STATE_DIM;
        let mut x_min = [0.0; STATE_DIM];
        let mut x_max = [0.0; STATE_DIM];
        // Position bounds are world bounds, only applied during IMU
        // displacement; the measurement update leaves x, y free.
        x_min[0] = -10_000.0;
        x_max[0] = 10_000.0;
        x_min[1] = -10_000.0;
        x_max[1] = 10_000.0;
        x_min[2] = -MAX_VEL;
        x_max[2] = MAX_VEL;
        x_min[3] = -MAX_VEL;
        x_max[3] = MAX_VEL;
        x_min[4] = PATH_LOSS_EXP[0];
        x_max[4] = PATH_LOSS_EXP[2];
        x_min[5] = DELTA_A[0];
        x_max[5] = DELTA_A[2];

        let mut ekf = Ekf {
            n,
            ts: 0.1,
            fading: FADING,
            adaptive: USE_ADAPTIVE,
            beta: BETA_INIT,
            b: BETA_B,
            xconstrain: [false, false, true, true, true, true],
            x_min,
            x_max,
            used_mea: [0; 4],
            outcome: Outcome::PredictOnly,
            hdop: 0.0,
            h_maha: 0.0,
            xk: DVector::zeros(n),
            pxk: DMatrix::zeros(n, n),
            phikk1: DMatrix::identity(n, n),
            qk: DMatrix::zeros(n, n),
            yk: DVector::zeros(0),
            ykk1: DVector::zeros(0),
            hk: DMatrix::zeros(0, n),
            rk_mat: DMatrix::zeros(0, 0),
            rmin: DMatrix::zeros(0, 0),
            rmax: DMatrix::zeros(0, 0),
            dc: DimConstrain::new(HISTORY_LEN),
            xkk1: DVector::zeros(n),
            pykk1: DMatrix::zeros(0, 0),
            rk: DVector::zeros(0),
        };
        ekf.reset_state();
        ekf
    }

    /// Back to the uninitialized prior: origin position, nominal path-loss
    /// parameters, diagonal covariance.
    pub fn reset_state(&mut self) {
        self.xk = DVector::zeros(self.n);
        self.xk[4] = PATH_LOSS_EXP[1];
        self.xk[5] = DELTA_A[1];
        self.pxk = DMatrix::zeros(self.n, self.n);
        self.pxk[(0, 0)] = SIGMA_POS * SIGMA_POS;
        self.pxk[(1, 1)] = SIGMA_POS * SIGMA_POS;
        self.pxk[(2, 2)] = SIGMA_VEL * SIGMA_VEL;
        self.pxk[(3, 3)] = SIGMA_VEL * SIGMA_VEL;
        self.pxk[(4, 4)] = SIGMA_N0 * SIGMA_N0;
        self.pxk[(5, 5)] = SIGMA_A0 * SIGMA_A0;
        self.phikk1 = DMatrix::identity(self.n, self.n);
        self.qk = DMatrix::zeros(self.n, self.n);
    }

    /// Build the transition and process noise for this step. The n/A random
    /// walk is frozen (1e-4 scale) while no BLE is in view, so strength-only
    /// biases cannot drift on TWR geometry.
    pub fn updt(&mut self, dt: f64) {
        self.ts = dt;
        self.phikk1 = DMatrix::identity(self.n, self.n);
        self.phikk1[(0, 2)] = dt;
        self.phikk1[(1, 3)] = dt;

        let qx = SIGMA_ACC * SIGMA_ACC;
        let qn = SIGMA_N * SIGMA_N;
        let qa = SIGMA_A * SIGMA_A;
        self.qk = DMatrix::zeros(self.n, self.n);
        self.qk[(0, 0)] = dt.powi(3) / 3.0 * qx;
        self.qk[(0, 2)] = dt.powi(2) / 2.0 * qx;
        self.qk[(2, 0)] = self.qk[(0, 2)];
        self.qk[(2, 2)] = dt * qx;
        self.qk[(1, 1)] = dt.powi(3) / 3.0 * qx;
        self.qk[(1, 3)] = dt.powi(2) / 2.0 * qx;
        self.qk[(3, 1)] = self.qk[(1, 3)];
        self.qk[(3, 3)] = dt * qx;
        let na_scale = if self.used_mea[1] == 0 { 1e-4 } else { 1.0 };
        self.qk[(4, 4)] = dt * qn * na_scale;
        self.qk[(5, 5)] = dt * qa * na_scale;
    }

    /// Size and fill the measurement structures for `sample`, select
    /// corridor rows, compute HDOP and the initial diagonal noise.
    pub fn up_meas(&mut self, sample: &EkfSample) {
        self.used_mea[0] = sample.twr.len();
        self.used_mea[1] = sample.ble.len();
        self.used_mea[2] = 0;
        let state_xy = (self.xk[0], self.xk[1]);
        self.used_mea[3] = self.dc.determine(&sample.dims, state_xy);

        let total = self.used_mea[0] + self.used_mea[1] + self.used_mea[3];
        self.yk = DVector::zeros(total);
        self.ykk1 = DVector::zeros(total);
        self.hk = DMatrix::zeros(total, self.n);
        self.rk_mat = DMatrix::zeros(total, total);
        self.rmin = DMatrix::zeros(total, total);
        self.rmax = DMatrix::zeros(total, total);

        let mut idx = 0;
        for tw in &sample.twr {
            self.yk[idx] = tw.range;
            idx += 1;
        }
        for bl in &sample.ble {
            self.yk[idx] = bl.strength;
            idx += 1;
        }
        // Corridor rows stay zero: the virtual measurement is "on the
        // constraint".

        idx = 0;
        for tw in &sample.twr {
            let dx = self.xk[0] - tw.x;
            let dy = self.xk[1] - tw.y;
            let dz = sample.tag_height - tw.z;
            let d = (dx * dx + dy * dy + dz * dz).sqrt().max(MIN_DISTANCE);
            self.hk[(idx, 0)] = dx / d;
            self.hk[(idx, 1)] = dy / d;
            idx += 1;
        }
        for bl in &sample.ble {
            let dx = self.xk[0] - bl.x;
            let dy = self.xk[1] - bl.y;
            let dz = sample.tag_height - bl.z;
            let d = (dx * dx + dy * dy + dz * dz).sqrt().max(MIN_DISTANCE);
            let common = 10.0 * self.xk[4] / (std::f64::consts::LN_10 * d * d);
            self.hk[(idx, 0)] = common * dx;
            self.hk[(idx, 1)] = common * dy;
            self.hk[(idx, 4)] = 10.0 * d.log10();
            self.hk[(idx, 5)] = 1.0;
            idx += 1;
        }

        self.hdop = self.compute_hdop();

        let mut idx = 0;
        let f_hdop = random_model(self.hdop, NoiseKind::Mh);
        for tw in &sample.twr {
            let f_dis = random_model(tw.range, NoiseKind::Tof);
            self.rk_mat[(idx, idx)] = (TOF_ERR * f_dis * f_hdop).powi(2);
            idx += 1;
        }
        for bl in &sample.ble {
            let f_rssi = random_model(bl.strength, NoiseKind::Ble);
            self.rk_mat[(idx, idx)] = (BLE_ERR * f_rssi * f_hdop).powi(2);
            idx += 1;
        }
        // Corridor noise lands in build_rows together with its bounds.
        for i in 0..idx {
            self.rmax[(i, i)] = 100.0 * self.rk_mat[(i, i)];
            self.rmin[(i, i)] = 0.01 * self.rk_mat[(i, i)];
        }

        self.manage_pxk();
    }

    /// Horizontal dilution of precision from the position sub-block of the
    /// real measurement Jacobian. Zero when the geometry cannot support it.
    fn compute_hdop(&self) -> f64 {
        let real = self.used_mea[0] + self.used_mea[1];
        if real < 2 {
            return 0.0;
        }
        let mut g = Matrix2::zeros();
        for i in 0..real {
            let hx = self.hk[(i, 0)];
            let hy = self.hk[(i, 1)];
            g[(0, 0)] += hx * hx;
            g[(0, 1)] += hx * hy;
            g[(1, 0)] += hy * hx;
            g[(1, 1)] += hy * hy;
        }
        if rank2(&g) != 2 {
            return 0.0;
        }
        let ginv = invert2x2(&g);
        (ginv[(0, 0)] + ginv[(1, 1)]).sqrt().min(HDOP_MAX)
    }

    /// Covariance propagation only. Used for pure predict steps and the IMU
    /// dead-reckoning path.
    pub fn predict(&mut self) {
        self.xk = &self.phikk1 * &self.xk;
        self.pxk =
            &(&self.phikk1 * &self.pxk) * &self.phikk1.transpose() + &self.qk;
    }

    /// One full predict + measurement-fusion step. `up_meas` must have run
    /// for the same sample.
    pub fn kf_update(&mut self, sample: &EkfSample) {
        let total = self.used_mea[0] + self.used_mea[1] + self.used_mea[3];
        if total == 0 {
            self.predict();
            self.outcome = Outcome::PredictOnly;
            return;
        }

        self.xkk1 = &self.phikk1 * &self.xk;
        let pxkk1 =
            &(&self.phikk1 * &self.pxk) * &self.phikk1.transpose() + &self.qk;

        let mea_size = self.used_mea[0] + self.used_mea[1] + self.used_mea[2];
        if self.used_mea[3] > 0 {
            let pred_xy = (self.xkk1[0], self.xkk1[1]);
            self.dc.build_rows(
                &sample.dims,
                pred_xy,
                self.hdop,
                mea_size,
                &mut self.ykk1,
                &mut self.hk,
                &mut self.rk_mat,
                &mut self.rmin,
                &mut self.rmax,
            );
        }

        // Expected measurements against the predicted state.
        let mut idx = 0;
        for tw in &sample.twr {
            let dx = self.xkk1[0] - tw.x;
            let dy = self.xkk1[1] - tw.y;
            let dz = sample.tag_height - tw.z;
            let d = (dx * dx + dy * dy + dz * dz).sqrt().max(MIN_DISTANCE);
            self.ykk1[idx] = d;
            idx += 1;
        }
        for bl in &sample.ble {
            let dx = self.xkk1[0] - bl.x;
            let dy = self.xkk1[1] - bl.y;
            let dz = sample.tag_height - bl.z;
            let d = (dx * dx + dy * dy + dz * dz).sqrt().max(MIN_DISTANCE);
            self.ykk1[idx] = self.xkk1[5] + 10.0 * self.xkk1[4] * d.log10();
            idx += 1;
        }

        self.rk = &self.yk - &self.ykk1;

        let pxykk1 = &pxkk1 * &self.hk.transpose();
        let py0 = &self.hk * &pxykk1;

        if self.adaptive {
            for i in 0..total {
                let mut ry = self.rk[i] * self.rk[i] - py0[(i, i)];
                let ry_max = self.rmax[(i, i)];
                let ry_min = self.rmin[(i, i)];
                if ry < ry_min {
                    ry = ry_min;
                }
                if ry > ry_max {
                    self.rk_mat[(i, i)] = ry_max;
                } else {
                    self.rk_mat[(i, i)] =
                        (1.0 - self.beta) * self.rk_mat[(i, i)] + self.beta * ry;
                }
            }
            self.beta = self.beta / (self.beta + self.b);
        }

        let mut pykk1 = py0 + &self.rk_mat;
        let min_eig = gershgorin_lower_bound(&pykk1);
        if min_eig < 1e-9 {
            let add = min_eig.abs() + 1e-9;
            for i in 0..total {
                pykk1[(i, i)] += add;
            }
        }
        let inv_py = pinv(&pykk1);

        let mut maha = 0.0;
        for i in 0..total {
            for j in 0..total {
                maha += self.rk[i] * inv_py[(i, j)] * self.rk[j];
            }
        }
        self.h_maha = maha.sqrt();

        let kk = &pxykk1 * &inv_py;
        self.xk = &self.xkk1 + &kk * &self.rk;
        self.pxk = (&pxkk1 - &(&kk * &pykk1) * &kk.transpose()) * (self.fading / 2.0);
        self.pykk1 = pykk1;

        {
            let rk_slice: &[f64] = self.rk.as_slice();
            self.dc
                .rk_const(self.used_mea[3], mea_size, rk_slice, &self.pykk1);
        }

        for i in 0..self.n {
            if self.xconstrain[i] {
                self.xk[i] = self.xk[i].clamp(self.x_min[i], self.x_max[i]);
            }
        }

        if !all_finite(&self.xk) || !all_finite_mat(&self.pxk) {
            self.reset_state();
            self.outcome = Outcome::StateReset;
        } else {
            self.outcome = Outcome::Updated;
        }
    }

    /// Covariance hygiene before each update. Without BLE the path-loss
    /// states must not ride along on position corrections, so their
    /// cross-covariances are damped and their variances capped tighter.
    pub fn manage_pxk(&mut self) {
        let cons_fac = if self.used_mea[1] == 0 {
            let pv_fac = PXK_FAC_NO_BLE;
            for i in 0..4 {
                self.pxk[(4, i)] *= pv_fac;
                self.pxk[(i, 4)] *= pv_fac;
                self.pxk[(5, i)] *= pv_fac;
                self.pxk[(i, 5)] *= pv_fac;
            }
            PXK_FAC_NO_BLE
        } else {
            PXK_FAC_WITH_BLE
        };
        let max_n_var = (cons_fac * SIGMA_N0).powi(2);
        let max_a_var = (cons_fac * SIGMA_A0).powi(2);
        if self.pxk[(4, 4)] > max_n_var {
            self.pxk[(4, 4)] = max_n_var;
        }
        if self.pxk[(5, 5)] > max_a_var {
            self.pxk[(5, 5)] = max_a_var;
        }
        symmetrize(&mut self.pxk);
        if gershgorin_lower_bound(&self.pxk) < S_REG {
            for i in 0..self.n {
                self.pxk[(i, i)] += S_REG;
            }
        }
    }

    /// Bleed speed off after a predict-only step and keep the position and
    /// velocity variances inside 3 sigma of the prior.
    pub fn predict_constrain(&mut self) {
        let speed = self.xk[2].hypot(self.xk[3]);
        if speed > 0.01 && DECELERATION > 0.01 {
            let scale = (speed - DECELERATION * self.ts).max(0.0) / speed;
            self.xk[2] *= scale;
            self.xk[3] *= scale;
            for i in 0..4 {
                let cap = if i <= 1 {
                    SIGMA_POS * SIGMA_POS * 3.0
                } else {
                    SIGMA_VEL * SIGMA_VEL * 3.0
                };
                if self.pxk[(i, i)] > cap {
                    self.pxk[(i, i)] = cap;
                }
            }
        }
    }
}

impl Default for Ekf {
    fn default() -> Self {
        Self::new()
    }
}
