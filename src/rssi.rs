//! Log-distance path-loss model mapping BLE signal strength to range.
//!
//! The engine works in positive "strength" units (|dBm|) and centimeter
//! ranges. A lookup table covers the valid strength window so the hot path
//! never touches `powf`.

/// RSSI <-> range converter with a precomputed range table.
#[derive(Clone, Debug)]
pub struct BleRssi {
    /// Path-loss factor (10*factor dB per decade of distance).
    pub factor: f64,
    /// Strength at 1 m.
    pub adjust: f64,
    /// Largest strength still considered rangeable.
    pub max_rssi: i32,
    pub rssi_thresh1: i32,
    pub rssi_thresh2: i32,
    /// Deployment cell side in cm.
    pub side_length: i32,
    /// Deployment cell diagonal in cm.
    pub hypotenuse_len: f64,
    ranges: Vec<i32>,
}

impl BleRssi {
    /// `intr_dist` is the deployment interval in cm.
    pub fn new(factor: f64, adjust: f64, intr_dist: i32) -> Self {
        let mut model = BleRssi {
            factor,
            adjust,
            max_rssi: 0,
            rssi_thresh1: 0,
            rssi_thresh2: 0,
            side_length: 0,
            hypotenuse_len: 0.0,
            ranges: Vec::new(),
        };
        model.init(intr_dist);
        model
    }

    fn init(&mut self, intr_dist: i32) {
        self.max_rssi = self.range2rssi(intr_dist + 700);
        self.rssi_thresh1 = self.range2rssi(intr_dist + 400);
        self.rssi_thresh2 = self.rssi_thresh1;
        self.side_length = intr_dist + 400;
        self.hypotenuse_len = f64::from(intr_dist + 700) * std::f64::consts::SQRT_2;

        let len = (self.max_rssi + self.adjust.abs() as i32 + 1).max(0) as usize;
        self.ranges = (0..len)
            .map(|i| self.rssi2range_raw(i as i32 - self.adjust as i32))
            .collect();
    }

    /// Expected strength at `dist` cm. Clamped to the 1 m value below 1 m.
    pub fn range2rssi(&self, dist: i32) -> i32 {
        if dist <= 100 {
            return -(self.adjust as i32);
        }
        ((f64::from(dist) * 0.01).log10() * 10.0 * self.factor - self.adjust).ceil() as i32
    }

    /// Model inversion without the table. Returns cm, floored at 1 m.
    pub fn rssi2range_raw(&self, strength: i32) -> i32 {
        let v = f64::from(strength) + self.adjust;
        if v < 0.0 {
            return 100;
        }
        (100.0 * 10f64.powf(v / (10.0 * self.factor))).round() as i32
    }

    /// Table lookup with raw fallback outside the precomputed window.
    pub fn rssi2range(&self, strength: i32) -> i32 {
        let idx = strength + self.adjust as i32;
        if idx >= 0 && (idx as usize) < self.ranges.len() {
            self.ranges[idx as usize]
        } else {
            self.rssi2range_raw(strength)
        }
    }

    pub fn valid_rssi(&self, strength: i32) -> bool {
        strength <= self.max_rssi
    }

    pub fn valid_rssi1(&self, strength: i32) -> bool {
        strength <= self.rssi_thresh1
    }

    pub fn valid_rssi2(&self, strength: i32) -> bool {
        strength <= self.rssi_thresh2
    }

    /// Positive strength from a signed dBm reading.
    pub fn strength_from_dbm(&self, dbm: i32) -> i32 {
        if dbm >= 0 {
            dbm
        } else {
            -dbm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> BleRssi {
        BleRssi::new(3.0, 8.0, 1000)
    }

    #[test]
    fn test_near_field_clamp() {
        let m = model();
        assert_eq!(m.range2rssi(50), -8);
        assert_eq!(m.range2rssi(100), -8);
        assert_eq!(m.rssi2range_raw(-9), 100);
    }

    #[test]
    fn test_table_matches_raw() {
        let m = model();
        for s in -8..=m.max_rssi {
            assert_eq!(m.rssi2range(s), m.rssi2range_raw(s), "strength {s}");
        }
    }

    #[test]
    fn test_out_of_table_falls_back() {
        let m = model();
        let s = m.max_rssi + 20;
        assert_eq!(m.rssi2range(s), m.rssi2range_raw(s));
    }

    #[test]
    fn test_roundtrip_within_one_quantization_step() {
        // Strength is quantized to whole dB, so a roundtrip can be off by up
        // to one step: a factor of 10^(1/(10*factor)).
        let m = model();
        let max_ratio = 10f64.powf(1.0 / (10.0 * m.factor)) + 0.005;
        let mut d = 100;
        while d <= 1700 {
            let s = m.range2rssi(d);
            let back = m.rssi2range(s);
            let ratio = f64::from(back) / f64::from(d);
            assert!(
                ratio >= 1.0 / max_ratio && ratio <= max_ratio,
                "d={d} back={back}"
            );
            d += 7;
        }
    }

    #[test]
    fn test_monotonic_in_strength() {
        let m = model();
        let mut last = 0;
        for s in -8..=m.max_rssi {
            let r = m.rssi2range(s);
            assert!(r >= last, "range table must be non-decreasing");
            last = r;
        }
    }

    #[test]
    fn test_validity_windows() {
        let m = model();
        assert!(m.valid_rssi(m.max_rssi));
        assert!(!m.valid_rssi(m.max_rssi + 1));
        assert!(m.valid_rssi1(m.rssi_thresh1));
        assert!(!m.valid_rssi2(m.rssi_thresh2 + 1));
        assert_eq!(m.strength_from_dbm(-67), 67);
        assert_eq!(m.strength_from_dbm(3), 3);
    }
}
