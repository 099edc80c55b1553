//! Layer (floor/zone) selection from measurement geometry.
//!
//! Layer and project rectangles are stored in centimeters, matching the
//! deployment drawings they come from; positions arrive in meters and are
//! scaled at the comparison sites.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants::OUTDOOR_LAYER;
use crate::rssi::BleRssi;
use crate::types::{Anchor, BleMeasurement, TwrMeasurement};

/// Axis-aligned region bounding box in cm.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Region {
    pub x_tl: f64,
    pub y_tl: f64,
    pub x_br: f64,
    pub y_br: f64,
}

/// One floor or zone with its extent and walkable regions, all in cm.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Layer {
    pub id: i32,
    #[serde(default)]
    pub building: i32,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub x_tl: f64,
    #[serde(default)]
    pub y_tl: f64,
    #[serde(default)]
    pub x_br: f64,
    #[serde(default)]
    pub y_br: f64,
    #[serde(default)]
    pub regions: Vec<Region>,
}

impl Layer {
    pub fn new(id: i32) -> Self {
        Layer {
            id,
            building: 0,
            width: 0.0,
            height: 0.0,
            x_tl: 0.0,
            y_tl: 0.0,
            x_br: 0.0,
            y_br: 0.0,
            regions: Vec::new(),
        }
    }
}

/// A building: the enclosing box of its member layers, in cm.
#[derive(Clone, Debug)]
pub struct Project {
    pub id: i32,
    pub building: i32,
    pub x_tl: f64,
    pub y_tl: f64,
    pub x_br: f64,
    pub y_br: f64,
    pub member_layers: Vec<i32>,
}

#[derive(Clone, Debug)]
pub struct LayerManager {
    layers: HashMap<i32, Layer>,
    projects: Vec<Project>,
    layer_project: HashMap<i32, usize>,
}

fn is_in_project(pos: [f64; 3], proj: &Project) -> bool {
    let x = pos[0] * 100.0;
    let y = pos[1] * 100.0;
    x >= proj.x_tl && x <= proj.x_br && y >= proj.y_tl && y <= proj.y_br
}

fn is_in_layer(pos: [f64; 3], layer: &Layer) -> bool {
    let x = pos[0] * 100.0;
    let y = pos[1] * 100.0;
    if !(x >= layer.x_tl && x <= layer.x_br && y >= layer.y_tl && y <= layer.y_br) {
        return false;
    }
    layer
        .regions
        .iter()
        .any(|r| x >= r.x_tl && x <= r.x_br && y >= r.y_tl && y <= r.y_br)
}

/// Widen layer extents with the positions of the anchors mounted on them.
fn fill_from_anchors(layers: &mut HashMap<i32, Layer>, anchors: &HashMap<u32, Anchor>) {
    let mut by_layer: HashMap<i32, Vec<&Anchor>> = HashMap::new();
    for a in anchors.values() {
        by_layer.entry(a.layer).or_default().push(a);
    }
    for (lid, mut list) in by_layer {
        list.sort_by_key(|a| a.id);
        let layer = layers.entry(lid).or_insert_with(|| Layer::new(lid));
        if layer.building == 0 {
            layer.building = list[0].building;
        }
        let xs: Vec<f64> = list.iter().map(|a| a.x * 100.0).collect();
        let ys: Vec<f64> = list.iter().map(|a| a.y * 100.0).collect();
        let (min_x, max_x) = bounds(&xs);
        let (min_y, max_y) = bounds(&ys);
        if layer.width == 0.0 || layer.height == 0.0 {
            layer.x_tl = min_x;
            layer.y_tl = min_y;
            layer.x_br = max_x;
            layer.y_br = max_y;
        } else {
            layer.x_tl = layer.x_tl.min(min_x);
            layer.y_tl = layer.y_tl.min(min_y);
            layer.x_br = layer.x_br.max(max_x);
            layer.y_br = layer.y_br.max(max_y);
        }
        layer.width = (layer.x_br - layer.x_tl).max(layer.width);
        layer.height = (layer.y_br - layer.y_tl).max(layer.height);
    }
}

fn bounds(vals: &[f64]) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in vals {
        min = min.min(v);
        max = max.max(v);
    }
    if vals.is_empty() {
        (0.0, 0.0)
    } else {
        (min, max)
    }
}

/// Layers without any configured region get their full extent as one region.
fn ensure_regions(layers: &mut HashMap<i32, Layer>) {
    for layer in layers.values_mut() {
        if layer.width == 0.0 || layer.height == 0.0 {
            continue;
        }
        if layer.regions.is_empty() {
            layer.regions.push(Region {
                x_tl: layer.x_tl,
                y_tl: layer.y_tl,
                x_br: layer.x_br,
                y_br: layer.y_br,
            });
        }
    }
}

/// Group layers into per-building projects with enclosing boxes.
fn build_projects(layers: &HashMap<i32, Layer>) -> (Vec<Project>, HashMap<i32, usize>) {
    let mut by_building: HashMap<i32, Vec<&Layer>> = HashMap::new();
    for layer in layers.values() {
        by_building.entry(layer.building).or_default().push(layer);
    }
    let mut buildings: Vec<i32> = by_building.keys().copied().collect();
    buildings.sort_unstable();

    let mut projects = Vec::new();
    let mut layer_project = HashMap::new();
    for building in buildings {
        let list = &by_building[&building];
        if list.is_empty() {
            continue;
        }
        let idx = projects.len();
        let mut proj = Project {
            id: idx as i32 + 1,
            building,
            x_tl: f64::INFINITY,
            y_tl: f64::INFINITY,
            x_br: f64::NEG_INFINITY,
            y_br: f64::NEG_INFINITY,
            member_layers: Vec::new(),
        };
        for layer in list {
            proj.x_tl = proj.x_tl.min(layer.x_tl);
            proj.y_tl = proj.y_tl.min(layer.y_tl);
            proj.x_br = proj.x_br.max(layer.x_br);
            proj.y_br = proj.y_br.max(layer.y_br);
            proj.member_layers.push(layer.id);
            layer_project.insert(layer.id, idx);
        }
        proj.member_layers.sort_unstable();
        projects.push(proj);
    }
    (projects, layer_project)
}

/// Agreement between measured and geometric distances for anchors of one
/// layer: `|1 - mean(measured / geometric)|`, or 0xFF when no anchor of the
/// layer was measured.
fn layer_trust_rate(
    ble_meas: &[BleMeasurement],
    twr_meas: &[TwrMeasurement],
    pos: [f64; 3],
    layer_id: i32,
    rssi: &BleRssi,
    anchors: &HashMap<u32, Anchor>,
) -> f64 {
    if ble_meas.is_empty() && twr_meas.is_empty() {
        return 255.0;
    }
    let cm_x = pos[0] * 100.0;
    let cm_y = pos[1] * 100.0;
    let mut n = 0usize;
    let mut rates = 0.0;
    for m in twr_meas {
        let a = match anchors.get(&m.anchor_id) {
            Some(a) if a.layer == layer_id => a,
            _ => continue,
        };
        let distance = (cm_x - a.x * 100.0).hypot(cm_y - a.y * 100.0);
        if distance < 1e-3 {
            continue;
        }
        rates += m.range_m * 100.0 / distance;
        n += 1;
    }
    for m in ble_meas {
        let a = match anchors.get(&m.anchor_id) {
            Some(a) if a.layer == layer_id => a,
            _ => continue,
        };
        let distance = (cm_x - a.x * 100.0).hypot(cm_y - a.y * 100.0);
        if distance < 1e-3 {
            continue;
        }
        let strength = rssi.strength_from_dbm(m.rssi_dbm);
        let est_m = 0.01 * f64::from(rssi.rssi2range(strength));
        rates += 100.0 * est_m / distance;
        n += 1;
    }
    if n > 0 {
        (1.0 - rates / n as f64).abs()
    } else {
        255.0
    }
}

impl LayerManager {
    pub fn new(layers: HashMap<i32, Layer>, projects: Vec<Project>) -> Self {
        let mut layer_project = HashMap::new();
        for (idx, proj) in projects.iter().enumerate() {
            for lid in &proj.member_layers {
                layer_project.insert(*lid, idx);
            }
        }
        LayerManager { layers, projects, layer_project }
    }

    /// Build from configured layer tables plus the anchor table: anchors
    /// widen layer extents, missing regions default to the full extent, and
    /// buildings become projects.
    pub fn from_layers(
        mut layers: HashMap<i32, Layer>,
        anchors: &HashMap<u32, Anchor>,
    ) -> Self {
        fill_from_anchors(&mut layers, anchors);
        ensure_regions(&mut layers);
        let (projects, layer_project) = build_projects(&layers);
        LayerManager { layers, projects, layer_project }
    }

    pub fn layer(&self, id: i32) -> Option<&Layer> {
        self.layers.get(&id)
    }

    /// Choose the layer for a position given the measurements that produced
    /// it. None means indeterminate.
    pub fn get_layer(
        &self,
        ble_meas: &[BleMeasurement],
        twr_meas: &[TwrMeasurement],
        pos: [f64; 3],
        rssi: &BleRssi,
        anchors: &HashMap<u32, Anchor>,
    ) -> Option<i32> {
        let mut layer_list: Vec<i32> = Vec::new();
        let mut outdoor = false;
        for id in ble_meas
            .iter()
            .map(|m| m.anchor_id)
            .chain(twr_meas.iter().map(|m| m.anchor_id))
        {
            let a = match anchors.get(&id) {
                Some(a) => a,
                None => continue,
            };
            if a.layer == OUTDOOR_LAYER {
                outdoor = true;
            }
            if !layer_list.contains(&a.layer) {
                layer_list.push(a.layer);
            }
        }
        if layer_list.is_empty() {
            return None;
        }

        let mut pro_list: Vec<usize> = Vec::new();
        for lid in &layer_list {
            if *lid == OUTDOOR_LAYER {
                continue;
            }
            let idx = match self.layer_project.get(lid) {
                Some(idx) => *idx,
                None => continue,
            };
            if is_in_project(pos, &self.projects[idx]) && !pro_list.contains(&idx) {
                pro_list.push(idx);
            }
        }

        if pro_list.is_empty() {
            return if outdoor { Some(OUTDOOR_LAYER) } else { None };
        }
        if pro_list.len() > 1 {
            return None;
        }

        let proj = &self.projects[pro_list[0]];
        let candidates: Vec<&Layer> = proj
            .member_layers
            .iter()
            .filter_map(|lid| self.layers.get(lid))
            .filter(|layer| is_in_layer(pos, layer))
            .collect();

        if candidates.is_empty() {
            return Some(OUTDOOR_LAYER);
        }
        if candidates.len() == 1 {
            return Some(candidates[0].id);
        }

        let mut best: Option<i32> = None;
        let mut best_rate = 255.0;
        for layer in candidates {
            let rate = layer_trust_rate(ble_meas, twr_meas, pos, layer.id, rssi, anchors);
            if rate < best_rate {
                best = Some(layer.id);
                best_rate = rate;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchor(id: u32, x: f64, y: f64, layer: i32, building: i32) -> Anchor {
        Anchor { id, x, y, z: 0.0, layer, building }
    }

    fn world_two_layers() -> (LayerManager, HashMap<u32, Anchor>, BleRssi) {
        let mut anchors = HashMap::new();
        anchors.insert(10, anchor(10, 0.0, 0.0, 2, 1));
        anchors.insert(11, anchor(11, 10.0, 8.0, 2, 1));
        anchors.insert(20, anchor(20, 20.0, 0.0, 3, 1));
        let lm = LayerManager::from_layers(HashMap::new(), &anchors);
        (lm, anchors, BleRssi::new(3.0, 8.0, 1000))
    }

    #[test]
    fn test_from_layers_builds_extents_and_projects() {
        let (lm, _, _) = world_two_layers();
        let layer = lm.layer(2).expect("layer 2 exists");
        assert_eq!(layer.x_tl, 0.0);
        assert_eq!(layer.x_br, 1000.0);
        assert_eq!(layer.y_br, 800.0);
        assert_eq!(layer.regions.len(), 1);
        assert_eq!(lm.projects.len(), 1);
        assert_eq!(lm.projects[0].member_layers, vec![2, 3]);
    }

    #[test]
    fn test_no_known_anchor_is_indeterminate() {
        let (lm, anchors, rssi) = world_two_layers();
        let twr = [TwrMeasurement { anchor_id: 999, range_m: 5.0 }];
        assert_eq!(lm.get_layer(&[], &twr, [5.0, 0.0, 0.0], &rssi, &anchors), None);
    }

    #[test]
    fn test_single_layer_wins_inside_its_box() {
        let (lm, anchors, rssi) = world_two_layers();
        let twr = [
            TwrMeasurement { anchor_id: 10, range_m: 5.0 },
            TwrMeasurement { anchor_id: 11, range_m: 5.0 },
        ];
        // (5, 0.5) lies inside layer 2's anchor-derived extent but outside
        // layer 3's (single anchor, zero-size box).
        let got = lm.get_layer(&[], &twr, [5.0, 0.5, 0.0], &rssi, &anchors);
        assert_eq!(got, Some(2));
    }

    #[test]
    fn test_outdoor_fallback_when_no_project_matches() {
        let mut anchors = HashMap::new();
        anchors.insert(1, anchor(1, 0.0, 0.0, OUTDOOR_LAYER, 0));
        anchors.insert(2, anchor(2, 50.0, 0.0, 4, 1));
        let lm = LayerManager::from_layers(HashMap::new(), &anchors);
        let rssi = BleRssi::new(3.0, 8.0, 1000);
        let twr = [
            TwrMeasurement { anchor_id: 1, range_m: 3.0 },
            TwrMeasurement { anchor_id: 2, range_m: 3.0 },
        ];
        // Far from layer 4's box; the outdoor anchor was observed.
        let got = lm.get_layer(&[], &twr, [-100.0, -100.0, 0.0], &rssi, &anchors);
        assert_eq!(got, Some(OUTDOOR_LAYER));
    }

    #[test]
    fn test_trust_rate_tiebreak_prefers_consistent_layer() {
        let mut layers = HashMap::new();
        let mut l2 = Layer::new(2);
        l2.building = 1;
        l2.x_tl = 0.0;
        l2.y_tl = -500.0;
        l2.x_br = 3000.0;
        l2.y_br = 500.0;
        l2.width = 3000.0;
        l2.height = 1000.0;
        let mut l3 = l2.clone();
        l3.id = 3;
        layers.insert(2, l2);
        layers.insert(3, l3);

        let mut anchors = HashMap::new();
        anchors.insert(10, anchor(10, 0.0, 0.0, 2, 1));
        anchors.insert(20, anchor(20, 20.0, 0.0, 3, 1));
        let lm = LayerManager::from_layers(layers, &anchors);
        let rssi = BleRssi::new(3.0, 8.0, 1000);

        // Tag truly at (5, 0): range to the layer-2 anchor agrees with the
        // geometry, the layer-3 range does not.
        let twr = [
            TwrMeasurement { anchor_id: 10, range_m: 5.0 },
            TwrMeasurement { anchor_id: 20, range_m: 5.0 },
        ];
        let got = lm.get_layer(&[], &twr, [5.0, 0.0, 0.0], &rssi, &anchors);
        assert_eq!(got, Some(2));
    }

    #[test]
    fn test_ambiguous_projects_yield_none() {
        let mut anchors = HashMap::new();
        // Two buildings whose derived boxes both contain the position.
        anchors.insert(10, anchor(10, 0.0, 0.0, 2, 1));
        anchors.insert(11, anchor(11, 10.0, 10.0, 2, 1));
        anchors.insert(20, anchor(20, 0.0, 0.0, 3, 2));
        anchors.insert(21, anchor(21, 10.0, 10.0, 3, 2));
        let lm = LayerManager::from_layers(HashMap::new(), &anchors);
        let rssi = BleRssi::new(3.0, 8.0, 1000);
        let twr = [
            TwrMeasurement { anchor_id: 10, range_m: 5.0 },
            TwrMeasurement { anchor_id: 20, range_m: 5.0 },
        ];
        assert_eq!(lm.get_layer(&[], &twr, [5.0, 5.0, 0.0], &rssi, &anchors), None);
    }
}
