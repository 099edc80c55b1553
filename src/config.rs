//! Engine configuration: the static world description the engine consumes.
//!
//! The upstream deployment parser (external to this crate) flattens its
//! project files into this serde-friendly form. Loading accepts plain or
//! gzip-compressed JSON.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layer_manager::{Layer, LayerManager};
use crate::rssi::BleRssi;
use crate::types::{Anchor, DimMat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// RSSI model parameters from the deployment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RssiConfig {
    pub factor: f64,
    pub adjust: f64,
    pub deployment_interval_cm: i32,
}

impl Default for RssiConfig {
    fn default() -> Self {
        RssiConfig { factor: 3.0, adjust: 8.0, deployment_interval_cm: 1000 }
    }
}

/// World position box the dead-reckoning path clamps against, in meters.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct WorldBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Default for WorldBounds {
    fn default() -> Self {
        WorldBounds { min_x: -10_000.0, max_x: 10_000.0, min_y: -10_000.0, max_y: 10_000.0 }
    }
}

/// Corridors and layer assignment attached to one beacon.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BeaconDimConfig {
    pub beacon_id: u32,
    #[serde(default)]
    pub layer: i32,
    #[serde(default)]
    pub dims: Vec<DimMat>,
}

/// Layer-wide corridors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerDimConfig {
    pub layer: i32,
    pub dims: Vec<DimMat>,
}

/// Everything the engine needs to serve one deployment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub rssi: Option<RssiConfig>,
    #[serde(default)]
    pub anchors: Vec<Anchor>,
    #[serde(default)]
    pub beacons: Vec<Anchor>,
    #[serde(default)]
    pub layers: Vec<Layer>,
    #[serde(default)]
    pub beacon_dims: Vec<BeaconDimConfig>,
    #[serde(default)]
    pub layer_dims: Vec<LayerDimConfig>,
    #[serde(default)]
    pub world_bounds: Option<WorldBounds>,
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        if path.extension().map(|e| e == "gz").unwrap_or(false) {
            let gz = GzDecoder::new(file);
            Ok(serde_json::from_reader(BufReader::new(gz))?)
        } else {
            Ok(serde_json::from_reader(BufReader::new(file))?)
        }
    }

    /// Resolve the raw tables into the runtime world model.
    pub fn build(&self) -> WorldModel {
        let mut anchors: HashMap<u32, Anchor> = HashMap::new();
        for a in self.anchors.iter().chain(self.beacons.iter()) {
            anchors.insert(a.id, *a);
        }

        let mut beacon_layer = HashMap::new();
        let mut beacon_dims = HashMap::new();
        for bd in &self.beacon_dims {
            if bd.layer != 0 {
                beacon_layer.insert(bd.beacon_id, bd.layer);
            }
            if !bd.dims.is_empty() {
                beacon_dims.insert(bd.beacon_id, bd.dims.clone());
            }
        }

        let mut dim_map: HashMap<i32, Vec<DimMat>> = HashMap::new();
        for ld in &self.layer_dims {
            dim_map.entry(ld.layer).or_default().extend(ld.dims.iter().copied());
        }

        let layer_manager = if self.layers.is_empty() && anchors.is_empty() {
            None
        } else {
            let layers: HashMap<i32, Layer> =
                self.layers.iter().map(|l| (l.id, l.clone())).collect();
            Some(LayerManager::from_layers(layers, &anchors))
        };

        let rssi_cfg = self.rssi.unwrap_or_default();
        WorldModel {
            anchors,
            rssi: BleRssi::new(rssi_cfg.factor, rssi_cfg.adjust, rssi_cfg.deployment_interval_cm),
            dim_map,
            beacon_layer,
            beacon_dims,
            layer_manager,
            bounds: self.world_bounds.unwrap_or_default(),
        }
    }
}

/// Resolved runtime tables. One pipeline consumes one of these; tags running
/// in parallel each get their own clone so nothing is shared mutably.
#[derive(Clone, Debug)]
pub struct WorldModel {
    pub anchors: HashMap<u32, Anchor>,
    pub rssi: BleRssi,
    pub dim_map: HashMap<i32, Vec<DimMat>>,
    pub beacon_layer: HashMap<u32, i32>,
    pub beacon_dims: HashMap<u32, Vec<DimMat>>,
    pub layer_manager: Option<LayerManager>,
    pub bounds: WorldBounds,
}

impl WorldModel {
    /// Bare world for embedders that wire tables up themselves.
    pub fn with_anchors(anchors: HashMap<u32, Anchor>, rssi: BleRssi) -> Self {
        WorldModel {
            anchors,
            rssi,
            dim_map: HashMap::new(),
            beacon_layer: HashMap::new(),
            beacon_dims: HashMap::new(),
            layer_manager: None,
            bounds: WorldBounds::default(),
        }
    }
}
