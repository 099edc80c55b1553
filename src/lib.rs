//! Real-time indoor/outdoor localization engine for UWB/BLE/IMU tags.
//!
//! Fixed anchors range tags over UWB two-way ranging, BLE beacons
//! contribute RSSI-derived distances, and an inertial stream provides
//! dead-reckoning between fixes. One [`pipeline::FusionPipeline`] per tag
//! fuses all of it into a 2D position stream annotated with a building
//! layer.
//!
//! The surrounding I/O (packet demux, deployment parsing, broadcast) lives
//! outside this crate; it feeds measurement batches in and consumes
//! [`types::FusionResult`] out.

pub mod config;
pub mod constants;
pub mod dim_constraint;
pub mod filters;
pub mod layer_manager;
pub mod linalg;
pub mod models;
pub mod pipeline;
pub mod rssi;
pub mod types;

pub use config::{EngineConfig, WorldModel};
pub use pipeline::FusionPipeline;
pub use types::{BleMeasurement, FusionResult, ImuSample, TwrMeasurement};
