//! Core data model shared across pipeline stages. See module docs on each
//! stage for the operations that read and write these types.

use serde::{Deserialize, Serialize};

/// A single Hesai return in the sensor's native polar frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolarPoint {
    pub ring_index: u16,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    pub distance_m: f64,
    pub intensity: u8,
    pub timestamp_ns: i64,
}

impl PolarPoint {
    pub fn is_valid(&self, num_rings: usize) -> bool {
        self.distance_m > 0.0 && (self.ring_index as usize) < num_rings && self.distance_m.is_finite()
    }
}

/// A point after spherical-to-Cartesian conversion, in the sensor/world
/// frame (identity pose unless a transform was supplied upstream).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CartesianPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub intensity: u8,
    pub timestamp_ns: i64,
    pub sensor_id: u16,
}

/// One complete 360-degree revolution of polar points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: u64,
    pub wall_clock_ns: i64,
    pub points: Vec<PolarPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarianceClass {
    Stable,
    Variable,
    Volatile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaledRegionParams {
    pub closeness_multiplier: f64,
    pub noise_relative_fraction: f64,
    pub neighbor_confirmation_count: u32,
    pub safety_margin_meters: f64,
    pub update_alpha: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub region_id: u32,
    pub member_cell_indices: Vec<usize>,
    pub variance_class: VarianceClass,
    pub scaled_parameters: ScaledRegionParams,
}

/// Oriented bounding box fit via 2D PCA over a cluster's (x, y) points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Obb {
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub heading_rad: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: (f64, f64, f64),
    pub max: (f64, f64, f64),
}

impl Aabb {
    pub fn extents(&self) -> (f64, f64, f64) {
        (
            self.max.0 - self.min.0,
            self.max.1 - self.min.1,
            self.max.2 - self.min.2,
        )
    }
}

/// Ephemeral per-frame cluster output of the L4 clustering stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub centroid: (f64, f64, f64),
    pub aabb: Aabb,
    pub obb: Obb,
    pub point_count: usize,
    pub height_p95: f64,
    pub intensity_mean: f64,
    pub first_ts_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    Tentative,
    Confirmed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectClass {
    Unknown,
    Bird,
    Car,
    Pedestrian,
    Other,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Unknown => "unknown",
            ObjectClass::Bird => "bird",
            ObjectClass::Car => "car",
            ObjectClass::Pedestrian => "pedestrian",
            ObjectClass::Other => "other",
        }
    }
}

/// Per-frame observation persisted only when the track actually matched a
/// cluster that frame (`misses == 0`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackObservation {
    pub track_id: uuid::Uuid,
    pub ts_ns: i64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub vx: f64,
    pub vy: f64,
    pub speed_mps: f64,
    pub heading_rad: f64,
    pub obb: Obb,
    pub height_p95: f64,
    pub intensity_mean: f64,
}

/// The feature subset the classifier reads from a confirmed track snapshot.
/// Deliberately narrower than [`TrackSummary`]: the classifier has no
/// business seeing Kalman internals or identity fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierFeatures {
    pub bbox_length_avg: f64,
    pub bbox_width_avg: f64,
    pub bbox_height_avg: f64,
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
    pub observation_count: u64,
}

/// A persisted, queryable summary of a track; the network-agnostic subset
/// of the live `Track` that gets written to the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSummary {
    pub track_id: uuid::Uuid,
    pub sensor_id: u16,
    pub state: TrackState,
    pub first_seen_ns: i64,
    pub last_updated_ns: i64,
    pub observation_count: u64,
    pub avg_speed_mps: f64,
    pub peak_speed_mps: f64,
    pub p50_speed_mps: f64,
    pub p85_speed_mps: f64,
    pub p95_speed_mps: f64,
    pub obb_length_avg: f64,
    pub obb_width_avg: f64,
    pub obb_height_avg: f64,
    pub object_class: ObjectClass,
    pub object_confidence: f64,
}

/// Deep-copied, per-frame snapshot handed to publish subscribers. Never a
/// live reference into grid or tracker state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameArtifacts {
    pub sensor_id: u16,
    pub frame_id: u64,
    pub wall_clock_ns: i64,
    pub clusters: Vec<Cluster>,
    pub confirmed_tracks: Vec<TrackSummary>,
    pub foreground_mask: Vec<bool>,
}

/// Published whenever `grid_reset` runs, so subscribers can discard any
/// cached assumptions about background/track continuity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResetEvent {
    pub sensor_id: u16,
    pub ts_ns: i64,
}
