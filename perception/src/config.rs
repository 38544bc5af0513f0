//! Runtime configuration for every pipeline stage.
//!
//! Mirrors the "Configuration keys" table of the control surface: each
//! recognized key patches exactly one field of [`PerceptionParams`].
//! `apply_patch` validates the whole patch up front so a rejected patch
//! never leaves the configuration partially applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackgroundParams {
    pub noise_relative: f64,
    pub closeness_multiplier: f64,
    pub neighbor_confirmation_count: u32,
    pub neighbor_half_width: usize,
    pub safety_margin_meters: f64,
    pub background_update_fraction: f64,
    pub post_settle_update_fraction: f64,
    pub warmup_duration_nanos: i64,
    pub warmup_min_frames: u32,
    pub min_settlement_points: u32,
    pub freeze_window_nanos: i64,
    pub outlier_confirmation_count: u32,
    pub rings: usize,
    pub azimuth_bins: usize,
    pub max_regions: usize,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            noise_relative: 0.02,
            closeness_multiplier: 1.0,
            neighbor_confirmation_count: 3,
            neighbor_half_width: 2,
            safety_margin_meters: 0.05,
            background_update_fraction: 0.05,
            post_settle_update_fraction: 0.01,
            warmup_duration_nanos: 30_000_000_000,
            warmup_min_frames: 100,
            min_settlement_points: 20,
            freeze_window_nanos: 2_000_000_000,
            outlier_confirmation_count: 5,
            rings: 40,
            azimuth_bins: 1800,
            max_regions: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterParams {
    pub height_band_floor: f64,
    pub height_band_ceiling: f64,
    pub voxel_xy: Option<f64>,
    pub voxel_z: Option<f64>,
    pub foreground_dbscan_eps: f64,
    pub foreground_min_cluster_points: usize,
    pub max_cluster_diameter: f64,
    pub min_cluster_diameter: f64,
    pub max_aspect_ratio: f64,
    pub min_short_axis_for_aspect_filter: f64,
    pub min_points_for_pca: usize,
    pub heading_lock_ratio: f64,
    pub heading_smoothing_alpha: f64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            height_band_floor: -2.8,
            height_band_ceiling: 1.5,
            voxel_xy: None,
            voxel_z: None,
            foreground_dbscan_eps: 0.6,
            foreground_min_cluster_points: 12,
            max_cluster_diameter: 12.0,
            min_cluster_diameter: 0.05,
            max_aspect_ratio: 15.0,
            min_short_axis_for_aspect_filter: 0.03,
            min_points_for_pca: 4,
            heading_lock_ratio: 0.25,
            heading_smoothing_alpha: 0.08,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerParams {
    pub gating_distance_squared: f64,
    pub process_noise_pos: f64,
    pub process_noise_vel: f64,
    pub measurement_noise: f64,
    pub occlusion_cov_inflation: f64,
    pub hits_to_confirm: u32,
    pub max_misses: u32,
    pub max_misses_confirmed: u32,
    pub max_tracks: usize,
    pub max_predict_dt: f64,
    pub max_covariance_diag: f64,
    pub max_reasonable_speed: f64,
    pub initial_position_std_meters: f64,
    pub initial_vel_std_meters_per_sec: f64,
    pub merge_area_ratio: f64,
    pub split_area_ratio: f64,
    pub speed_history_len: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            gating_distance_squared: 25.0,
            process_noise_pos: 0.05,
            process_noise_vel: 0.5,
            measurement_noise: 0.1,
            occlusion_cov_inflation: 1.0,
            hits_to_confirm: 3,
            max_misses: 5,
            max_misses_confirmed: 15,
            max_tracks: 256,
            max_predict_dt: 0.5,
            max_covariance_diag: 100.0,
            max_reasonable_speed: 30.0,
            initial_position_std_meters: 1.0,
            initial_vel_std_meters_per_sec: 5.0,
            merge_area_ratio: 2.5,
            split_area_ratio: 0.3,
            speed_history_len: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierParams {
    pub min_observations_for_classify: u32,
    pub bird_max_height: f64,
    pub bird_max_speed: f64,
    pub car_min_height: f64,
    pub car_min_length: f64,
    pub car_min_speed: f64,
    pub pedestrian_min_height: f64,
    pub pedestrian_max_height: f64,
    pub pedestrian_max_speed: f64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            min_observations_for_classify: 10,
            bird_max_height: 0.5,
            bird_max_speed: 1.0,
            car_min_height: 1.2,
            car_min_length: 3.0,
            car_min_speed: 5.0,
            pedestrian_min_height: 1.0,
            pedestrian_max_height: 2.0,
            pedestrian_max_speed: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineParams {
    pub target_hz: f64,
    pub min_frame_points: usize,
    pub buffer_timeout_nanos: i64,
    pub frame_channel_capacity: usize,
    pub persist_batch_timeout_ms: u64,
    pub prune_interval_secs: u64,
    pub deleted_track_ttl_secs: u64,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            target_hz: 10.0,
            min_frame_points: 1,
            buffer_timeout_nanos: 500_000_000,
            frame_channel_capacity: 8,
            persist_batch_timeout_ms: 2_000,
            prune_interval_secs: 60,
            deleted_track_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PerceptionParams {
    pub background: BackgroundParams,
    pub cluster: ClusterParams,
    pub tracker: TrackerParams,
    pub classifier: ClassifierParams,
    pub pipeline: PipelineParams,
}

/// Recognized configuration keys and the field they patch. Adding a key here
/// without a matching arm in `apply_patch` is a compile-time-invisible bug,
/// so both are kept next to each other.
const RECOGNIZED_KEYS: &[&str] = &[
    "noise_relative",
    "closeness_multiplier",
    "neighbor_confirmation_count",
    "safety_margin_meters",
    "background_update_fraction",
    "post_settle_update_fraction",
    "warmup_duration_nanos",
    "warmup_min_frames",
    "foreground_dbscan_eps",
    "foreground_min_cluster_points",
    "min_frame_points",
    "gating_distance_squared",
    "process_noise_pos",
    "process_noise_vel",
    "measurement_noise",
    "occlusion_cov_inflation",
    "hits_to_confirm",
    "max_misses",
    "max_misses_confirmed",
    "max_tracks",
    "height_band_floor",
    "height_band_ceiling",
];

impl PerceptionParams {
    /// Loads startup defaults from a TOML document, the on-disk format for
    /// every stage's parameters.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Serializes the current configuration back to TOML, e.g. to persist a
    /// patched configuration as the new on-disk default.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Applies a patch of recognized keys atomically: either every key in
    /// `patch` is known and gets applied, or nothing changes and the
    /// unsupported keys are reported.
    pub fn apply_patch(&mut self, patch: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        let unsupported: Vec<String> = patch
            .keys()
            .filter(|k| !RECOGNIZED_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unsupported.is_empty() {
            return Err(Error::UnsupportedConfigKeys(unsupported));
        }

        let mut next = self.clone();
        for (key, value) in patch {
            apply_one(&mut next, key, value)?;
        }
        *self = next;
        Ok(())
    }
}

fn as_f64(v: &serde_json::Value) -> Option<f64> {
    v.as_f64()
}

fn as_u32(v: &serde_json::Value) -> Option<u32> {
    v.as_u64().map(|x| x as u32)
}

fn as_usize(v: &serde_json::Value) -> Option<usize> {
    v.as_u64().map(|x| x as usize)
}

fn apply_one(p: &mut PerceptionParams, key: &str, value: &serde_json::Value) -> Result<()> {
    macro_rules! set {
        ($field:expr, $conv:expr) => {
            if let Some(v) = $conv(value) {
                $field = v;
            } else {
                return Err(Error::UnsupportedConfigKeys(vec![format!(
                    "{} (bad type)",
                    key
                )]));
            }
        };
    }
    match key {
        "noise_relative" => set!(p.background.noise_relative, as_f64),
        "closeness_multiplier" => set!(p.background.closeness_multiplier, as_f64),
        "neighbor_confirmation_count" => {
            set!(p.background.neighbor_confirmation_count, as_u32)
        }
        "safety_margin_meters" => set!(p.background.safety_margin_meters, as_f64),
        "background_update_fraction" => {
            set!(p.background.background_update_fraction, as_f64)
        }
        "post_settle_update_fraction" => {
            set!(p.background.post_settle_update_fraction, as_f64)
        }
        "warmup_duration_nanos" => {
            if let Some(v) = value.as_i64() {
                p.background.warmup_duration_nanos = v;
            } else {
                return Err(Error::UnsupportedConfigKeys(vec![key.to_string()]));
            }
        }
        "warmup_min_frames" => set!(p.background.warmup_min_frames, as_u32),
        "foreground_dbscan_eps" => set!(p.cluster.foreground_dbscan_eps, as_f64),
        "foreground_min_cluster_points" => {
            set!(p.cluster.foreground_min_cluster_points, as_usize)
        }
        "min_frame_points" => set!(p.pipeline.min_frame_points, as_usize),
        "gating_distance_squared" => set!(p.tracker.gating_distance_squared, as_f64),
        "process_noise_pos" => set!(p.tracker.process_noise_pos, as_f64),
        "process_noise_vel" => set!(p.tracker.process_noise_vel, as_f64),
        "measurement_noise" => set!(p.tracker.measurement_noise, as_f64),
        "occlusion_cov_inflation" => set!(p.tracker.occlusion_cov_inflation, as_f64),
        "hits_to_confirm" => set!(p.tracker.hits_to_confirm, as_u32),
        "max_misses" => set!(p.tracker.max_misses, as_u32),
        "max_misses_confirmed" => set!(p.tracker.max_misses_confirmed, as_u32),
        "max_tracks" => set!(p.tracker.max_tracks, as_usize),
        "height_band_floor" => set!(p.cluster.height_band_floor, as_f64),
        "height_band_ceiling" => set!(p.cluster.height_band_ceiling, as_f64),
        other => return Err(Error::UnsupportedConfigKeys(vec![other.to_string()])),
    }
    Ok(())
}
