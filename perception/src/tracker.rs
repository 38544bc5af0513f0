//! L5: per-track Kalman constant-velocity filter, Mahalanobis gating,
//! Jonker-Volgenant linear assignment (the same cost-matrix problem "the
//! Hungarian algorithm" solves), and the Tentative/Confirmed/Deleted
//! lifecycle.

use std::collections::VecDeque;

use nalgebra::{Matrix2, Matrix4, Vector2, Vector4};
use ndarray::Array2;
use tracing::{debug, warn};
use uuid::Uuid;

use adskalman::{CovarianceUpdateMethod, ObservationModel as _, StateAndCovariance, TransitionModelLinearNoControl};
use tracking::{ConstantVelocity2DModel, ObservationModel2D};

use crate::config::{ClusterParams, TrackerParams};
use crate::types::{Cluster, Obb, ObjectClass, TrackObservation, TrackState, TrackSummary};

const LARGE_COST: f64 = 1.0e9;

struct RunningAverage {
    mean: f64,
    count: u64,
}

impl RunningAverage {
    fn new() -> Self {
        Self { mean: 0.0, count: 0 }
    }

    fn push(&mut self, sample: f64) {
        self.count += 1;
        self.mean += (sample - self.mean) / self.count as f64;
    }
}

pub struct Track {
    pub id: Uuid,
    pub sensor_id: u16,
    pub state: TrackState,
    estimate: StateAndCovariance<f64, nalgebra::U4>,
    pub hits: u32,
    pub misses: u32,
    pub observation_count: u64,
    pub first_seen_ns: i64,
    pub last_updated_ns: i64,
    speed_sum: f64,
    peak_speed: f64,
    speed_history: VecDeque<f64>,
    history_cap: usize,
    obb_length_avg: RunningAverage,
    obb_width_avg: RunningAverage,
    obb_height_avg: RunningAverage,
    last_obb: Obb,
    last_heading: Option<f64>,
    pub merge_candidate: bool,
    pub split_candidate: bool,
    pub object_class: ObjectClass,
    pub object_confidence: f64,
    deleted_at_ns: Option<i64>,
}

impl Track {
    fn spawn(id: Uuid, sensor_id: u16, cluster: &Cluster, now_ns: i64, params: &TrackerParams) -> Self {
        let state = Vector4::new(cluster.centroid.0, cluster.centroid.1, 0.0, 0.0);
        let p0 = params.initial_position_std_meters.powi(2);
        let v0 = params.initial_vel_std_meters_per_sec.powi(2);
        #[rustfmt::skip]
        let covar = Matrix4::new(
            p0,  0.0, 0.0, 0.0,
            0.0, p0,  0.0, 0.0,
            0.0, 0.0, v0,  0.0,
            0.0, 0.0, 0.0, v0,
        );
        Self {
            id,
            sensor_id,
            state: TrackState::Tentative,
            estimate: StateAndCovariance::new(state, covar),
            hits: 1,
            misses: 0,
            observation_count: 0,
            first_seen_ns: now_ns,
            last_updated_ns: now_ns,
            speed_sum: 0.0,
            peak_speed: 0.0,
            speed_history: VecDeque::new(),
            history_cap: params.speed_history_len,
            obb_length_avg: RunningAverage::new(),
            obb_width_avg: RunningAverage::new(),
            obb_height_avg: RunningAverage::new(),
            last_obb: cluster.obb,
            last_heading: Some(cluster.obb.heading_rad),
            merge_candidate: false,
            split_candidate: false,
            object_class: ObjectClass::Unknown,
            object_confidence: 0.0,
            deleted_at_ns: None,
        }
    }

    fn position(&self) -> (f64, f64) {
        (self.estimate.state()[0], self.estimate.state()[1])
    }

    fn velocity(&self) -> (f64, f64) {
        (self.estimate.state()[2], self.estimate.state()[3])
    }

    fn predict(&mut self, dt_raw: f64, params: &TrackerParams) {
        let dt = dt_raw.min(params.max_predict_dt).max(0.0);
        let model = ConstantVelocity2DModel::new(params.process_noise_vel).calc_for_dt(dt);
        let predicted = model.predict(&self.estimate);

        let mut covar = *predicted.covariance();
        let pos_noise = params.process_noise_pos * params.occlusion_cov_inflation;
        covar[(0, 0)] += pos_noise;
        covar[(1, 1)] += pos_noise;
        for i in 0..4 {
            if covar[(i, i)] > params.max_covariance_diag {
                covar[(i, i)] = params.max_covariance_diag;
            }
        }

        let mut state = *predicted.state();
        let speed = (state[2].powi(2) + state[3].powi(2)).sqrt();
        if speed > params.max_reasonable_speed && speed > 0.0 {
            let scale = params.max_reasonable_speed / speed;
            state[2] *= scale;
            state[3] *= scale;
        }

        self.estimate = StateAndCovariance::new(state, covar);
        self.sanity_check(params);
    }

    fn gating_cost(&self, cluster: &Cluster, params: &TrackerParams) -> f64 {
        let r = Matrix2::identity() * params.measurement_noise;
        let obs_model = ObservationModel2D::new(r);
        let predicted_obs = obs_model.predict_observation(self.estimate.state());
        let innovation = Vector2::new(cluster.centroid.0, cluster.centroid.1) - predicted_obs;

        let p = self.estimate.covariance();
        let s = Matrix2::new(p[(0, 0)], p[(0, 1)], p[(1, 0)], p[(1, 1)]) + r;
        match s.try_inverse() {
            Some(s_inv) => (innovation.transpose() * s_inv * innovation)[(0, 0)],
            None => {
                warn!("innovation covariance is singular, treating gate cost as +inf");
                f64::INFINITY
            }
        }
    }

    fn apply_update(&mut self, cluster: &Cluster, now_ns: i64, params: &TrackerParams, cluster_params: &ClusterParams) {
        let r = Matrix2::identity() * params.measurement_noise;
        let obs_model = ObservationModel2D::new(r);
        let observation = Vector2::new(cluster.centroid.0, cluster.centroid.1);
        match obs_model.update(&self.estimate, &observation, CovarianceUpdateMethod::JosephForm) {
            Ok(posterior) => self.estimate = posterior,
            Err(_) => warn!("kalman update failed on singular innovation covariance, keeping prior"),
        }

        self.hits += 1;
        self.misses = 0;
        self.observation_count += 1;
        self.last_updated_ns = now_ns;

        if self.state == TrackState::Tentative && self.hits >= params.hits_to_confirm {
            self.state = TrackState::Confirmed;
        }

        let (vx, vy) = self.velocity();
        let speed = (vx * vx + vy * vy).sqrt();
        self.speed_sum += speed;
        self.peak_speed = self.peak_speed.max(speed);
        if self.speed_history.len() >= self.history_cap {
            self.speed_history.pop_front();
        }
        self.speed_history.push_back(speed);

        let prior_area = self.obb_length_avg.mean * self.obb_width_avg.mean;
        let cluster_area = cluster.obb.length * cluster.obb.width;
        if prior_area > 0.0 {
            let ratio = cluster_area / prior_area;
            self.merge_candidate = ratio > params.merge_area_ratio;
            self.split_candidate = ratio < params.split_area_ratio;
        }

        let heading = crate::cluster::stabilize_heading(
            cluster.obb.heading_rad,
            cluster.obb.length,
            cluster.obb.width,
            cluster.point_count,
            self.last_heading,
            cluster_params,
        );
        self.last_heading = Some(heading);
        self.last_obb = Obb { heading_rad: heading, ..cluster.obb };
        self.obb_length_avg.push(cluster.obb.length);
        self.obb_width_avg.push(cluster.obb.width);
        self.obb_height_avg.push(cluster.obb.height);

        self.sanity_check(params);
    }

    fn register_miss(&mut self, params: &TrackerParams) {
        self.misses += 1;
        let limit = match self.state {
            TrackState::Tentative => params.max_misses,
            TrackState::Confirmed => params.max_misses_confirmed,
            TrackState::Deleted => return,
        };
        if self.misses >= limit {
            self.state = TrackState::Deleted;
        }
    }

    fn sanity_check(&mut self, _params: &TrackerParams) {
        let s = self.estimate.state();
        let p = self.estimate.covariance();
        let finite = s.iter().all(|v| v.is_finite()) && p.iter().all(|v| v.is_finite());
        if !finite {
            warn!(track_id = %self.id, "track state contains NaN/Inf, resetting to deleted");
            self.state = TrackState::Deleted;
            self.estimate = StateAndCovariance::new(Vector4::zeros(), Matrix4::identity());
        }
    }

    fn speed_percentile(&self, fraction: f64) -> f64 {
        if self.speed_history.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.speed_history.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let idx = ((sorted.len() as f64 - 1.0) * fraction).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn summary(&self) -> TrackSummary {
        TrackSummary {
            track_id: self.id,
            sensor_id: self.sensor_id,
            state: self.state,
            first_seen_ns: self.first_seen_ns,
            last_updated_ns: self.last_updated_ns,
            observation_count: self.observation_count,
            avg_speed_mps: if self.observation_count > 0 {
                self.speed_sum / self.observation_count as f64
            } else {
                0.0
            },
            peak_speed_mps: self.peak_speed,
            p50_speed_mps: self.speed_percentile(0.50),
            p85_speed_mps: self.speed_percentile(0.85),
            p95_speed_mps: self.speed_percentile(0.95),
            obb_length_avg: self.obb_length_avg.mean,
            obb_width_avg: self.obb_width_avg.mean,
            obb_height_avg: self.obb_height_avg.mean,
            object_class: self.object_class,
            object_confidence: self.object_confidence,
        }
    }
}

/// Owns every track for one sensor; all mutation happens through `&mut
/// self` so callers are expected to hold this behind a mutex (as the
/// pipeline orchestrator does) when shared across threads.
pub struct Tracker {
    params: TrackerParams,
    cluster_params: ClusterParams,
    sensor_id: u16,
    tracks: Vec<Track>,
    last_frame_ts_ns: Option<i64>,
}

impl Tracker {
    pub fn new(params: TrackerParams, sensor_id: u16) -> Self {
        Self::with_cluster_params(params, ClusterParams::default(), sensor_id)
    }

    pub fn with_cluster_params(params: TrackerParams, cluster_params: ClusterParams, sensor_id: u16) -> Self {
        Self { params, cluster_params, sensor_id, tracks: Vec::new(), last_frame_ts_ns: None }
    }

    /// Drops every track and forgets the last-frame timestamp, as part of a
    /// `grid_reset` control operation.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.last_frame_ts_ns = None;
    }

    /// Applies a validated configuration patch in place; callers already
    /// hold the tracker mutex per the concurrency model, so this just needs
    /// `&mut self`.
    pub fn patch_params(&mut self, f: impl FnOnce(&mut TrackerParams)) {
        f(&mut self.params);
    }

    pub fn patch_cluster_params(&mut self, f: impl FnOnce(&mut ClusterParams)) {
        f(&mut self.cluster_params);
    }

    pub fn track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.state != TrackState::Deleted).count()
    }

    fn dt_since_last(&mut self, now_ns: i64) -> f64 {
        let dt = match self.last_frame_ts_ns {
            Some(prev) => ((now_ns - prev).max(0) as f64) / 1e9,
            None => 0.0,
        };
        self.last_frame_ts_ns = Some(now_ns);
        dt
    }

    /// Runs predict/gate/associate/update for one frame of clusters and
    /// returns the observations eligible for persistence: exactly the
    /// tracks that matched a cluster this frame (`misses == 0`).
    pub fn update(&mut self, clusters: &[Cluster], now_ns: i64) -> Vec<TrackObservation> {
        let dt = self.dt_since_last(now_ns);
        for track in self.tracks.iter_mut().filter(|t| t.state != TrackState::Deleted) {
            track.predict(dt, &self.params);
        }

        let active_idx: Vec<usize> = self
            .tracks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state != TrackState::Deleted)
            .map(|(i, _)| i)
            .collect();

        let assignment = self.associate(&active_idx, clusters);

        let mut matched_tracks = vec![false; active_idx.len()];
        let mut matched_clusters = vec![false; clusters.len()];
        let mut observations = Vec::new();

        for (row, maybe_col) in assignment.iter().enumerate() {
            if let Some(col) = maybe_col {
                let track_idx = active_idx[row];
                self.tracks[track_idx].apply_update(&clusters[*col], now_ns, &self.params, &self.cluster_params);
                matched_tracks[row] = true;
                matched_clusters[*col] = true;

                let t = &self.tracks[track_idx];
                let (x, y) = t.position();
                let (vx, vy) = t.velocity();
                observations.push(TrackObservation {
                    track_id: t.id,
                    ts_ns: now_ns,
                    x,
                    y,
                    z: t.last_obb.height / 2.0,
                    vx,
                    vy,
                    speed_mps: (vx * vx + vy * vy).sqrt(),
                    heading_rad: t.last_heading.unwrap_or(0.0),
                    obb: t.last_obb,
                    height_p95: clusters[*col].height_p95,
                    intensity_mean: clusters[*col].intensity_mean,
                });
            }
        }

        for (row, &was_matched) in matched_tracks.iter().enumerate() {
            if !was_matched {
                self.tracks[active_idx[row]].register_miss(&self.params);
            }
        }

        for (col, &was_matched) in matched_clusters.iter().enumerate() {
            if !was_matched && self.track_count() < self.params.max_tracks {
                let id = Uuid::new_v4();
                self.tracks.push(Track::spawn(id, self.sensor_id, &clusters[col], now_ns, &self.params));
            }
        }

        debug!(
            matched = observations.len(),
            total_tracks = self.tracks.len(),
            "tracker update complete"
        );
        observations
    }

    /// Called for frames the pipeline decided to throttle: advances misses
    /// without running predict against real cluster data, so a stalled
    /// sensor cannot keep a track alive forever via timestamp drift alone.
    pub fn advance_misses(&mut self, now_ns: i64) {
        self.last_frame_ts_ns = Some(now_ns);
        for track in self.tracks.iter_mut().filter(|t| t.state != TrackState::Deleted) {
            track.register_miss(&self.params);
        }
    }

    fn associate(&self, active_idx: &[usize], clusters: &[Cluster]) -> Vec<Option<usize>> {
        if active_idx.is_empty() || clusters.is_empty() {
            return vec![None; active_idx.len()];
        }

        let n = active_idx.len();
        let m = clusters.len();
        let dim = n.max(m);
        let mut cost = Array2::<f64>::from_elem((dim, dim), LARGE_COST);
        let mut raw = vec![vec![f64::INFINITY; m]; n];

        for (row, &track_idx) in active_idx.iter().enumerate() {
            for (col, cluster) in clusters.iter().enumerate() {
                let c = self.tracks[track_idx].gating_cost(cluster, &self.params);
                raw[row][col] = c;
                if c.is_finite() && c <= self.params.gating_distance_squared {
                    cost[(row, col)] = c;
                }
            }
        }

        let (row_to_col, _col_to_row) = match lapjv::lapjv(&cost) {
            Ok(r) => r,
            Err(_) => return vec![None; n],
        };

        let mut out = vec![None; n];
        for row in 0..n {
            let col = row_to_col[row];
            if col < m && raw[row][col].is_finite() && raw[row][col] <= self.params.gating_distance_squared {
                out[row] = Some(col);
            }
        }
        out
    }

    pub fn summaries(&self) -> Vec<TrackSummary> {
        self.tracks.iter().map(Track::summary).collect()
    }

    /// Feature snapshots for every currently-confirmed track, for the
    /// classifier to score; write-back happens separately through
    /// [`Tracker::update_classification`] under this same mutex.
    pub fn confirmed_snapshots(&self) -> Vec<(Uuid, crate::types::ClassifierFeatures)> {
        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| {
                (
                    t.id,
                    crate::types::ClassifierFeatures {
                        bbox_length_avg: t.obb_length_avg.mean,
                        bbox_width_avg: t.obb_width_avg.mean,
                        bbox_height_avg: t.obb_height_avg.mean,
                        avg_speed_mps: if t.observation_count > 0 {
                            t.speed_sum / t.observation_count as f64
                        } else {
                            0.0
                        },
                        peak_speed_mps: t.peak_speed,
                        observation_count: t.observation_count,
                    },
                )
            })
            .collect()
    }

    pub fn update_classification(&mut self, track_id: Uuid, class: ObjectClass, confidence: f64) {
        if let Some(t) = self.tracks.iter_mut().find(|t| t.id == track_id) {
            t.object_class = class;
            t.object_confidence = confidence;
        }
    }

    /// Drops tracks that have been `Deleted` for longer than `ttl_secs`.
    pub fn prune_deleted(&mut self, now_ns: i64, ttl_secs: u64) {
        for t in self.tracks.iter_mut() {
            if t.state == TrackState::Deleted && t.deleted_at_ns.is_none() {
                t.deleted_at_ns = Some(now_ns);
            }
        }
        let ttl_ns = (ttl_secs as i64).saturating_mul(1_000_000_000);
        self.tracks.retain(|t| match t.deleted_at_ns {
            Some(deleted_ns) => now_ns - deleted_ns < ttl_ns,
            None => true,
        });
    }
}
