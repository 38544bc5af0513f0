//! L3.B: the per-cell background store and the per-frame classification
//! pass described in section 4.B of the design.

use std::io::{Read, Write};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BackgroundParams;
use crate::error::{Error, Result};
use crate::types::{PolarPoint, Region, ScaledRegionParams, VarianceClass};

/// Hardcoded in the closeness-threshold warmup multiplier; independent of
/// `warmup_min_frames`, which governs grid-level settling completion, not
/// per-cell closeness scaling. Do not fold these two constants together.
const WARMUP_REFERENCE_FRAMES: f64 = 100.0;
const FREEZE_THAW_GRACE_NS: i64 = 1_000_000;
const SNAPSHOT_VERSION: u32 = 1;
const SIGNIFICANT_DRIFT_METERS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellLifecycle {
    Empty,
    Accumulating,
    Settled,
    Locked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundCell {
    pub avg_range_m: f64,
    pub spread_m: f64,
    pub times_seen: u32,
    pub first_observation_range: Option<f64>,
    pub last_update_ns: i64,
    pub frozen_until_ns: i64,
    pub locked_baseline: bool,
    pub recent_foreground_count: u32,
    outlier_confirmation_remaining: u32,
}

impl Default for BackgroundCell {
    fn default() -> Self {
        Self {
            avg_range_m: 0.0,
            spread_m: 0.0,
            times_seen: 0,
            first_observation_range: None,
            last_update_ns: 0,
            frozen_until_ns: 0,
            locked_baseline: false,
            recent_foreground_count: 0,
            outlier_confirmation_remaining: 0,
        }
    }
}

impl BackgroundCell {
    pub fn lifecycle(&self, min_settlement_points: u32, noise_bound: f64) -> CellLifecycle {
        if self.locked_baseline {
            return CellLifecycle::Locked;
        }
        if self.times_seen == 0 {
            return CellLifecycle::Empty;
        }
        if self.times_seen >= min_settlement_points && self.spread_m <= noise_bound {
            return CellLifecycle::Settled;
        }
        CellLifecycle::Accumulating
    }

    fn is_frozen(&self, now_ns: i64) -> bool {
        now_ns < self.frozen_until_ns
    }

    fn apply_background_hit(&mut self, distance: f64, alpha: f64, now_ns: i64) {
        if self.first_observation_range.is_none() {
            self.first_observation_range = Some(distance);
            self.avg_range_m = distance;
        }
        let delta = distance - self.avg_range_m;
        self.avg_range_m += alpha * delta;
        self.spread_m += alpha * (delta.abs() - self.spread_m);
        self.times_seen += 1;
        self.last_update_ns = now_ns;

        if self.is_frozen(now_ns) {
            // thaw with a short grace period before counting fresh foreground
        } else if now_ns >= self.frozen_until_ns + FREEZE_THAW_GRACE_NS {
            self.recent_foreground_count = 0;
        }
    }

    fn apply_foreground_hit(&mut self, now_ns: i64, freeze_window_ns: i64, outlier_confirmation_count: u32) {
        if self.is_frozen(now_ns) {
            // Freeze suppresses accumulation entirely; never count while frozen.
            return;
        }
        self.recent_foreground_count += 1;
        self.frozen_until_ns = now_ns + freeze_window_ns;

        if self.locked_baseline {
            if self.outlier_confirmation_remaining == 0 {
                self.outlier_confirmation_remaining = outlier_confirmation_count;
            }
            self.outlier_confirmation_remaining = self.outlier_confirmation_remaining.saturating_sub(1);
            if self.outlier_confirmation_remaining == 0 {
                self.locked_baseline = false;
                warn!("background cell reverted Locked -> Accumulating after repeated outliers");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriftAdvisory {
    pub median_delta_m: f64,
}

#[derive(Serialize, Deserialize)]
struct GridSnapshot {
    version: u32,
    rings: usize,
    azimuth_bins: usize,
    cells: Vec<BackgroundCell>,
    cell_to_region: Vec<u32>,
    settling_complete: bool,
}

pub type BackgroundGridConfig = BackgroundParams;

struct GridState {
    cells: Vec<BackgroundCell>,
    cell_to_region: Vec<u32>,
    regions: Vec<Region>,
    settling_complete: bool,
    frames_processed: u64,
    grid_start_ns: i64,
}

/// Polar ring x azimuth-bin grid owning all background state for one
/// sensor. Classification runs under a single write lock; foreground point
/// extraction happens after the caller releases it (the mask alone is
/// returned from `process_frame`).
pub struct BackgroundGrid {
    config: BackgroundGridConfig,
    state: RwLock<GridState>,
}

/// Sentinel region id for unoccupied cells, distinct from any real region.
pub const UNASSIGNED_REGION: u32 = u32::MAX;

impl BackgroundGrid {
    pub fn new(config: BackgroundGridConfig) -> Self {
        let n = config.rings * config.azimuth_bins;
        Self {
            state: RwLock::new(GridState {
                cells: vec![BackgroundCell::default(); n],
                cell_to_region: vec![UNASSIGNED_REGION; n],
                regions: Vec::new(),
                settling_complete: false,
                frames_processed: 0,
                grid_start_ns: 0,
            }),
            config,
        }
    }

    fn cell_index(&self, ring: usize, azimuth_bin: usize) -> usize {
        ring * self.config.azimuth_bins + azimuth_bin
    }

    fn azimuth_bin(&self, azimuth_deg: f64) -> usize {
        let frac = azimuth_deg.rem_euclid(360.0) / 360.0;
        ((frac * self.config.azimuth_bins as f64) as usize).min(self.config.azimuth_bins - 1)
    }

    fn default_region_params(&self) -> ScaledRegionParams {
        ScaledRegionParams {
            closeness_multiplier: self.config.closeness_multiplier,
            noise_relative_fraction: self.config.noise_relative,
            neighbor_confirmation_count: self.config.neighbor_confirmation_count,
            safety_margin_meters: self.config.safety_margin_meters,
            update_alpha: self.config.background_update_fraction,
        }
    }

    /// Applies a validated configuration patch in place. Requires exclusive
    /// access, which the caller gets by holding this grid behind its own
    /// outer lock (see `SensorRuntime` in the pipeline module) the same way
    /// it already holds the tracker behind a mutex.
    pub fn patch_config(&mut self, f: impl FnOnce(&mut BackgroundGridConfig)) {
        f(&mut self.config);
    }

    pub fn is_settling_complete(&self) -> bool {
        self.state.read().settling_complete
    }

    pub fn region_count(&self) -> usize {
        self.state.read().regions.len()
    }

    /// The current region list, for persisting alongside a cell snapshot so
    /// a restored grid does not start regionless.
    pub fn regions(&self) -> Vec<Region> {
        self.state.read().regions.clone()
    }

    pub fn times_seen_histogram(&self) -> Vec<(u32, u32)> {
        let state = self.state.read();
        let mut counts: std::collections::BTreeMap<u32, u32> = std::collections::BTreeMap::new();
        for c in &state.cells {
            *counts.entry(c.times_seen).or_insert(0) += 1;
        }
        counts.into_iter().collect()
    }

    /// Classifies every point of a frame, mutating cell state along the
    /// way. Returns a same-length foreground mask; during settling the mask
    /// is all-false and only EMA seeding occurs.
    pub fn process_frame(
        &self,
        points: &[PolarPoint],
        now_ns: i64,
        region_manager: &mut super::region::RegionManager,
    ) -> Vec<bool> {
        let mut state = self.state.write();
        if state.grid_start_ns == 0 {
            state.grid_start_ns = now_ns;
        }
        state.frames_processed += 1;

        let settling = !state.settling_complete;
        let mut mask = vec![false; points.len()];

        for (i, p) in points.iter().enumerate() {
            let ring = p.ring_index as usize;
            if ring >= self.config.rings {
                continue;
            }
            let bin = self.azimuth_bin(p.azimuth_deg);
            let idx = self.cell_index(ring, bin);

            if settling {
                region_manager.observe_variance_sample(idx, p.distance_m, &state.cells[idx]);
                let alpha = self.config.background_update_fraction;
                state.cells[idx].apply_background_hit(p.distance_m, alpha, now_ns);
                continue;
            }

            let region_id = state.cell_to_region[idx];
            let params = state
                .regions
                .iter()
                .find(|r| r.region_id == region_id)
                .map(|r| r.scaled_parameters.clone())
                .unwrap_or_else(|| self.default_region_params());

            let is_foreground = self.classify_point(&state.cells, ring, bin, p.distance_m, &params);
            mask[i] = is_foreground;

            let cell = &mut state.cells[idx];
            let alpha = if cell.locked_baseline {
                self.config.post_settle_update_fraction
            } else {
                params.update_alpha
            };
            if is_foreground {
                cell.apply_foreground_hit(now_ns, self.config.freeze_window_nanos, self.config.outlier_confirmation_count);
            } else {
                cell.apply_background_hit(p.distance_m, alpha, now_ns);
            }

            let noise_bound = params.noise_relative_fraction * cell.avg_range_m + params.safety_margin_meters;
            if cell.lifecycle(self.config.min_settlement_points, noise_bound) != CellLifecycle::Locked
                && cell.times_seen >= self.config.min_settlement_points
                && cell.spread_m <= noise_bound
            {
                cell.locked_baseline = true;
            }
        }

        if settling
            && state.frames_processed >= self.config.warmup_min_frames as u64
            && now_ns - state.grid_start_ns >= self.config.warmup_duration_nanos
        {
            let base = super::region::BaseRegionParams {
                closeness_multiplier: self.config.closeness_multiplier,
                noise_relative_fraction: self.config.noise_relative,
                neighbor_confirmation_count: self.config.neighbor_confirmation_count,
                safety_margin_meters: self.config.safety_margin_meters,
                update_alpha: self.config.background_update_fraction,
            };
            let (regions, cell_to_region) =
                region_manager.segment(&state.cells, self.config.azimuth_bins, self.config.max_regions, &base);
            state.regions = regions;
            state.cell_to_region = cell_to_region;
            state.settling_complete = true;
            info!(region_count = state.regions.len(), "background settling complete");
        }

        mask
    }

    fn classify_point(
        &self,
        cells: &[BackgroundCell],
        ring: usize,
        bin: usize,
        distance: f64,
        params: &ScaledRegionParams,
    ) -> bool {
        let idx = self.cell_index(ring, bin);
        let cell = &cells[idx];

        if background_within_threshold(cell, distance, params) {
            return false;
        }

        let half_width = self.config.neighbor_half_width as isize;
        let mut confirmations = 0u32;
        for delta in -half_width..=half_width {
            if delta == 0 {
                continue;
            }
            let neighbor_bin = (bin as isize + delta).rem_euclid(self.config.azimuth_bins as isize) as usize;
            let neighbor = &cells[self.cell_index(ring, neighbor_bin)];
            if background_within_threshold(neighbor, distance, params) {
                confirmations += 1;
            }
        }
        if confirmations >= params.neighbor_confirmation_count {
            return false;
        }
        true
    }

    pub fn check_drift(&self, baseline: &[BackgroundCell]) -> Option<DriftAdvisory> {
        let state = self.state.read();
        if baseline.len() != state.cells.len() {
            return None;
        }
        let mut deltas: Vec<f64> = state
            .cells
            .iter()
            .zip(baseline.iter())
            .filter(|(c, b)| c.times_seen > 0 && b.times_seen > 0)
            .map(|(c, b)| (c.avg_range_m - b.avg_range_m).abs())
            .collect();
        if deltas.is_empty() {
            return None;
        }
        deltas.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = deltas[deltas.len() / 2];
        if median >= SIGNIFICANT_DRIFT_METERS {
            Some(DriftAdvisory { median_delta_m: median })
        } else {
            None
        }
    }

    /// Serializes cells + region map as a versioned, gzip-compressed blob.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        let snap = GridSnapshot {
            version: SNAPSHOT_VERSION,
            rings: self.config.rings,
            azimuth_bins: self.config.azimuth_bins,
            cells: state.cells.clone(),
            cell_to_region: state.cell_to_region.clone(),
            settling_complete: state.settling_complete,
        };
        let json = serde_json::to_vec(&snap)?;
        let mut encoder = libflate::gzip::Encoder::new(Vec::new())?;
        encoder.write_all(&json)?;
        Ok(encoder.finish().into_result()?)
    }

    /// Restores from a snapshot blob, rejecting any shape mismatch. On
    /// success, settling is immediately marked complete. On mismatch the
    /// caller is expected to fall back to `BackgroundGrid::new`.
    pub fn restore(config: BackgroundGridConfig, blob: &[u8], regions: Vec<Region>) -> Result<Self> {
        let mut decoder = libflate::gzip::Decoder::new(blob)?;
        let mut json = Vec::new();
        decoder.read_to_end(&mut json)?;
        let snap: GridSnapshot = serde_json::from_slice(&json)?;

        if snap.rings != config.rings || snap.azimuth_bins != config.azimuth_bins {
            return Err(Error::SnapshotShapeMismatch {
                expected_rings: config.rings,
                expected_azimuth: config.azimuth_bins,
                got_rings: snap.rings,
                got_azimuth: snap.azimuth_bins,
            });
        }

        Ok(Self {
            state: RwLock::new(GridState {
                cells: snap.cells,
                cell_to_region: snap.cell_to_region,
                regions,
                settling_complete: true,
                frames_processed: config.warmup_min_frames as u64,
                grid_start_ns: 0,
            }),
            config,
        })
    }
}

/// Serializes a region list for persistence alongside a cell snapshot.
/// Plain JSON, not gzip: the region table is small compared to the cell
/// grid and doesn't warrant the extra dependency on the write path.
pub fn serialize_regions(regions: &[Region]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(regions)?)
}

pub fn deserialize_regions(blob: &[u8]) -> Result<Vec<Region>> {
    Ok(serde_json::from_slice(blob)?)
}

/// `4.0` at `times_seen == 0`, decaying linearly to `1.0` at `times_seen ==
/// 100` (a fixed reference point, independent of the configurable
/// `warmup_min_frames`), then flat at `1.0` beyond it.
fn warmup_multiplier(times_seen: u32) -> f64 {
    1.0 + 3.0 * (WARMUP_REFERENCE_FRAMES - times_seen as f64).max(0.0) / WARMUP_REFERENCE_FRAMES
}

fn background_within_threshold(cell: &BackgroundCell, distance: f64, params: &ScaledRegionParams) -> bool {
    if cell.times_seen == 0 {
        // No baseline yet: treat as background to avoid spurious foreground
        // during the very first observation of a cell.
        return true;
    }
    let threshold = params.closeness_multiplier
        * (cell.spread_m + params.noise_relative_fraction * distance + f64::EPSILON)
        * warmup_multiplier(cell.times_seen)
        + params.safety_margin_meters;
    (distance - cell.avg_range_m).abs() <= threshold
}
