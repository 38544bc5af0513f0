//! L3.C: runs once, at the moment background settling completes, to turn
//! the per-cell variance landscape into a bounded set of regions whose
//! scaled parameters the grid switches to for all subsequent frames.

use std::collections::{HashSet, VecDeque};

use crate::types::{Region, ScaledRegionParams, VarianceClass};

use super::grid::{BackgroundCell, UNASSIGNED_REGION};

/// Tracks which cells actually received samples during settling; the cell's
/// own EMA spread (`spread_m`) already doubles as its variance estimate, so
/// no separate accumulator is kept here.
#[derive(Default)]
pub struct RegionManager {
    occupied: HashSet<usize>,
}

impl RegionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_variance_sample(&mut self, cell_index: usize, _distance_m: f64, cell: &BackgroundCell) {
        if cell.times_seen > 0 {
            self.occupied.insert(cell_index);
        }
    }

    /// Classifies occupied cells by variance percentile, flood-fills same-
    /// class 4-connected neighbors (azimuth wraps) into regions, merges the
    /// smallest regions until the count is within `max_regions`, and
    /// returns the region list plus a flat cell-to-region lookup.
    pub fn segment(
        &mut self,
        cells: &[BackgroundCell],
        azimuth_bins: usize,
        max_regions: usize,
        base: &BaseRegionParams,
    ) -> (Vec<Region>, Vec<u32>) {
        let n = cells.len();
        let rings = if azimuth_bins == 0 { 0 } else { n / azimuth_bins };
        let mut cell_to_region = vec![UNASSIGNED_REGION; n];

        if self.occupied.is_empty() || azimuth_bins == 0 {
            let regions = vec![default_region(0, base)];
            return (regions, cell_to_region);
        }

        let mut variances: Vec<f64> = self
            .occupied
            .iter()
            .map(|&i| cells[i].spread_m.powi(2))
            .collect();
        variances.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let p33 = percentile(&variances, 0.33);
        let p66 = percentile(&variances, 0.66);

        let class_of = |idx: usize| -> VarianceClass {
            let v = cells[idx].spread_m.powi(2);
            if v <= p33 {
                VarianceClass::Stable
            } else if v <= p66 {
                VarianceClass::Variable
            } else {
                VarianceClass::Volatile
            }
        };

        let mut visited: HashSet<usize> = HashSet::new();
        let mut regions: Vec<Region> = Vec::new();
        let mut next_id = 0u32;

        let mut occupied_sorted: Vec<usize> = self.occupied.iter().copied().collect();
        occupied_sorted.sort_unstable();

        for &start in &occupied_sorted {
            if visited.contains(&start) {
                continue;
            }
            let class = class_of(start);
            let mut members = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back(start);
            visited.insert(start);

            while let Some(cur) = queue.pop_front() {
                members.push(cur);
                for neighbor in ring_azimuth_neighbors(cur, rings, azimuth_bins) {
                    if self.occupied.contains(&neighbor) && !visited.contains(&neighbor) && class_of(neighbor) == class {
                        visited.insert(neighbor);
                        queue.push_back(neighbor);
                    }
                }
            }

            for &idx in &members {
                cell_to_region[idx] = next_id;
            }
            regions.push(Region {
                region_id: next_id,
                member_cell_indices: members,
                variance_class: class,
                scaled_parameters: scaled_params_for(class, base),
            });
            next_id += 1;
        }

        merge_smallest_until_bounded(&mut regions, &mut cell_to_region, max_regions, cells, rings, azimuth_bins);

        (regions, cell_to_region)
    }
}

fn percentile(sorted: &[f64], fraction: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * fraction).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn ring_azimuth_neighbors(idx: usize, rings: usize, azimuth_bins: usize) -> Vec<usize> {
    let ring = idx / azimuth_bins;
    let bin = idx % azimuth_bins;
    let mut out = Vec::with_capacity(4);

    let left = (bin + azimuth_bins - 1) % azimuth_bins;
    let right = (bin + 1) % azimuth_bins;
    out.push(ring * azimuth_bins + left);
    out.push(ring * azimuth_bins + right);

    if ring > 0 {
        out.push((ring - 1) * azimuth_bins + bin);
    }
    if ring + 1 < rings {
        out.push((ring + 1) * azimuth_bins + bin);
    }
    out
}

/// The grid's base-configured parameters a region's scaled parameters are
/// derived from. `closeness_multiplier` and `safety_margin_meters` are not
/// varied by variance class (the per-class table in the design only scales
/// noise fraction, neighbor confirmation count, and update alpha) so they
/// pass through unchanged.
#[derive(Debug, Clone, Copy)]
pub struct BaseRegionParams {
    pub closeness_multiplier: f64,
    pub noise_relative_fraction: f64,
    pub neighbor_confirmation_count: u32,
    pub safety_margin_meters: f64,
    pub update_alpha: f64,
}

/// Per-class scaling applied to the grid's base parameters: noise fraction
/// multiplier, an additive bump to neighbor confirmation count, and an
/// update-alpha multiplier. Stable cells trust their baseline more (lower
/// noise bound, faster settle alpha); Volatile cells need more neighbor
/// corroboration and adapt more cautiously.
fn scaled_params_for(class: VarianceClass, base: &BaseRegionParams) -> ScaledRegionParams {
    let (noise_mult, neighbor_add, alpha_mult) = match class {
        VarianceClass::Stable => (0.8, 0i64, 1.5),
        VarianceClass::Variable => (1.0, 0i64, 1.0),
        VarianceClass::Volatile => (2.0, 2i64, 0.5),
    };
    ScaledRegionParams {
        closeness_multiplier: base.closeness_multiplier,
        noise_relative_fraction: base.noise_relative_fraction * noise_mult,
        neighbor_confirmation_count: (base.neighbor_confirmation_count as i64 + neighbor_add).max(0) as u32,
        safety_margin_meters: base.safety_margin_meters,
        update_alpha: base.update_alpha * alpha_mult,
    }
}

fn default_region(id: u32, base: &BaseRegionParams) -> Region {
    Region {
        region_id: id,
        member_cell_indices: Vec::new(),
        variance_class: VarianceClass::Variable,
        scaled_parameters: scaled_params_for(VarianceClass::Variable, base),
    }
}

/// Repeatedly folds the currently-smallest region into its lowest-
/// variance-difference neighbor (a region sharing a 4-connected, azimuth-
/// wrapped cell boundary with it) until at most `max_regions` remain. A
/// region with no discoverable neighbor (fully isolated) folds into the
/// overall largest region instead, which always terminates the loop in
/// bounded steps.
fn merge_smallest_until_bounded(
    regions: &mut Vec<Region>,
    cell_to_region: &mut [u32],
    max_regions: usize,
    cells: &[BackgroundCell],
    rings: usize,
    azimuth_bins: usize,
) {
    while regions.len() > max_regions {
        let (smallest_pos, _) = regions
            .iter()
            .enumerate()
            .min_by_key(|(_, r)| r.member_cell_indices.len())
            .unwrap();

        let pos_of_id: std::collections::HashMap<u32, usize> =
            regions.iter().enumerate().map(|(i, r)| (r.region_id, i)).collect();

        let mut neighbor_positions: HashSet<usize> = HashSet::new();
        if azimuth_bins > 0 {
            for &idx in &regions[smallest_pos].member_cell_indices {
                for n in ring_azimuth_neighbors(idx, rings, azimuth_bins) {
                    let rid = cell_to_region[n];
                    if rid == UNASSIGNED_REGION {
                        continue;
                    }
                    if let Some(&p) = pos_of_id.get(&rid) {
                        if p != smallest_pos {
                            neighbor_positions.insert(p);
                        }
                    }
                }
            }
        }

        let target_pos = if neighbor_positions.is_empty() {
            regions
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != smallest_pos)
                .max_by_key(|(_, r)| r.member_cell_indices.len())
                .map(|(i, _)| i)
        } else {
            let smallest_variance = region_variance(&regions[smallest_pos], cells);
            neighbor_positions.into_iter().min_by(|&a, &b| {
                let da = (region_variance(&regions[a], cells) - smallest_variance).abs();
                let db = (region_variance(&regions[b], cells) - smallest_variance).abs();
                da.partial_cmp(&db).unwrap()
            })
        };

        let Some(target_pos) = target_pos else { break };

        let removed = regions.remove(smallest_pos);
        let target_pos = if smallest_pos < target_pos { target_pos - 1 } else { target_pos };

        for &idx in &removed.member_cell_indices {
            cell_to_region[idx] = regions[target_pos].region_id;
        }
        regions[target_pos].member_cell_indices.extend(removed.member_cell_indices);
    }
}

/// Mean `spread_m.powi(2)` over a region's member cells, its variance
/// estimate for the purpose of picking a merge target.
fn region_variance(region: &Region, cells: &[BackgroundCell]) -> f64 {
    if region.member_cell_indices.is_empty() {
        return 0.0;
    }
    let sum: f64 = region.member_cell_indices.iter().map(|&i| cells[i].spread_m.powi(2)).sum();
    sum / region.member_cell_indices.len() as f64
}
