//! L4: height-band filter, optional voxel downsample, grid-indexed DBSCAN
//! over (x, y), and oriented-bounding-box fitting via 2D PCA.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::config::ClusterParams;
use crate::types::{Aabb, CartesianPoint, Cluster, Obb};

const NOISE: i32 = -1;

/// Uniform grid over (x, y) with cell edge `eps`; a region query only ever
/// has to look at the 3x3 neighborhood of cells around a point.
struct SpatialGrid {
    eps: f64,
    cells: HashMap<(i64, i64), Vec<usize>>,
}

impl SpatialGrid {
    fn build(points: &[CartesianPoint], eps: f64) -> Self {
        let mut cells: HashMap<(i64, i64), Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(cell_of(p.x, p.y, eps)).or_default().push(i);
        }
        Self { eps, cells }
    }

    fn neighbors_within(&self, points: &[CartesianPoint], idx: usize) -> Vec<usize> {
        let p = &points[idx];
        let (cx, cy) = cell_of(p.x, p.y, self.eps);
        let eps_sq = self.eps * self.eps;
        let mut out = Vec::new();
        for dx in -1..=1 {
            for dy in -1..=1 {
                if let Some(candidates) = self.cells.get(&(cx + dx, cy + dy)) {
                    for &j in candidates {
                        let q = &points[j];
                        let d = (q.x - p.x).powi(2) + (q.y - p.y).powi(2);
                        if d <= eps_sq {
                            out.push(j);
                        }
                    }
                }
            }
        }
        out
    }
}

fn cell_of(x: f64, y: f64, eps: f64) -> (i64, i64) {
    ((x / eps).floor() as i64, (y / eps).floor() as i64)
}

/// Densely-labeled DBSCAN over (x, y): 1, 2, 3, ... for clusters, `NOISE`
/// (-1) for points with too few neighbors to ever join a cluster.
fn dbscan(points: &[CartesianPoint], eps: f64, min_points: usize) -> Vec<i32> {
    let n = points.len();
    let mut labels = vec![0i32; n]; // 0 = unvisited
    let grid = SpatialGrid::build(points, eps);
    let mut next_cluster = 1i32;

    for i in 0..n {
        if labels[i] != 0 {
            continue;
        }
        let neighbors = grid.neighbors_within(points, i);
        if neighbors.len() < min_points {
            labels[i] = NOISE;
            continue;
        }

        labels[i] = next_cluster;
        let mut queue: VecDeque<usize> = neighbors.into_iter().collect();
        let mut seen: HashSet<usize> = queue.iter().copied().collect();
        seen.insert(i);

        while let Some(j) = queue.pop_front() {
            if labels[j] == NOISE {
                labels[j] = next_cluster;
            }
            if labels[j] != 0 {
                continue;
            }
            labels[j] = next_cluster;
            let j_neighbors = grid.neighbors_within(points, j);
            if j_neighbors.len() >= min_points {
                for k in j_neighbors {
                    if seen.insert(k) {
                        queue.push_back(k);
                    }
                }
            }
        }
        next_cluster += 1;
    }

    labels
}

fn voxel_downsample(points: &[CartesianPoint], voxel_xy: Option<f64>, voxel_z: Option<f64>) -> Vec<CartesianPoint> {
    let (Some(vxy), Some(vz)) = (voxel_xy, voxel_z) else {
        return points.to_vec();
    };
    if vxy <= 0.0 || vz <= 0.0 {
        return points.to_vec();
    }
    let mut buckets: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
    for (i, p) in points.iter().enumerate() {
        let key = (
            (p.x / vxy).floor() as i64,
            (p.y / vxy).floor() as i64,
            (p.z / vz).floor() as i64,
        );
        buckets.entry(key).or_default().push(i);
    }
    buckets
        .into_values()
        .map(|idxs| {
            let n = idxs.len() as f64;
            let mut sx = 0.0;
            let mut sy = 0.0;
            let mut sz = 0.0;
            let mut si = 0.0;
            let mut ts = 0;
            let mut sensor = 0;
            for &i in &idxs {
                let p = &points[i];
                sx += p.x;
                sy += p.y;
                sz += p.z;
                si += p.intensity as f64;
                ts = p.timestamp_ns;
                sensor = p.sensor_id;
            }
            CartesianPoint {
                x: sx / n,
                y: sy / n,
                z: sz / n,
                intensity: (si / n) as u8,
                timestamp_ns: ts,
                sensor_id: sensor,
            }
        })
        .collect()
}

/// Nearest member to the arithmetic mean; stable against non-convex shapes
/// where the mean itself can fall outside the cluster.
fn medoid(points: &[&CartesianPoint]) -> (f64, f64, f64) {
    let n = points.len() as f64;
    let mean = (
        points.iter().map(|p| p.x).sum::<f64>() / n,
        points.iter().map(|p| p.y).sum::<f64>() / n,
        points.iter().map(|p| p.z).sum::<f64>() / n,
    );
    let best = points
        .iter()
        .min_by(|a, b| {
            let da = (a.x - mean.0).powi(2) + (a.y - mean.1).powi(2) + (a.z - mean.2).powi(2);
            let db = (b.x - mean.0).powi(2) + (b.y - mean.1).powi(2) + (b.z - mean.2).powi(2);
            da.partial_cmp(&db).unwrap()
        })
        .unwrap();
    (best.x, best.y, best.z)
}

fn aabb_of(points: &[&CartesianPoint]) -> Aabb {
    let mut min = (f64::MAX, f64::MAX, f64::MAX);
    let mut max = (f64::MIN, f64::MIN, f64::MIN);
    for p in points {
        min.0 = min.0.min(p.x);
        min.1 = min.1.min(p.y);
        min.2 = min.2.min(p.z);
        max.0 = max.0.max(p.x);
        max.1 = max.1.max(p.y);
        max.2 = max.2.max(p.z);
    }
    Aabb { min, max }
}

fn height_p95(points: &[&CartesianPoint]) -> f64 {
    let mut zs: Vec<f64> = points.iter().map(|p| p.z).collect();
    zs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((zs.len() as f64 - 1.0) * 0.95).round() as usize;
    zs[idx.min(zs.len() - 1)]
}

/// 2D PCA on (x, y): principal axis is the eigenvector of the larger
/// eigenvalue of the 2x2 covariance matrix. Returns (length, width,
/// heading_rad) where heading is the principal axis angle before any
/// smoothing/locking is applied.
fn pca_obb(points: &[&CartesianPoint], centroid: (f64, f64, f64)) -> (f64, f64, f64) {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;

    let mut cxx = 0.0;
    let mut cyy = 0.0;
    let mut cxy = 0.0;
    for p in points {
        let dx = p.x - mean_x;
        let dy = p.y - mean_y;
        cxx += dx * dx;
        cyy += dy * dy;
        cxy += dx * dy;
    }
    cxx /= n;
    cyy /= n;
    cxy /= n;

    let trace = cxx + cyy;
    let det = cxx * cyy - cxy * cxy;
    let disc = (trace * trace / 4.0 - det).max(0.0).sqrt();
    let lambda1 = trace / 2.0 + disc;

    let (ex, ey) = if cxy.abs() > 1e-12 {
        (lambda1 - cyy, cxy)
    } else if cxx >= cyy {
        (1.0, 0.0)
    } else {
        (0.0, 1.0)
    };
    let norm = (ex * ex + ey * ey).sqrt().max(1e-12);
    let (ux, uy) = (ex / norm, ey / norm);
    let heading = uy.atan2(ux);

    let (cos_h, sin_h) = (heading.cos(), heading.sin());
    let mut min_u = f64::MAX;
    let mut max_u = f64::MIN;
    let mut min_v = f64::MAX;
    let mut max_v = f64::MIN;
    for p in points {
        let dx = p.x - centroid.0;
        let dy = p.y - centroid.1;
        let u = dx * cos_h + dy * sin_h;
        let v = -dx * sin_h + dy * cos_h;
        min_u = min_u.min(u);
        max_u = max_u.max(u);
        min_v = min_v.min(v);
        max_v = max_v.max(v);
    }
    let length = max_u - min_u;
    let width = max_v - min_v;
    (length, width, heading)
}

/// Smooths or locks a raw PCA heading against the previous frame's stored
/// heading, per the module invariants: fewer than `min_points_for_pca`
/// points retains the previous heading untouched; a near-square footprint
/// locks (PCA's 180-degree ambiguity makes the axis meaningless); otherwise
/// an EMA keeps heading from jittering frame to frame.
pub fn stabilize_heading(
    raw_heading: f64,
    length: f64,
    width: f64,
    point_count: usize,
    previous_heading: Option<f64>,
    params: &ClusterParams,
) -> f64 {
    if point_count < params.min_points_for_pca {
        return previous_heading.unwrap_or(raw_heading);
    }
    let longer = length.max(width);
    let shorter = length.min(width);
    if longer > 0.0 && (longer - shorter) / longer < params.heading_lock_ratio {
        return previous_heading.unwrap_or(raw_heading);
    }
    match previous_heading {
        Some(prev) => {
            let alpha = params.heading_smoothing_alpha;
            let delta = shortest_angle_diff(prev, raw_heading);
            prev + alpha * delta
        }
        None => raw_heading,
    }
}

fn shortest_angle_diff(from: f64, to: f64) -> f64 {
    let mut diff = (to - from) % std::f64::consts::PI;
    if diff > std::f64::consts::FRAC_PI_2 {
        diff -= std::f64::consts::PI;
    } else if diff < -std::f64::consts::FRAC_PI_2 {
        diff += std::f64::consts::PI;
    }
    diff
}

/// Runs the full L4 pipeline over one frame's foreground points. Heading
/// values returned here are the raw PCA heading; callers combine it with
/// [`stabilize_heading`] once they know which track (if any) the cluster
/// will associate with.
pub fn cluster_frame(points: &[CartesianPoint], params: &ClusterParams) -> Vec<Cluster> {
    let filtered: Vec<CartesianPoint> = points
        .iter()
        .copied()
        .filter(|p| p.z >= params.height_band_floor && p.z <= params.height_band_ceiling)
        .collect();

    let downsampled = voxel_downsample(&filtered, params.voxel_xy, params.voxel_z);
    if downsampled.is_empty() {
        return Vec::new();
    }

    let labels = dbscan(&downsampled, params.foreground_dbscan_eps, params.foreground_min_cluster_points);
    let max_label = labels.iter().copied().max().unwrap_or(0);

    let mut clusters = Vec::new();
    for cluster_id in 1..=max_label {
        let members: Vec<&CartesianPoint> = downsampled
            .iter()
            .zip(labels.iter())
            .filter(|(_, &l)| l == cluster_id)
            .map(|(p, _)| p)
            .collect();
        if members.is_empty() {
            continue;
        }

        let centroid = medoid(&members);
        let aabb = aabb_of(&members);
        let (length, width, heading) = pca_obb(&members, centroid);
        let (length, width) = (length.max(0.0), width.max(0.0));

        let longest = length.max(width);
        let shortest = length.min(width);
        if longest > params.max_cluster_diameter || longest < params.min_cluster_diameter {
            continue;
        }
        if shortest > params.min_short_axis_for_aspect_filter
            && longest / shortest.max(1e-9) > params.max_aspect_ratio
        {
            continue;
        }

        let intensity_mean = members.iter().map(|p| p.intensity as f64).sum::<f64>() / members.len() as f64;
        let first_ts_ns = members.iter().map(|p| p.timestamp_ns).min().unwrap_or(0);

        clusters.push(Cluster {
            centroid,
            aabb,
            obb: Obb {
                length,
                width,
                height: aabb.extents().2,
                heading_rad: heading,
            },
            point_count: members.len(),
            height_p95: height_p95(&members),
            intensity_mean,
            first_ts_ns,
        });
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f64, y: f64, z: f64) -> CartesianPoint {
        CartesianPoint { x, y, z, intensity: 50, timestamp_ns: 0, sensor_id: 0 }
    }

    fn sphere_around(cx: f64, cy: f64, n: usize) -> Vec<CartesianPoint> {
        (0..n)
            .map(|i| {
                let angle = (i as f64) / (n as f64) * std::f64::consts::TAU;
                pt(cx + angle.cos() * 0.3, cy + angle.sin() * 0.3, 0.0)
            })
            .collect()
    }

    #[test]
    fn empty_frame_yields_empty_clusters() {
        let params = ClusterParams::default();
        assert!(cluster_frame(&[], &params).is_empty());
    }

    #[test]
    fn two_separated_spheres_yield_two_clusters() {
        let params = ClusterParams {
            foreground_dbscan_eps: 0.6,
            foreground_min_cluster_points: 12,
            ..Default::default()
        };
        let mut points = sphere_around(0.0, 0.0, 50);
        points.extend(sphere_around(10.0, 0.0, 50));
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 2);
        for c in &clusters {
            assert_eq!(c.point_count, 50);
        }
    }

    #[test]
    fn height_band_filter_rejects_out_of_band_points() {
        let params = ClusterParams::default();
        let mut points = sphere_around(0.0, 0.0, 20);
        for p in points.iter_mut() {
            p.z = 5.0; // above ceiling
        }
        assert!(cluster_frame(&points, &params).is_empty());
    }

    #[test]
    fn aspect_ratio_filter_spares_thin_clusters_with_tiny_short_axis() {
        let params = ClusterParams {
            foreground_dbscan_eps: 1.0,
            foreground_min_cluster_points: 4,
            max_aspect_ratio: 15.0,
            min_short_axis_for_aspect_filter: 0.03,
            ..Default::default()
        };
        // A thin line of points: long axis ~4m, short axis effectively 0.
        let points: Vec<CartesianPoint> = (0..20).map(|i| pt(i as f64 * 0.2, 0.0, 0.0)).collect();
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn heading_rotates_with_input_modulo_pi() {
        let members: Vec<CartesianPoint> = (0..20).map(|i| pt(i as f64 * 0.2, 0.0, 0.0)).collect();
        let refs: Vec<&CartesianPoint> = members.iter().collect();
        let centroid = medoid(&refs);
        let (_, _, heading0) = pca_obb(&refs, centroid);

        let theta = std::f64::consts::FRAC_PI_4;
        let rotated: Vec<CartesianPoint> = members
            .iter()
            .map(|p| pt(p.x * theta.cos() - p.y * theta.sin(), p.x * theta.sin() + p.y * theta.cos(), p.z))
            .collect();
        let refs2: Vec<&CartesianPoint> = rotated.iter().collect();
        let centroid2 = medoid(&refs2);
        let (_, _, heading1) = pca_obb(&refs2, centroid2);

        let diff = (heading1 - heading0 - theta).rem_euclid(std::f64::consts::PI);
        let diff = diff.min(std::f64::consts::PI - diff);
        assert!(diff < 1e-6);
    }

    #[test]
    fn heading_locks_for_near_square_footprint() {
        let params = ClusterParams::default();
        let prev = Some(0.42);
        let locked = stabilize_heading(1.3, 1.0, 0.95, 20, prev, &params);
        assert_eq!(locked, prev.unwrap());
    }

    #[test]
    fn dbscan_separates_noisy_clusters_from_scattered_noise_points() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        // A fixed seed keeps this deterministic across local and CI runs
        // despite drawing from a real RNG rather than a hand-picked grid.
        let mut rng = StdRng::seed_from_u64(7);
        let mut points = Vec::new();
        for &(cx, cy) in &[(0.0, 0.0), (15.0, 0.0)] {
            for _ in 0..40 {
                let dx = rng.random_range(-0.25..0.25);
                let dy = rng.random_range(-0.25..0.25);
                points.push(pt(cx + dx, cy + dy, 0.0));
            }
        }
        // Sparse noise far from both clusters and from each other, too thin
        // to ever meet `foreground_min_cluster_points` on its own.
        for _ in 0..10 {
            let x = rng.random_range(-40.0..40.0);
            let y = rng.random_range(30.0..60.0);
            points.push(pt(x, y, 0.0));
        }

        let params = ClusterParams {
            foreground_dbscan_eps: 0.6,
            foreground_min_cluster_points: 10,
            ..Default::default()
        };
        let clusters = cluster_frame(&points, &params);
        assert_eq!(clusters.len(), 2, "noise points should not merge into or spawn extra clusters");
        for c in &clusters {
            assert!(c.point_count >= 30, "cluster lost too many members to noise, got {}", c.point_count);
        }
    }

    #[test]
    fn heading_retains_previous_when_too_few_points() {
        let params = ClusterParams::default();
        let prev = Some(0.2);
        let result = stabilize_heading(1.0, 4.0, 2.0, 2, prev, &params);
        assert_eq!(result, prev.unwrap());
    }
}
