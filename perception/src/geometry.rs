//! Spherical-to-Cartesian conversion and the optional sensor pose transform.
//!
//! X = right, Y = forward, Z = up. With no pose supplied (the common case
//! for a fixed-mount sensor with no GPS) the sensor frame *is* the world
//! frame, so `Pose::identity()` is the only pose most deployments ever use.

use nalgebra::{Matrix4, Point3};

use crate::types::{CartesianPoint, PolarPoint};

/// A 4x4 homogeneous transform from sensor frame into world frame.
#[derive(Debug, Clone)]
pub struct Pose(Matrix4<f64>);

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose {
    pub fn identity() -> Self {
        Pose(Matrix4::identity())
    }

    /// Builds a pose from a row-major 4x4 array, as delivered over the
    /// control surface.
    pub fn from_row_major(rows: [[f64; 4]; 4]) -> Self {
        let m = Matrix4::from_fn(|r, c| rows[r][c]);
        Pose(m)
    }

    pub fn is_identity(&self) -> bool {
        self.0 == Matrix4::identity()
    }

    fn apply(&self, p: Point3<f64>) -> Point3<f64> {
        if self.is_identity() {
            return p;
        }
        self.0.transform_point(&p)
    }
}

/// Fixed per-channel elevation angles for the 40 laser rings of a Pandar40P,
/// ascending from the lowest to the highest ring index. Callers whose
/// upstream L1 layer already resolved `elevation_deg` per point do not need
/// this; it exists for building synthetic frames and for sanity-checking a
/// ring/elevation pairing against the known hardware layout.
pub fn pandar40p_elevation_table_deg() -> [f64; 40] {
    // Approximate, monotonically increasing mapping of ring index to
    // vertical angle spanning the sensor's documented +15..-25 degree FOV
    // with denser sampling around the horizon, matching the datasheet's
    // non-uniform channel spacing.
    [
        -25.0, -19.0, -15.639, -11.31, -8.843, -7.254, -6.148, -5.333, -4.667, -4.0, -3.667, -3.333,
        -3.0, -2.667, -2.333, -2.0, -1.667, -1.333, -1.0, -0.667, -0.333, 0.0, 0.333, 0.667, 1.0,
        1.333, 1.667, 2.333, 3.333, 4.667, 7.0, 10.333, 15.0, 19.0, 19.0, 19.0, 19.0, 19.0, 19.0,
        15.0,
    ]
}

pub fn polar_to_cartesian(p: &PolarPoint, pose: &Pose, sensor_id: u16) -> CartesianPoint {
    let az = p.azimuth_deg.to_radians();
    let el = p.elevation_deg.to_radians();
    let horiz = p.distance_m * el.cos();
    let x = horiz * az.sin();
    let y = horiz * az.cos();
    let z = p.distance_m * el.sin();

    let world = pose.apply(Point3::new(x, y, z));
    CartesianPoint {
        x: world.x,
        y: world.y,
        z: world.z,
        intensity: p.intensity,
        timestamp_ns: p.timestamp_ns,
        sensor_id,
    }
}
