//! L6: rule-based class assignment over a confirmed track's aggregate
//! features. First matching rule wins; thresholds are configuration, not
//! constants, so a deployment can retune them without a rebuild.

use crate::config::ClassifierParams;
use crate::types::{ClassifierFeatures, ObjectClass};

/// Classifies one track snapshot. Tracks with too few observations are
/// reported `Unknown` rather than guessed at; a single frame's worth of
/// geometry is not enough signal to commit to a class.
pub fn classify(features: &ClassifierFeatures, params: &ClassifierParams) -> (ObjectClass, f64) {
    if features.observation_count < params.min_observations_for_classify as u64 {
        return (ObjectClass::Unknown, 0.0);
    }

    if features.bbox_height_avg < params.bird_max_height && features.avg_speed_mps < params.bird_max_speed {
        return (ObjectClass::Bird, 0.70);
    }
    if features.bbox_height_avg > params.car_min_height
        && features.bbox_length_avg > params.car_min_length
        && features.avg_speed_mps > params.car_min_speed
    {
        return (ObjectClass::Car, 0.85);
    }
    if features.bbox_height_avg > params.pedestrian_min_height
        && features.bbox_height_avg < params.pedestrian_max_height
        && features.avg_speed_mps < params.pedestrian_max_speed
    {
        return (ObjectClass::Pedestrian, 0.75);
    }
    (ObjectClass::Other, 0.50)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(height: f64, length: f64, speed: f64, obs: u64) -> ClassifierFeatures {
        ClassifierFeatures {
            bbox_length_avg: length,
            bbox_width_avg: 1.0,
            bbox_height_avg: height,
            avg_speed_mps: speed,
            peak_speed_mps: speed,
            observation_count: obs,
        }
    }

    #[test]
    fn below_observation_floor_is_unknown() {
        let params = ClassifierParams::default();
        let (class, conf) = classify(&features(1.5, 4.0, 10.0, 3), &params);
        assert_eq!(class, ObjectClass::Unknown);
        assert_eq!(conf, 0.0);
    }

    #[test]
    fn fast_large_object_is_car() {
        let params = ClassifierParams::default();
        let (class, conf) = classify(&features(1.5, 4.0, 10.0, 20), &params);
        assert_eq!(class, ObjectClass::Car);
        assert_eq!(conf, 0.85);
    }

    #[test]
    fn slow_low_and_small_is_bird() {
        let params = ClassifierParams::default();
        let (class, _) = classify(&features(0.2, 0.3, 0.5, 20), &params);
        assert_eq!(class, ObjectClass::Bird);
    }

    #[test]
    fn human_sized_slow_mover_is_pedestrian() {
        let params = ClassifierParams::default();
        let (class, _) = classify(&features(1.7, 0.5, 1.5, 20), &params);
        assert_eq!(class, ObjectClass::Pedestrian);
    }

    #[test]
    fn unmatched_features_fall_back_to_other() {
        let params = ClassifierParams::default();
        let (class, conf) = classify(&features(0.9, 0.9, 4.0, 20), &params);
        assert_eq!(class, ObjectClass::Other);
        assert_eq!(conf, 0.50);
    }
}
