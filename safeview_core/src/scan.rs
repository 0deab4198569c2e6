//! Scan transformation - laser polar ranges to validated body-frame points.
//!
//! Each beam is converted to a Cartesian point in the laser frame, mapped
//! into the body frame by the laser→base transform, and kept only if every
//! coordinate is finite and inside the ±1000 m sanity bound. A corrupt
//! calibration therefore loses points instead of flinging them across the
//! scene.

use crate::geometry::RigidTransform;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Height of scan points in the laser frame (meters).
pub const SCAN_Z_OFFSET: f64 = 0.05;

/// Magnitude bound for any transformed coordinate.
pub const MAX_COORDINATE: f64 = 1000.0;

/// Beams per revolution of the simulated scan.
pub const SIMULATED_BEAMS: usize = 360;

/// One sweep of the 2D laser, as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanFrame {
    pub angle_min: f64,
    pub angle_increment: f64,
    pub ranges: Vec<f64>,
}

impl ScanFrame {
    pub fn new(angle_min: f64, angle_increment: f64, ranges: Vec<f64>) -> Self {
        Self {
            angle_min,
            angle_increment,
            ranges,
        }
    }

    pub fn beam_angle(&self, index: usize) -> f64 {
        self.angle_min + index as f64 * self.angle_increment
    }
}

/// Validated body-frame points, in surviving-beam order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud {
    points: Vec<Point3<f64>>,
}

impl PointCloud {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a cloud, dropping any point that breaks the finite/bounded invariant.
    pub fn from_points(points: impl IntoIterator<Item = Point3<f64>>) -> Self {
        Self {
            points: points.into_iter().filter(is_renderable).collect(),
        }
    }

    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point3<f64>> {
        self.points.iter()
    }
}

/// True if every coordinate is finite and strictly inside the bound.
pub fn is_renderable(point: &Point3<f64>) -> bool {
    point
        .coords
        .iter()
        .all(|c| c.is_finite() && c.abs() < MAX_COORDINATE)
}

/// Per-frame accounting, for logs and the simulation harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub beams: usize,
    pub kept: usize,
    pub dropped_invalid_beam: usize,
    pub dropped_out_of_bounds: usize,
    /// Cloud came from the simulated generator (calibration Absent)
    pub simulated: bool,
}

/// Converts scan frames into point clouds.
///
/// Holds only the simulated generator's phase; every real frame is
/// transformed from scratch.
#[derive(Debug, Clone, Default)]
pub struct ScanTransformer {
    simulated: SimulatedScan,
    degraded_logged: bool,
}

impl ScanTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform(&mut self, frame: &ScanFrame, xform: Option<&RigidTransform>) -> PointCloud {
        self.transform_with_stats(frame, xform).0
    }

    /// Transforms a frame and reports what was dropped.
    ///
    /// With `xform` Absent the frame is not used: the cloud comes from the
    /// simulated generator so the view stays populated.
    pub fn transform_with_stats(
        &mut self,
        frame: &ScanFrame,
        xform: Option<&RigidTransform>,
    ) -> (PointCloud, ScanStats) {
        let Some(xform) = xform else {
            if !self.degraded_logged {
                tracing::warn!("laser calibration missing, showing simulated scan");
                self.degraded_logged = true;
            }
            let cloud = self.simulated.next_cloud();
            let stats = ScanStats {
                beams: SIMULATED_BEAMS,
                kept: cloud.len(),
                simulated: true,
                ..Default::default()
            };
            return (cloud, stats);
        };
        self.degraded_logged = false;

        let mut stats = ScanStats {
            beams: frame.ranges.len(),
            ..Default::default()
        };
        let mut points = Vec::with_capacity(frame.ranges.len());

        for (i, &range) in frame.ranges.iter().enumerate() {
            let angle = frame.beam_angle(i);
            if !range.is_finite() || range <= 0.0 || angle.is_nan() {
                stats.dropped_invalid_beam += 1;
                continue;
            }

            let local = Point3::new(range * angle.cos(), range * angle.sin(), SCAN_Z_OFFSET);
            let body = xform.apply(&local);
            if !is_renderable(&body) {
                stats.dropped_out_of_bounds += 1;
                continue;
            }

            points.push(body);
        }

        stats.kept = points.len();
        tracing::trace!(?stats, "scan transformed");
        (PointCloud { points }, stats)
    }
}

/// Deterministic stand-in scan used while calibration is Absent.
///
/// A three-lobed ring around the robot, rotating slowly frame to frame.
#[derive(Debug, Clone, Default)]
pub struct SimulatedScan {
    phase: f64,
}

impl SimulatedScan {
    const BASE_RANGE: f64 = 2.0;
    const RIPPLE: f64 = 0.3;
    const PHASE_STEP: f64 = 0.1;

    pub fn next_cloud(&mut self) -> PointCloud {
        let phase = self.phase;
        self.phase = (self.phase + Self::PHASE_STEP) % TAU;

        let step = TAU / SIMULATED_BEAMS as f64;
        PointCloud::from_points((0..SIMULATED_BEAMS).map(|i| {
            let theta = i as f64 * step;
            let range = Self::BASE_RANGE + Self::RIPPLE * (3.0 * theta + phase).sin();
            Point3::new(range * theta.cos(), range * theta.sin(), SCAN_Z_OFFSET)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_single_forward_beam() {
        let mut transformer = ScanTransformer::new();
        let frame = ScanFrame::new(0.0, 0.0, vec![1.0]);
        let cloud = transformer.transform(&frame, Some(&RigidTransform::identity()));

        assert_eq!(cloud.len(), 1);
        let p = cloud.points()[0];
        assert_relative_eq!(p.x, 1.0);
        assert_relative_eq!(p.y, 0.0);
        assert_relative_eq!(p.z, SCAN_Z_OFFSET);
    }

    #[test]
    fn test_invalid_ranges_dropped() {
        let mut transformer = ScanTransformer::new();
        let frame = ScanFrame::new(0.0, 0.0, vec![f64::INFINITY, f64::NAN, -1.0, 0.0, 2.0]);
        let (cloud, stats) = transformer.transform_with_stats(&frame, Some(&RigidTransform::identity()));

        assert_eq!(cloud.len(), 1);
        assert_relative_eq!(cloud.points()[0].x, 2.0);
        assert_eq!(stats.dropped_invalid_beam, 4);
        assert_eq!(stats.kept, 1);
    }

    #[test]
    fn test_nan_angle_dropped() {
        let mut transformer = ScanTransformer::new();
        let frame = ScanFrame::new(f64::NAN, 0.1, vec![1.0, 1.0]);
        let cloud = transformer.transform(&frame, Some(&RigidTransform::identity()));
        assert!(cloud.is_empty());
    }

    #[test]
    fn test_runaway_calibration_dropped() {
        let mut transformer = ScanTransformer::new();
        let far = RigidTransform::new([999.5, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0]).unwrap();
        let frame = ScanFrame::new(0.0, std::f64::consts::PI, vec![1.0, 1.0]);
        let (cloud, stats) = transformer.transform_with_stats(&frame, Some(&far));

        // +x beam lands at 1000.5 (dropped), -x beam at 998.5 (kept)
        assert_eq!(cloud.len(), 1);
        assert_eq!(stats.dropped_out_of_bounds, 1);
        assert_relative_eq!(cloud.points()[0].x, 998.5, epsilon = 1e-9);
    }

    #[test]
    fn test_order_preserved_and_transform_applied() {
        let mut transformer = ScanTransformer::new();
        let xform = RigidTransform::new([0.2, 0.0, 0.1], [0.0, 0.0, 0.0, 1.0]).unwrap();
        let frame = ScanFrame::new(0.0, std::f64::consts::FRAC_PI_2, vec![1.0, f64::NAN, 3.0]);
        let cloud = transformer.transform(&frame, Some(&xform));

        assert_eq!(cloud.len(), 2);
        assert_relative_eq!(cloud.points()[0].x, 1.2, epsilon = 1e-12);
        assert_relative_eq!(cloud.points()[0].z, SCAN_Z_OFFSET + 0.1, epsilon = 1e-12);
        // third beam: angle = PI, range 3
        assert_relative_eq!(cloud.points()[1].x, -2.8, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_calibration_uses_simulated_scan() {
        let mut transformer = ScanTransformer::new();
        let frame = ScanFrame::new(0.0, 0.0, vec![]);
        let (first, stats) = transformer.transform_with_stats(&frame, None);
        assert!(stats.simulated);
        assert_eq!(first.len(), SIMULATED_BEAMS);

        let second = transformer.transform(&frame, None);
        assert_ne!(first, second, "simulated scan should animate");
        assert!(second.iter().all(is_renderable));
    }

    #[test]
    fn test_all_invalid_is_empty_not_error() {
        let mut transformer = ScanTransformer::new();
        let frame = ScanFrame::new(0.0, 0.01, vec![f64::NAN; 10]);
        assert!(transformer.transform(&frame, Some(&RigidTransform::identity())).is_empty());
    }

    fn any_range() -> impl Strategy<Value = f64> {
        prop_oneof![
            -10.0f64..2000.0,
            Just(f64::NAN),
            Just(f64::INFINITY),
            Just(f64::NEG_INFINITY),
            Just(0.0),
        ]
    }

    proptest! {
        #[test]
        fn prop_output_bounded_and_never_longer(
            ranges in prop::collection::vec(any_range(), 0..200),
            angle_min in -4.0f64..4.0,
            angle_increment in -0.1f64..0.1,
            tx in -1500.0f64..1500.0,
            yaw in -3.2f64..3.2,
        ) {
            let half = yaw / 2.0;
            let xform = RigidTransform::new([tx, 0.0, 0.0], [0.0, 0.0, half.sin(), half.cos()]).unwrap();
            let frame = ScanFrame::new(angle_min, angle_increment, ranges);

            let mut transformer = ScanTransformer::new();
            let cloud = transformer.transform(&frame, Some(&xform));

            prop_assert!(cloud.len() <= frame.ranges.len());
            prop_assert!(cloud.iter().all(is_renderable));
        }
    }
}
