//! Robot geometry - footprint polygon and the laser→base rigid transform.
//!
//! Everything here is pure data plus derivation. The footprint's
//! bounding-box center is the single anchor that the renderer uses to
//! place the camera, the footprint mesh and the scan cloud, so the three
//! can never drift apart.

use crate::config::{FootprintResponse, TransformResponse};
use geo::{BoundingRect, Coord, LineString, Polygon};
use nalgebra::{
    Isometry3, Matrix4, Point2, Point3, Quaternion, Translation3, UnitQuaternion, Vector3,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Half-size of the built-in square footprint (meters).
pub const DEFAULT_FOOTPRINT_HALF_SIZE: f64 = 0.25;

/// Allowed deviation of a configured quaternion from unit norm.
pub const UNIT_NORM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Invalid footprint: {valid} valid points, at least 3 required")]
    InvalidFootprint { valid: usize },

    #[error("Invalid laser transform: {0}")]
    InvalidTransform(String),
}

// =============================================================================
// NUMERIC-ISH INPUT
// =============================================================================

/// Values that configuration sources hand us as "numbers".
///
/// Configuration comes from an HTTP service that is not strict about types,
/// so `"0.25"` and `0.25` must both be accepted.
pub trait Numeric {
    fn to_f64(&self) -> Option<f64>;
}

impl Numeric for f64 {
    fn to_f64(&self) -> Option<f64> {
        Some(*self)
    }
}

impl Numeric for f32 {
    fn to_f64(&self) -> Option<f64> {
        Some(f64::from(*self))
    }
}

impl Numeric for i32 {
    fn to_f64(&self) -> Option<f64> {
        Some(f64::from(*self))
    }
}

impl Numeric for i64 {
    fn to_f64(&self) -> Option<f64> {
        Some(*self as f64)
    }
}

impl Numeric for &str {
    fn to_f64(&self) -> Option<f64> {
        self.trim().parse().ok()
    }
}

impl Numeric for String {
    fn to_f64(&self) -> Option<f64> {
        self.as_str().to_f64()
    }
}

impl Numeric for serde_json::Value {
    fn to_f64(&self) -> Option<f64> {
        match self {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.as_str().to_f64(),
            _ => None,
        }
    }
}

/// Parses a value and rejects NaN/Infinity.
pub fn parse_finite<N: Numeric + ?Sized>(value: &N) -> Option<f64> {
    value.to_f64().filter(|v| v.is_finite())
}

// =============================================================================
// FOOTPRINT
// =============================================================================

/// Axis-aligned bounding box in the body frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center_x(&self) -> f64 {
        (self.min_x + self.max_x) / 2.0
    }

    pub fn center_y(&self) -> f64 {
        (self.min_y + self.max_y) / 2.0
    }
}

/// Closed robot outline in the body frame (last point connects to first).
///
/// Immutable: a new configuration builds a new polygon.
#[derive(Debug, Clone, PartialEq)]
pub struct FootprintPolygon {
    points: Vec<Point2<f64>>,
    centroid: Point2<f64>,
    bounds: Bounds,
}

impl FootprintPolygon {
    /// Builds a polygon from finite points.
    pub fn new(points: Vec<Point2<f64>>) -> Result<Self, GeometryError> {
        let points: Vec<Point2<f64>> = points
            .into_iter()
            .filter(|p| p.x.is_finite() && p.y.is_finite())
            .collect();

        if points.len() < 3 {
            return Err(GeometryError::InvalidFootprint { valid: points.len() });
        }

        let n = points.len() as f64;
        let (sum_x, sum_y) = points
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        let centroid = Point2::new(sum_x / n, sum_y / n);

        let polygon = to_geo_polygon(&points);
        let rect = polygon
            .bounding_rect()
            .ok_or(GeometryError::InvalidFootprint { valid: 0 })?;
        let bounds = Bounds {
            min_x: rect.min().x,
            min_y: rect.min().y,
            max_x: rect.max().x,
            max_y: rect.max().y,
        };

        Ok(Self {
            points,
            centroid,
            bounds,
        })
    }

    /// The ±0.25 m square shown until a real footprint arrives.
    pub fn default_square() -> Self {
        let h = DEFAULT_FOOTPRINT_HALF_SIZE;
        let square = vec![
            Point2::new(-h, -h),
            Point2::new(h, -h),
            Point2::new(h, h),
            Point2::new(-h, h),
        ];
        Self::new(square).unwrap_or_else(|_| unreachable!("default square has four finite points"))
    }

    pub fn points(&self) -> &[Point2<f64>] {
        &self.points
    }

    /// Mean of the vertices (not the area centroid).
    pub fn centroid(&self) -> Point2<f64> {
        self.centroid
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn width(&self) -> f64 {
        self.bounds.width()
    }

    pub fn height(&self) -> f64 {
        self.bounds.height()
    }

    /// Offset that moves the bounding-box center to the origin.
    pub fn center_offset(&self) -> (f64, f64) {
        (-self.bounds.center_x(), -self.bounds.center_y())
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        to_geo_polygon(&self.points)
    }
}

fn to_geo_polygon(points: &[Point2<f64>]) -> Polygon<f64> {
    let ring: Vec<Coord<f64>> = points.iter().map(|p| Coord { x: p.x, y: p.y }).collect();
    Polygon::new(LineString::from(ring), vec![])
}

// =============================================================================
// RIGID TRANSFORM
// =============================================================================

/// Laser→base rigid transform (rotation then translation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidTransform {
    isometry: Isometry3<f64>,
}

impl RigidTransform {
    /// Builds a transform from a position and an `(x, y, z, w)` quaternion.
    pub fn new(position: [f64; 3], orientation: [f64; 4]) -> Result<Self, GeometryError> {
        if position.iter().chain(orientation.iter()).any(|v| !v.is_finite()) {
            return Err(GeometryError::InvalidTransform(
                "non-finite component".to_string(),
            ));
        }

        let [qx, qy, qz, qw] = orientation;
        let quaternion = Quaternion::new(qw, qx, qy, qz);
        let norm = quaternion.norm();
        if (norm - 1.0).abs() > UNIT_NORM_TOLERANCE {
            return Err(GeometryError::InvalidTransform(format!(
                "quaternion norm {norm:.4} is not unit"
            )));
        }

        let rotation = UnitQuaternion::from_quaternion(quaternion);
        let translation = Translation3::new(position[0], position[1], position[2]);

        Ok(Self {
            isometry: Isometry3::from_parts(translation, rotation),
        })
    }

    pub fn identity() -> Self {
        Self {
            isometry: Isometry3::identity(),
        }
    }

    pub fn translation(&self) -> Vector3<f64> {
        self.isometry.translation.vector
    }

    pub fn rotation(&self) -> UnitQuaternion<f64> {
        self.isometry.rotation
    }

    /// 4×4 homogeneous matrix.
    pub fn to_homogeneous(&self) -> Matrix4<f64> {
        self.isometry.to_homogeneous()
    }

    /// Maps a laser-frame point into the body frame.
    pub fn apply(&self, point: &Point3<f64>) -> Point3<f64> {
        self.isometry * point
    }
}

// =============================================================================
// GEOMETRY MODEL
// =============================================================================

/// Owner of the current footprint and laser calibration.
#[derive(Debug, Clone)]
pub struct GeometryModel {
    footprint: FootprintPolygon,
    is_default: bool,
    laser_to_base: Option<RigidTransform>,
}

impl GeometryModel {
    pub fn new() -> Self {
        Self {
            footprint: FootprintPolygon::default_square(),
            is_default: true,
            laser_to_base: None,
        }
    }

    /// Replaces the footprint.
    ///
    /// Pairs with an unparseable or non-finite coordinate are dropped. If
    /// fewer than three pairs survive, the previous footprint is kept.
    pub fn set_footprint<N: Numeric>(&mut self, points: &[[N; 2]]) -> Result<&FootprintPolygon, GeometryError> {
        let parsed: Vec<Point2<f64>> = points
            .iter()
            .filter_map(|[x, y]| Some(Point2::new(parse_finite(x)?, parse_finite(y)?)))
            .collect();

        let dropped = points.len() - parsed.len();
        if dropped > 0 {
            tracing::debug!(dropped, "ignored malformed footprint points");
        }

        let footprint = FootprintPolygon::new(parsed)?;
        self.footprint = footprint;
        self.is_default = false;

        tracing::info!(
            vertices = self.footprint.points().len(),
            width = self.footprint.width(),
            height = self.footprint.height(),
            "footprint updated"
        );

        Ok(&self.footprint)
    }

    /// Replaces the laser→base transform.
    ///
    /// Any missing, non-finite or non-unit input stores Absent and logs;
    /// this never fails the caller.
    pub fn set_laser_to_base_transform<N: Numeric>(
        &mut self,
        position: &[N],
        orientation: &[N],
    ) -> Option<&RigidTransform> {
        self.laser_to_base = match parse_transform(position, orientation) {
            Ok(xform) => {
                tracing::info!(
                    translation = ?xform.translation(),
                    "laser transform updated"
                );
                Some(xform)
            }
            Err(e) => {
                tracing::warn!("laser transform unavailable: {e}");
                None
            }
        };
        self.laser_to_base.as_ref()
    }

    /// Drops the calibration (e.g. the config service reported none).
    pub fn clear_laser_to_base_transform(&mut self) {
        self.laser_to_base = None;
    }

    /// Applies a footprint configuration response.
    pub fn apply_footprint_response(
        &mut self,
        response: &FootprintResponse,
    ) -> Result<&FootprintPolygon, GeometryError> {
        self.set_footprint(&response.pairs())
    }

    /// Applies a transform configuration response; missing fields yield Absent.
    pub fn apply_transform_response(&mut self, response: &TransformResponse) -> Option<&RigidTransform> {
        match (&response.position, &response.orientation) {
            (Some(position), Some(orientation)) => {
                self.set_laser_to_base_transform(position.as_slice(), orientation.as_slice())
            }
            _ => {
                tracing::warn!("laser transform unavailable: Position/Orientation missing");
                self.laser_to_base = None;
                None
            }
        }
    }

    /// `(-bounds.center_x, -bounds.center_y)` of the current footprint.
    pub fn center(&self) -> (f64, f64) {
        self.footprint.center_offset()
    }

    pub fn footprint(&self) -> &FootprintPolygon {
        &self.footprint
    }

    pub fn is_default_footprint(&self) -> bool {
        self.is_default
    }

    pub fn laser_to_base(&self) -> Option<&RigidTransform> {
        self.laser_to_base.as_ref()
    }
}

impl Default for GeometryModel {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_transform<N: Numeric>(position: &[N], orientation: &[N]) -> Result<RigidTransform, GeometryError> {
    if position.len() != 3 || orientation.len() != 4 {
        return Err(GeometryError::InvalidTransform(format!(
            "expected 3 position and 4 orientation values, got {} and {}",
            position.len(),
            orientation.len()
        )));
    }

    let mut values = [0.0; 7];
    for (slot, raw) in values.iter_mut().zip(position.iter().chain(orientation.iter())) {
        *slot = parse_finite(raw)
            .ok_or_else(|| GeometryError::InvalidTransform("missing or non-numeric component".to_string()))?;
    }

    RigidTransform::new(
        [values[0], values[1], values[2]],
        [values[3], values[4], values[5], values[6]],
    )
}
