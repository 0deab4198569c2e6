//! Scene renderer - camera, lights, footprint mesh, scan cloud and draw loop.
//!
//! # Resource Discipline
//!
//! ```text
//! rebuild_footprint:  release(geometry, material, texture) ─► create(texture, material, geometry) ─► translate(anchor)
//! update_scan:        release(points)                      ─► create(...) ─► translate(anchor)
//! dispose:            stop draw loop ─► release(all) ─► detach surface
//! ```
//!
//! The anchor is `GeometryModel::center()` of the footprint being shown.
//! Footprint mesh, scan cloud and camera target are all derived from it,
//! which keeps them co-registered through rebuilds, resizes and zooms.

use crate::backend::{
    FootprintTexture, FrameInfo, HostSurface, LightDesc, LightKind, MaterialDesc, MeshData, PointStyle,
    RenderBackend, ResourceHandle, SurfaceSize,
};
use crate::config::VisualizerConfig;
use crate::geometry::FootprintPolygon;
use crate::scan::PointCloud;
use geo::TriangulateEarcut;
use nalgebra::{Isometry3, Matrix4, Perspective3, Point2, Point3, Vector3};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RenderError {
    /// The one failure that is shown to the user
    #[error("Host surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("Render backend error: {0}")]
    Backend(String),
}

const FOOTPRINT_MATERIAL: MaterialDesc = MaterialDesc {
    color: [0x29, 0x80, 0xb9, 0xff],
    opacity: 0.6,
};

const SCAN_STYLE: PointStyle = PointStyle {
    color: [0xe7, 0x4c, 0x3c, 0xff],
    radius: 0.02,
};

// =============================================================================
// CAMERA
// =============================================================================

/// Perspective camera looking down the -z axis at the floor plane.
#[derive(Debug, Clone, PartialEq)]
pub struct Camera {
    pub position: Point3<f64>,
    pub target: Point3<f64>,
    pub fov_deg: f64,
    pub aspect: f64,
    pub near: f64,
    pub far: f64,
}

impl Camera {
    pub fn perspective(fov_deg: f64, aspect: f64, distance: f64) -> Self {
        Self {
            position: Point3::new(0.0, 0.0, distance),
            target: Point3::origin(),
            fov_deg,
            aspect,
            near: 0.1,
            far: 1000.0,
        }
    }

    pub fn distance(&self) -> f64 {
        (self.position - self.target).norm()
    }

    pub fn view(&self) -> Isometry3<f64> {
        Isometry3::look_at_rh(&self.position, &self.target, &Vector3::y())
    }

    pub fn projection(&self) -> Perspective3<f64> {
        Perspective3::new(self.aspect, self.fov_deg.to_radians(), self.near, self.far)
    }

    pub fn view_projection(&self) -> Matrix4<f64> {
        self.projection().as_matrix() * self.view().to_homogeneous()
    }
}

// =============================================================================
// DRAW LOOP
// =============================================================================

/// Free-running frame clock owned by the renderer.
///
/// The interval is created on the first `tick` so constructing and
/// initializing a renderer does not need a runtime.
#[derive(Debug)]
struct DrawLoop {
    period: Duration,
    interval: Option<Interval>,
    running: bool,
    frames: u64,
}

impl DrawLoop {
    fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
            running: false,
            frames: 0,
        }
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
        self.interval = None;
    }

    /// Resolves once per period while running; never resolves once stopped.
    async fn tick(&mut self) -> FrameInfo {
        if !self.running {
            return std::future::pending().await;
        }

        let period = self.period;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        interval.tick().await;

        self.frames += 1;
        FrameInfo {
            index: self.frames,
            time: self.frames as f64 * self.period.as_secs_f64(),
        }
    }
}

// =============================================================================
// SCENE RENDERER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FootprintMesh {
    pub geometry: ResourceHandle,
    pub material: ResourceHandle,
    pub texture: Option<ResourceHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanMesh {
    pub points: ResourceHandle,
    pub count: usize,
}

/// Owns every render resource and the draw loop.
pub struct SceneRenderer<B: RenderBackend> {
    backend: B,
    surface: Option<Box<dyn HostSurface>>,
    lifecycle: Lifecycle,

    camera: Camera,
    camera_distance: f64,
    zoom_step: f64,
    min_distance: f64,
    max_distance: f64,

    /// Translation shared by footprint mesh, scan cloud and camera target
    anchor: Vector3<f64>,
    /// Bounding-box center of the displayed footprint, before translation
    footprint_center: Point2<f64>,

    footprint: Option<FootprintMesh>,
    scan: Option<ScanMesh>,
    lights: Vec<ResourceHandle>,
    scan_visible: bool,

    draw_loop: DrawLoop,
}

impl<B: RenderBackend> SceneRenderer<B> {
    pub fn new(backend: B, config: &VisualizerConfig) -> Self {
        Self {
            backend,
            surface: None,
            lifecycle: Lifecycle::Created,
            camera: Camera::perspective(config.camera_fov_deg, 1.0, config.camera_distance),
            camera_distance: config.camera_distance,
            zoom_step: config.zoom_step,
            min_distance: config.min_camera_distance,
            max_distance: config.max_camera_distance,
            anchor: Vector3::zeros(),
            footprint_center: Point2::origin(),
            footprint: None,
            scan: None,
            lights: Vec::new(),
            scan_visible: true,
            draw_loop: DrawLoop::new(config.frame_period()),
        }
    }

    /// Attaches to the host surface and builds the default scene.
    ///
    /// A second call while running is ignored.
    pub fn initialize(&mut self, mut surface: Box<dyn HostSurface>) -> Result<(), RenderError> {
        if self.lifecycle == Lifecycle::Running {
            tracing::warn!("renderer already initialized; dispose first");
            return Ok(());
        }

        surface.attach()?;
        let size = surface.size();
        if let Err(e) = self.backend.attach(size) {
            surface.detach();
            return Err(e);
        }

        if !size.is_empty() {
            self.camera.aspect = size.aspect();
        }
        self.surface = Some(surface);
        self.lifecycle = Lifecycle::Running;

        self.lights.push(self.backend.create_light(&LightDesc {
            kind: LightKind::Ambient,
            color: [0xff, 0xff, 0xff],
            intensity: 0.6,
        }));
        self.lights.push(self.backend.create_light(&LightDesc {
            kind: LightKind::Directional {
                direction: Vector3::new(-0.5, -0.5, -1.0),
            },
            color: [0xff, 0xff, 0xff],
            intensity: 0.8,
        }));

        self.rebuild_footprint(&FootprintPolygon::default_square(), None);
        self.draw_loop.start();

        tracing::info!(width = size.width, height = size.height, "renderer initialized");
        Ok(())
    }

    /// Replaces the footprint mesh and re-anchors the scene on it.
    pub fn rebuild_footprint(&mut self, footprint: &FootprintPolygon, texture: Option<&FootprintTexture>) {
        if self.lifecycle != Lifecycle::Running {
            tracing::debug!("rebuild_footprint ignored: renderer not running");
            return;
        }

        if let Some(old) = self.footprint.take() {
            self.release_footprint(old);
        }

        let mesh = triangulate_footprint(footprint);
        let texture = match texture {
            Some(t) if t.is_consistent() => Some(self.backend.create_texture(t)),
            Some(t) => {
                tracing::warn!(width = t.width, height = t.height, "ignoring malformed footprint texture");
                None
            }
            None => None,
        };
        let material = self.backend.create_material(&FOOTPRINT_MATERIAL, texture);
        let geometry = self.backend.create_geometry(&mesh, material);

        let (cx, cy) = footprint.center_offset();
        self.anchor = Vector3::new(cx, cy, 0.0);
        let bounds = footprint.bounds();
        self.footprint_center = Point2::new(bounds.center_x(), bounds.center_y());

        self.backend.set_translation(geometry, self.anchor);
        if let Some(scan) = self.scan {
            self.backend.set_translation(scan.points, self.anchor);
        }
        self.footprint = Some(FootprintMesh {
            geometry,
            material,
            texture,
        });

        self.apply_camera();
        tracing::debug!(triangles = mesh.triangles.len(), anchor = ?self.anchor, "footprint mesh rebuilt");
    }

    /// Replaces the displayed scan; an empty cloud clears it.
    pub fn update_scan(&mut self, cloud: &PointCloud) {
        if self.lifecycle != Lifecycle::Running {
            tracing::debug!("update_scan ignored: renderer not running");
            return;
        }

        if let Some(old) = self.scan.take() {
            self.backend.release(old.points);
        }
        if cloud.is_empty() {
            return;
        }

        let points = self.backend.create_points(cloud.points(), &SCAN_STYLE);
        self.backend.set_translation(points, self.anchor);
        self.backend.set_visible(points, self.scan_visible);
        self.scan = Some(ScanMesh {
            points,
            count: cloud.len(),
        });
    }

    /// Host surface changed size.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if self.lifecycle != Lifecycle::Running {
            return;
        }
        let size = SurfaceSize::new(width, height);
        if size.is_empty() {
            tracing::debug!(width, height, "ignoring degenerate resize");
            return;
        }

        self.camera.aspect = size.aspect();
        self.backend.resize(size);
        self.apply_camera();
    }

    /// Re-reads the host surface size and applies it.
    pub fn force_resize(&mut self) {
        if let Some(size) = self.surface.as_ref().map(|s| s.size()) {
            self.on_resize(size.width, size.height);
        }
    }

    pub fn center_on_footprint(&mut self) {
        if self.lifecycle == Lifecycle::Running {
            self.apply_camera();
        }
    }

    pub fn zoom_in(&mut self) {
        self.set_camera_distance(self.camera_distance - self.zoom_step);
    }

    pub fn zoom_out(&mut self) {
        self.set_camera_distance(self.camera_distance + self.zoom_step);
    }

    pub fn set_laser_scan_visible(&mut self, visible: bool) {
        self.scan_visible = visible;
        if let (Lifecycle::Running, Some(scan)) = (self.lifecycle, self.scan) {
            self.backend.set_visible(scan.points, visible);
        }
    }

    /// Waits for the next draw-loop tick. Never resolves unless running.
    pub async fn next_frame(&mut self) -> FrameInfo {
        self.draw_loop.tick().await
    }

    /// Presents the current scene for one frame.
    pub fn draw(&mut self, frame: FrameInfo) {
        if self.lifecycle == Lifecycle::Running {
            self.backend.present(frame);
        }
    }

    /// Stops the draw loop and releases everything. Idempotent.
    pub fn dispose(&mut self) {
        if self.lifecycle != Lifecycle::Running {
            tracing::debug!(lifecycle = ?self.lifecycle, "dispose ignored");
            return;
        }

        self.draw_loop.stop();
        if let Some(old) = self.scan.take() {
            self.backend.release(old.points);
        }
        if let Some(old) = self.footprint.take() {
            self.release_footprint(old);
        }
        for light in self.lights.drain(..) {
            self.backend.release(light);
        }
        self.backend.detach();
        if let Some(mut surface) = self.surface.take() {
            surface.detach();
        }

        self.lifecycle = Lifecycle::Disposed;
        tracing::info!(frames = self.draw_loop.frames, "renderer disposed");
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn anchor(&self) -> Vector3<f64> {
        self.anchor
    }

    pub fn footprint_mesh(&self) -> Option<FootprintMesh> {
        self.footprint
    }

    pub fn scan_mesh(&self) -> Option<ScanMesh> {
        self.scan
    }

    pub fn is_scan_visible(&self) -> bool {
        self.scan_visible
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn set_camera_distance(&mut self, distance: f64) {
        self.camera_distance = distance.clamp(self.min_distance, self.max_distance);
        if self.lifecycle == Lifecycle::Running {
            self.apply_camera();
        }
    }

    /// Places the camera above the anchored footprint center.
    fn apply_camera(&mut self) {
        let target = Point3::new(
            self.footprint_center.x + self.anchor.x,
            self.footprint_center.y + self.anchor.y,
            0.0,
        );
        self.camera.target = target;
        self.camera.position = target + Vector3::new(0.0, 0.0, self.camera_distance);
        self.backend.set_camera(&self.camera);
    }

    fn release_footprint(&mut self, mesh: FootprintMesh) {
        self.backend.release(mesh.geometry);
        self.backend.release(mesh.material);
        if let Some(texture) = mesh.texture {
            self.backend.release(texture);
        }
    }
}

/// Ear-clips the footprint into a floor-plane mesh with bbox-normalized UVs.
pub fn triangulate_footprint(footprint: &FootprintPolygon) -> MeshData {
    let raw = footprint.to_polygon().earcut_triangles_raw();
    let bounds = footprint.bounds();
    let span = |extent: f64| if extent > 0.0 { extent } else { 1.0 };

    let mut mesh = MeshData::default();
    for xy in raw.vertices.chunks_exact(2) {
        let (x, y) = (xy[0], xy[1]);
        mesh.vertices.push([x as f32, y as f32, 0.0]);
        mesh.uvs.push([
            ((x - bounds.min_x) / span(bounds.width())) as f32,
            ((y - bounds.min_y) / span(bounds.height())) as f32,
        ]);
    }
    mesh.triangles = raw
        .triangle_indices
        .chunks_exact(3)
        .map(|t| [t[0] as u32, t[1] as u32, t[2] as u32])
        .collect();

    if mesh.triangles.is_empty() {
        tracing::debug!("footprint is degenerate, mesh has no triangles");
    }
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FixedSurface, HeadlessBackend, HeadlessProbe, ResourceKind};
    use crate::geometry::GeometryModel;
    use approx::assert_relative_eq;

    fn running_renderer() -> (SceneRenderer<HeadlessBackend>, HeadlessProbe) {
        let backend = HeadlessBackend::new();
        let probe = backend.probe();
        let mut renderer = SceneRenderer::new(backend, &VisualizerConfig::default());
        renderer
            .initialize(Box::new(FixedSurface::new(800, 600)))
            .unwrap();
        (renderer, probe)
    }

    fn offset_footprint() -> FootprintPolygon {
        let mut model = GeometryModel::new();
        model
            .set_footprint(&[[1.0, 0.0], [3.0, 0.0], [3.0, 1.0], [1.0, 1.0]])
            .unwrap()
            .clone()
    }

    #[test]
    fn test_initialize_builds_default_scene() {
        let (renderer, probe) = running_renderer();
        assert!(renderer.is_running());
        assert!(probe.is_attached());
        assert_eq!(probe.live(ResourceKind::Geometry), 1);
        assert_eq!(probe.live(ResourceKind::Material), 1);
        assert_eq!(probe.live(ResourceKind::Light), 2);

        let camera = probe.camera().unwrap();
        assert_relative_eq!(camera.position.z, 5.0);
        assert_relative_eq!(camera.aspect, 800.0 / 600.0);
        assert_eq!(camera.target, Point3::origin());
    }

    #[test]
    fn test_initialize_twice_is_guarded() {
        let (mut renderer, probe) = running_renderer();
        let created = probe.created_total();
        renderer
            .initialize(Box::new(FixedSurface::new(10, 10)))
            .unwrap();
        assert_eq!(probe.created_total(), created);
    }

    #[test]
    fn test_unattachable_surface_is_an_error() {
        let backend = HeadlessBackend::new();
        let mut renderer = SceneRenderer::new(backend, &VisualizerConfig::default());
        let err = renderer
            .initialize(Box::new(FixedSurface::unavailable()))
            .unwrap_err();
        assert!(matches!(err, RenderError::SurfaceUnavailable(_)));
        assert_eq!(renderer.lifecycle(), Lifecycle::Created);
    }

    #[test]
    fn test_rebuild_releases_previous_mesh() {
        let (mut renderer, probe) = running_renderer();
        let old = renderer.footprint_mesh().unwrap();

        let texture = FootprintTexture {
            width: 2,
            height: 2,
            rgba: vec![0xff; 16],
        };
        renderer.rebuild_footprint(&offset_footprint(), Some(&texture));

        assert!(!probe.is_live(old.geometry));
        assert!(!probe.is_live(old.material));
        assert_eq!(probe.live(ResourceKind::Geometry), 1);
        assert_eq!(probe.live(ResourceKind::Texture), 1);

        let mesh = renderer.footprint_mesh().unwrap();
        assert_eq!(probe.bound_to(mesh.geometry), Some(mesh.material));
        assert_eq!(probe.bound_to(mesh.material), mesh.texture);
        assert!(mesh.texture.is_some());

        renderer.rebuild_footprint(&offset_footprint(), None);
        assert_eq!(probe.live(ResourceKind::Texture), 0);
        assert_eq!(probe.live(ResourceKind::Material), 1);
    }

    #[test]
    fn test_footprint_and_scan_co_registered() {
        let (mut renderer, probe) = running_renderer();
        let footprint = offset_footprint();
        renderer.rebuild_footprint(&footprint, None);
        renderer.update_scan(&PointCloud::from_points([Point3::new(1.0, 0.5, 0.05)]));

        let mesh = renderer.footprint_mesh().unwrap();
        let scan = renderer.scan_mesh().unwrap();
        let mesh_offset = probe.translation(mesh.geometry).unwrap();
        let scan_offset = probe.translation(scan.points).unwrap();

        assert_eq!(mesh_offset, scan_offset);
        assert_relative_eq!(mesh_offset.x, -2.0);
        assert_relative_eq!(mesh_offset.y, -0.5);

        // camera looks at the translated bbox center
        let camera = renderer.camera();
        assert_relative_eq!(camera.target.x, 0.0);
        assert_relative_eq!(camera.target.y, 0.0);
    }

    #[test]
    fn test_rebuild_moves_existing_scan_with_footprint() {
        let (mut renderer, probe) = running_renderer();
        renderer.update_scan(&PointCloud::from_points([Point3::new(1.0, 0.0, 0.05)]));
        renderer.rebuild_footprint(&offset_footprint(), None);

        let scan = renderer.scan_mesh().unwrap();
        assert_eq!(probe.translation(scan.points), Some(renderer.anchor()));
    }

    #[test]
    fn test_update_scan_replaces_and_empty_clears() {
        let (mut renderer, probe) = running_renderer();
        renderer.update_scan(&PointCloud::from_points([Point3::new(1.0, 0.0, 0.0); 4]));
        let first = renderer.scan_mesh().unwrap();
        assert_eq!(probe.point_count(first.points), Some(4));

        renderer.update_scan(&PointCloud::from_points([Point3::new(2.0, 0.0, 0.0); 2]));
        assert!(!probe.is_live(first.points));
        assert_eq!(probe.live(ResourceKind::Points), 1);

        renderer.update_scan(&PointCloud::empty());
        assert!(renderer.scan_mesh().is_none());
        assert_eq!(probe.live(ResourceKind::Points), 0);
    }

    #[test]
    fn test_resize_keeps_centering() {
        let (mut renderer, probe) = running_renderer();
        renderer.rebuild_footprint(&offset_footprint(), None);
        let target = renderer.camera().target;
        let anchor = renderer.anchor();

        renderer.on_resize(1920, 1080);
        assert_relative_eq!(renderer.camera().aspect, 1920.0 / 1080.0);
        assert_eq!(renderer.camera().target, target);
        assert_eq!(renderer.anchor(), anchor);
        assert_eq!(probe.size(), Some(SurfaceSize::new(1920, 1080)));

        renderer.on_resize(0, 1080);
        assert_relative_eq!(renderer.camera().aspect, 1920.0 / 1080.0);
    }

    #[test]
    fn test_force_resize_reads_surface() {
        let backend = HeadlessBackend::new();
        let mut renderer = SceneRenderer::new(backend, &VisualizerConfig::default());
        let surface = FixedSurface::new(400, 400);
        renderer.initialize(Box::new(surface.clone())).unwrap();

        surface.set_size(SurfaceSize::new(1000, 500));
        renderer.force_resize();
        assert_relative_eq!(renderer.camera().aspect, 2.0);
    }

    #[test]
    fn test_zoom_clamped() {
        let (mut renderer, _probe) = running_renderer();
        renderer.zoom_in();
        assert_relative_eq!(renderer.camera().distance(), 4.5);
        for _ in 0..100 {
            renderer.zoom_in();
        }
        assert_relative_eq!(renderer.camera().distance(), 1.0);
        for _ in 0..200 {
            renderer.zoom_out();
        }
        assert_relative_eq!(renderer.camera().distance(), 50.0);
    }

    #[test]
    fn test_scan_visibility_toggle() {
        let (mut renderer, probe) = running_renderer();
        renderer.set_laser_scan_visible(false);
        renderer.update_scan(&PointCloud::from_points([Point3::new(1.0, 0.0, 0.0)]));
        let scan = renderer.scan_mesh().unwrap();
        assert!(!probe.is_visible(scan.points));

        renderer.set_laser_scan_visible(true);
        assert!(probe.is_visible(scan.points));
    }

    #[test]
    fn test_dispose_twice_is_safe() {
        let (mut renderer, probe) = running_renderer();
        renderer.update_scan(&PointCloud::from_points([Point3::new(1.0, 0.0, 0.0)]));

        renderer.dispose();
        renderer.dispose();

        assert_eq!(probe.total_live(), 0);
        assert_eq!(probe.released_total(), probe.created_total());
        assert!(!probe.is_attached());
        assert_eq!(renderer.lifecycle(), Lifecycle::Disposed);

        // late calls are no-ops
        renderer.update_scan(&PointCloud::from_points([Point3::new(1.0, 0.0, 0.0)]));
        renderer.rebuild_footprint(&offset_footprint(), None);
        assert_eq!(probe.total_live(), 0);
    }

    #[test]
    fn test_calls_before_initialize_are_noops() {
        let backend = HeadlessBackend::new();
        let probe = backend.probe();
        let mut renderer = SceneRenderer::new(backend, &VisualizerConfig::default());
        renderer.update_scan(&PointCloud::from_points([Point3::new(1.0, 0.0, 0.0)]));
        renderer.on_resize(100, 100);
        renderer.dispose();
        assert_eq!(probe.created_total(), 0);
    }

    #[test]
    fn test_triangulate_square() {
        let mesh = triangulate_footprint(&FootprintPolygon::default_square());
        assert_eq!(mesh.triangles.len(), 2);
        assert_eq!(mesh.vertices.len(), mesh.uvs.len());
        assert!(mesh
            .uvs
            .iter()
            .all(|[u, v]| (0.0..=1.0).contains(u) && (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_triangulate_concave() {
        let mut model = GeometryModel::new();
        let footprint = model
            .set_footprint(&[[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [1.0, 1.0], [0.0, 2.0]])
            .unwrap();
        let mesh = triangulate_footprint(footprint);
        assert_eq!(mesh.triangles.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_draw_loop_ticks_and_stops_on_dispose() {
        let (mut renderer, probe) = running_renderer();

        for _ in 0..3 {
            let frame = renderer.next_frame().await;
            renderer.draw(frame);
        }
        assert_eq!(probe.frames_presented(), 3);
        let last = probe.last_frame().unwrap();
        assert_eq!(last.index, 3);
        assert_relative_eq!(last.time, 3.0 / 60.0, epsilon = 1e-9);

        renderer.dispose();
        let stalled = tokio::time::timeout(Duration::from_secs(1), renderer.next_frame()).await;
        assert!(stalled.is_err(), "draw loop must stop after dispose");
    }
}
