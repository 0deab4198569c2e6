//! Render backend seam and the headless backend.
//!
//! The renderer never talks to a graphics API directly. Everything that
//! would be a GPU object (geometry buffer, material, texture, point sprite
//! buffer, light) is an opaque `ResourceHandle` created and released through
//! `RenderBackend`, so the release-old-before-build-new discipline can be
//! checked by counting live handles.

use crate::render::{Camera, RenderError};
use nalgebra::{Point3, Vector3};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Opaque id of a backend-side resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceHandle(pub u64);

impl std::fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Geometry,
    Material,
    Texture,
    Points,
    Light,
}

/// Pixel size of the output surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect(&self) -> f64 {
        f64::from(self.width) / f64::from(self.height.max(1))
    }
}

/// Triangulated mesh in the body frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<[f32; 3]>,
    pub triangles: Vec<[u32; 3]>,
    pub uvs: Vec<[f32; 2]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialDesc {
    pub color: [u8; 4],
    pub opacity: f32,
}

/// RGBA8 image draped over the footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct FootprintTexture {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl FootprintTexture {
    /// True if the buffer length matches the declared size.
    pub fn is_consistent(&self) -> bool {
        self.rgba.len() == (self.width as usize) * (self.height as usize) * 4
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointStyle {
    pub color: [u8; 4],
    pub radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LightKind {
    Ambient,
    Directional { direction: Vector3<f64> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LightDesc {
    pub kind: LightKind,
    pub color: [u8; 3],
    pub intensity: f32,
}

/// Draw-loop timing handed to `present`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub index: u64,
    /// Animation time in seconds
    pub time: f64,
}

/// GPU-facing operations needed by `SceneRenderer`.
///
/// Releasing a handle the backend does not know is a no-op.
pub trait RenderBackend: Send {
    fn attach(&mut self, size: SurfaceSize) -> Result<(), RenderError>;
    fn detach(&mut self);
    fn resize(&mut self, size: SurfaceSize);

    /// `material` is created first and bound to the geometry for its lifetime.
    fn create_geometry(&mut self, mesh: &MeshData, material: ResourceHandle) -> ResourceHandle;
    fn create_material(&mut self, material: &MaterialDesc, texture: Option<ResourceHandle>) -> ResourceHandle;
    fn create_texture(&mut self, texture: &FootprintTexture) -> ResourceHandle;
    fn create_points(&mut self, points: &[Point3<f64>], style: &PointStyle) -> ResourceHandle;
    fn create_light(&mut self, light: &LightDesc) -> ResourceHandle;

    fn set_translation(&mut self, handle: ResourceHandle, offset: Vector3<f64>);
    fn set_visible(&mut self, handle: ResourceHandle, visible: bool);
    fn set_camera(&mut self, camera: &Camera);

    fn release(&mut self, handle: ResourceHandle);
    fn present(&mut self, frame: FrameInfo);
}

// =============================================================================
// HOST SURFACE
// =============================================================================

/// The drawing surface the host UI gives us.
pub trait HostSurface: Send {
    fn size(&self) -> SurfaceSize;
    fn attach(&mut self) -> Result<(), RenderError>;
    fn detach(&mut self);
}

/// Surface with a settable size; used by the viewer binary and tests.
#[derive(Debug, Clone)]
pub struct FixedSurface {
    size: Arc<Mutex<SurfaceSize>>,
    available: bool,
    attached: bool,
}

impl FixedSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Arc::new(Mutex::new(SurfaceSize::new(width, height))),
            available: true,
            attached: false,
        }
    }

    /// A surface that refuses to attach.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new(0, 0)
        }
    }

    /// Changes the size seen by later `size()` calls (shared between clones).
    pub fn set_size(&self, size: SurfaceSize) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

impl HostSurface for FixedSurface {
    fn size(&self) -> SurfaceSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach(&mut self) -> Result<(), RenderError> {
        if !self.available {
            return Err(RenderError::SurfaceUnavailable(
                "host surface is not attachable".to_string(),
            ));
        }
        self.attached = true;
        Ok(())
    }

    fn detach(&mut self) {
        self.attached = false;
    }
}

// =============================================================================
// HEADLESS BACKEND
// =============================================================================

#[derive(Debug, Default)]
struct HeadlessState {
    next_id: u64,
    live: HashMap<ResourceHandle, ResourceKind>,
    translations: HashMap<ResourceHandle, Vector3<f64>>,
    hidden: HashMap<ResourceHandle, bool>,
    /// geometry → material, material → texture
    bindings: HashMap<ResourceHandle, ResourceHandle>,
    point_counts: HashMap<ResourceHandle, usize>,
    /// Largest |coordinate| of any point ever submitted
    max_abs_coordinate: f64,
    created_total: u64,
    released_total: u64,
    attached: bool,
    size: Option<SurfaceSize>,
    camera: Option<Camera>,
    frames_presented: u64,
    last_frame: Option<FrameInfo>,
}

impl HeadlessState {
    fn create(&mut self, kind: ResourceKind) -> ResourceHandle {
        self.next_id += 1;
        self.created_total += 1;
        let handle = ResourceHandle(self.next_id);
        self.live.insert(handle, kind);
        handle
    }
}

/// Backend that renders nothing and keeps books on every resource.
#[derive(Debug, Clone, Default)]
pub struct HeadlessBackend {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only view that stays valid after the backend moves into a renderer.
    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut HeadlessState) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RenderBackend for HeadlessBackend {
    fn attach(&mut self, size: SurfaceSize) -> Result<(), RenderError> {
        self.with(|s| {
            s.attached = true;
            s.size = Some(size);
        });
        Ok(())
    }

    fn detach(&mut self) {
        self.with(|s| s.attached = false);
    }

    fn resize(&mut self, size: SurfaceSize) {
        self.with(|s| s.size = Some(size));
    }

    fn create_geometry(&mut self, _mesh: &MeshData, material: ResourceHandle) -> ResourceHandle {
        self.with(|s| {
            let handle = s.create(ResourceKind::Geometry);
            if s.live.contains_key(&material) {
                s.bindings.insert(handle, material);
            }
            handle
        })
    }

    fn create_material(&mut self, _material: &MaterialDesc, texture: Option<ResourceHandle>) -> ResourceHandle {
        self.with(|s| {
            let handle = s.create(ResourceKind::Material);
            if let Some(texture) = texture.filter(|t| s.live.contains_key(t)) {
                s.bindings.insert(handle, texture);
            }
            handle
        })
    }

    fn create_texture(&mut self, _texture: &FootprintTexture) -> ResourceHandle {
        self.with(|s| s.create(ResourceKind::Texture))
    }

    fn create_points(&mut self, points: &[Point3<f64>], _style: &PointStyle) -> ResourceHandle {
        self.with(|s| {
            let handle = s.create(ResourceKind::Points);
            s.point_counts.insert(handle, points.len());
            s.max_abs_coordinate = points
                .iter()
                .flat_map(|p| p.coords.iter().map(|c| c.abs()))
                .fold(s.max_abs_coordinate, f64::max);
            handle
        })
    }

    fn create_light(&mut self, _light: &LightDesc) -> ResourceHandle {
        self.with(|s| s.create(ResourceKind::Light))
    }

    fn set_translation(&mut self, handle: ResourceHandle, offset: Vector3<f64>) {
        self.with(|s| {
            if s.live.contains_key(&handle) {
                s.translations.insert(handle, offset);
            }
        });
    }

    fn set_visible(&mut self, handle: ResourceHandle, visible: bool) {
        self.with(|s| {
            if s.live.contains_key(&handle) {
                s.hidden.insert(handle, !visible);
            }
        });
    }

    fn set_camera(&mut self, camera: &Camera) {
        self.with(|s| s.camera = Some(camera.clone()));
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.with(|s| {
            if s.live.remove(&handle).is_some() {
                s.released_total += 1;
                s.translations.remove(&handle);
                s.hidden.remove(&handle);
                s.bindings.remove(&handle);
                s.point_counts.remove(&handle);
            }
        });
    }

    fn present(&mut self, frame: FrameInfo) {
        self.with(|s| {
            s.frames_presented += 1;
            s.last_frame = Some(frame);
        });
    }
}

/// Observer half of a `HeadlessBackend`.
#[derive(Debug, Clone)]
pub struct HeadlessProbe {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessProbe {
    fn with<R>(&self, f: impl FnOnce(&HeadlessState) -> R) -> R {
        f(&self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn live(&self, kind: ResourceKind) -> usize {
        self.with(|s| s.live.values().filter(|k| **k == kind).count())
    }

    pub fn total_live(&self) -> usize {
        self.with(|s| s.live.len())
    }

    pub fn created_total(&self) -> u64 {
        self.with(|s| s.created_total)
    }

    pub fn released_total(&self) -> u64 {
        self.with(|s| s.released_total)
    }

    pub fn is_live(&self, handle: ResourceHandle) -> bool {
        self.with(|s| s.live.contains_key(&handle))
    }

    pub fn translation(&self, handle: ResourceHandle) -> Option<Vector3<f64>> {
        self.with(|s| s.translations.get(&handle).copied())
    }

    /// Translations of every live resource of `kind`.
    pub fn live_translations(&self, kind: ResourceKind) -> Vec<Vector3<f64>> {
        self.with(|s| {
            s.live
                .iter()
                .filter(|(_, k)| **k == kind)
                .filter_map(|(h, _)| s.translations.get(h).copied())
                .collect()
        })
    }

    pub fn max_abs_coordinate(&self) -> f64 {
        self.with(|s| s.max_abs_coordinate)
    }

    pub fn is_visible(&self, handle: ResourceHandle) -> bool {
        self.with(|s| s.live.contains_key(&handle) && !s.hidden.get(&handle).copied().unwrap_or(false))
    }

    /// Material bound to a geometry, or texture bound to a material.
    pub fn bound_to(&self, handle: ResourceHandle) -> Option<ResourceHandle> {
        self.with(|s| s.bindings.get(&handle).copied())
    }

    pub fn point_count(&self, handle: ResourceHandle) -> Option<usize> {
        self.with(|s| s.point_counts.get(&handle).copied())
    }

    pub fn is_attached(&self) -> bool {
        self.with(|s| s.attached)
    }

    pub fn size(&self) -> Option<SurfaceSize> {
        self.with(|s| s.size)
    }

    pub fn camera(&self) -> Option<Camera> {
        self.with(|s| s.camera.clone())
    }

    pub fn frames_presented(&self) -> u64 {
        self.with(|s| s.frames_presented)
    }

    pub fn last_frame(&self) -> Option<FrameInfo> {
        self.with(|s| s.last_frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_counts_and_double_release() {
        let mut backend = HeadlessBackend::new();
        let probe = backend.probe();

        let material = backend.create_material(
            &MaterialDesc {
                color: [0, 0, 255, 255],
                opacity: 0.6,
            },
            None,
        );
        let geometry = backend.create_geometry(&MeshData::default(), material);
        let points = backend.create_points(&[Point3::origin(); 3], &PointStyle {
            color: [255, 0, 0, 255],
            radius: 0.02,
        });
        assert_eq!(probe.total_live(), 3);
        assert_eq!(probe.point_count(points), Some(3));
        assert_eq!(probe.bound_to(geometry), Some(material));

        backend.release(geometry);
        backend.release(geometry);
        assert_eq!(probe.live(ResourceKind::Geometry), 0);
        assert_eq!(probe.released_total(), 1);
        assert!(probe.bound_to(geometry).is_none());

        backend.set_translation(geometry, Vector3::new(1.0, 0.0, 0.0));
        assert!(probe.translation(geometry).is_none());
    }

    #[test]
    fn test_fixed_surface_shared_size() {
        let surface = FixedSurface::new(640, 480);
        let clone = surface.clone();
        clone.set_size(SurfaceSize::new(800, 400));
        assert_eq!(surface.size(), SurfaceSize::new(800, 400));
        assert!((surface.size().aspect() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_unavailable_surface() {
        let mut surface = FixedSurface::unavailable();
        assert!(matches!(surface.attach(), Err(RenderError::SurfaceUnavailable(_))));
        assert!(!surface.is_attached());
    }
}
