//! Rerun render backend.
//!
//! Maps backend resources onto Rerun entities:
//!
//! - Footprint geometry → `world/footprint/<id>` (`Mesh3D`, colored and
//!   textured by its material)
//! - Scan cloud → `world/scan/<id>` (`Points3D`)
//! - Camera → `world/camera` (`Transform3D` + `Pinhole`)
//! - Translations → `Transform3D` on the entity itself
//!
//! Materials and textures have no entity of their own; they are folded into
//! the mesh when it is logged. Hidden entities are cleared and re-logged from
//! the cached archetype when shown again. Released resources are cleared.
//! Enable with the `visualization` feature.

use crate::backend::{
    FootprintTexture, FrameInfo, LightDesc, MaterialDesc, MeshData, PointStyle, RenderBackend, ResourceHandle,
    SurfaceSize,
};
use crate::render::{Camera, RenderError};
use nalgebra::{Point3, Vector3};
use rerun::{RecordingStream, RecordingStreamBuilder};
use std::collections::{HashMap, HashSet};

const CAMERA_PATH: &str = "world/camera";

struct Material {
    color: [u8; 4],
    texture: Option<ResourceHandle>,
}

pub struct RerunBackend {
    rec: RecordingStream,
    entities: HashMap<ResourceHandle, String>,
    materials: HashMap<ResourceHandle, Material>,
    textures: HashMap<ResourceHandle, FootprintTexture>,
    clouds: HashMap<ResourceHandle, rerun::Points3D>,
    hidden: HashSet<ResourceHandle>,
    next_id: u64,
}

impl RerunBackend {
    /// Spawns a Rerun viewer and streams to it.
    pub fn spawn(app_id: &str) -> Result<Self, RenderError> {
        let rec = RecordingStreamBuilder::new(app_id)
            .spawn()
            .map_err(|e| RenderError::Backend(e.to_string()))?;
        Ok(Self::with_stream(rec))
    }

    /// Records to an `.rrd` file instead of a live viewer.
    pub fn save(app_id: &str, path: &str) -> Result<Self, RenderError> {
        let rec = RecordingStreamBuilder::new(app_id)
            .save(path)
            .map_err(|e| RenderError::Backend(e.to_string()))?;
        Ok(Self::with_stream(rec))
    }

    pub fn with_stream(rec: RecordingStream) -> Self {
        Self {
            rec,
            entities: HashMap::new(),
            materials: HashMap::new(),
            textures: HashMap::new(),
            clouds: HashMap::new(),
            hidden: HashSet::new(),
            next_id: 0,
        }
    }

    fn allocate(&mut self) -> ResourceHandle {
        self.next_id += 1;
        ResourceHandle(self.next_id)
    }

    fn register(&mut self, prefix: &str) -> (ResourceHandle, String) {
        let handle = self.allocate();
        let path = format!("{prefix}/{}", handle.0);
        self.entities.insert(handle, path.clone());
        (handle, path)
    }

    fn check(&self, what: &str, result: rerun::RecordingStreamResult<()>) {
        if let Err(e) = result {
            tracing::warn!("rerun {what} failed: {e}");
        }
    }
}

fn rgba(color: [u8; 4]) -> rerun::Color {
    rerun::Color::from_unmultiplied_rgba(color[0], color[1], color[2], color[3])
}

impl RenderBackend for RerunBackend {
    fn attach(&mut self, size: SurfaceSize) -> Result<(), RenderError> {
        self.rec
            .log_static("world", &rerun::ViewCoordinates::RIGHT_HAND_Z_UP())
            .map_err(|e| RenderError::Backend(e.to_string()))?;
        tracing::info!(width = size.width, height = size.height, "rerun backend attached");
        Ok(())
    }

    fn detach(&mut self) {
        let result = self.rec.log("world", &rerun::Clear::recursive());
        self.check("clear", result);
        self.entities.clear();
        self.materials.clear();
        self.textures.clear();
        self.clouds.clear();
        self.hidden.clear();
    }

    fn resize(&mut self, size: SurfaceSize) {
        tracing::debug!(width = size.width, height = size.height, "rerun viewport resized");
    }

    fn create_geometry(&mut self, mesh: &MeshData, material: ResourceHandle) -> ResourceHandle {
        let (handle, path) = self.register("world/footprint");
        let (color, texture) = match self.materials.get(&material) {
            Some(m) => (m.color, m.texture.and_then(|t| self.textures.get(&t))),
            None => ([0xff, 0xff, 0xff, 0xff], None),
        };

        let mut archetype = rerun::Mesh3D::new(mesh.vertices.iter().copied())
            .with_triangle_indices(mesh.triangles.iter().copied())
            .with_vertex_texcoords(mesh.uvs.iter().copied())
            .with_vertex_colors(vec![rgba(color); mesh.vertices.len()]);
        if let Some(texture) = texture {
            archetype = archetype.with_albedo_texture(
                rerun::components::ImageFormat::rgba8([texture.width, texture.height]),
                texture.rgba.clone(),
            );
        }

        let result = self.rec.log(path.as_str(), &archetype);
        self.check("mesh", result);
        handle
    }

    fn create_material(&mut self, material: &MaterialDesc, texture: Option<ResourceHandle>) -> ResourceHandle {
        let alpha = (material.opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
        let handle = self.allocate();
        self.materials.insert(handle, Material {
            color: [material.color[0], material.color[1], material.color[2], alpha],
            texture,
        });
        handle
    }

    fn create_texture(&mut self, texture: &FootprintTexture) -> ResourceHandle {
        let handle = self.allocate();
        self.textures.insert(handle, texture.clone());
        handle
    }

    fn create_points(&mut self, points: &[Point3<f64>], style: &PointStyle) -> ResourceHandle {
        let (handle, path) = self.register("world/scan");
        let positions: Vec<[f32; 3]> = points
            .iter()
            .map(|p| [p.x as f32, p.y as f32, p.z as f32])
            .collect();
        let archetype = rerun::Points3D::new(positions)
            .with_colors([rgba(style.color)])
            .with_radii([style.radius]);
        let result = self.rec.log(path.as_str(), &archetype);
        self.check("points", result);
        self.clouds.insert(handle, archetype);
        handle
    }

    fn create_light(&mut self, light: &LightDesc) -> ResourceHandle {
        // Rerun lights its own scene
        tracing::trace!(kind = ?light.kind, "light ignored by rerun backend");
        self.allocate()
    }

    fn set_translation(&mut self, handle: ResourceHandle, offset: Vector3<f64>) {
        let Some(path) = self.entities.get(&handle) else {
            return;
        };
        let transform = rerun::Transform3D::from_translation([offset.x as f32, offset.y as f32, offset.z as f32]);
        let result = self.rec.log(path.as_str(), &transform);
        self.check("transform", result);
    }

    fn set_visible(&mut self, handle: ResourceHandle, visible: bool) {
        let Some(path) = self.entities.get(&handle) else {
            return;
        };
        if !visible {
            if self.hidden.insert(handle) {
                let result = self.rec.log(path.as_str(), &rerun::Clear::flat());
                self.check("hide", result);
            }
            return;
        }
        if !self.hidden.remove(&handle) {
            return;
        }
        if let Some(cloud) = self.clouds.get(&handle) {
            let result = self.rec.log(path.as_str(), cloud);
            self.check("show", result);
        }
    }

    fn set_camera(&mut self, camera: &Camera) {
        let p = camera.position;
        // Looking straight down: camera RDF axes are world x, -y, -z
        let transform = rerun::Transform3D::from_translation([p.x as f32, p.y as f32, p.z as f32])
            .with_quaternion(rerun::Quaternion::from_xyzw([1.0, 0.0, 0.0, 0.0]));
        let pinhole = rerun::Pinhole::from_fov_and_aspect_ratio(camera.fov_deg.to_radians() as f32, camera.aspect as f32);

        let result = self.rec.log(CAMERA_PATH, &transform);
        self.check("camera transform", result);
        let result = self.rec.log(CAMERA_PATH, &pinhole);
        self.check("camera pinhole", result);
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.materials.remove(&handle);
        self.textures.remove(&handle);
        self.clouds.remove(&handle);
        self.hidden.remove(&handle);
        if let Some(path) = self.entities.remove(&handle) {
            let result = self.rec.log(path.as_str(), &rerun::Clear::recursive());
            self.check("release", result);
        }
    }

    fn present(&mut self, frame: FrameInfo) {
        self.rec.set_time_sequence("frame", frame.index as i64);
        self.rec.set_duration_secs("frame_time", frame.time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires Rerun viewer
    fn test_rerun_backend_spawn() {
        assert!(RerunBackend::spawn("safeview_test").is_ok());
    }

    fn disabled_backend() -> RerunBackend {
        RerunBackend::with_stream(RecordingStream::disabled())
    }

    #[test]
    fn test_mesh_bound_to_material_and_texture() {
        let mut backend = disabled_backend();
        let texture = backend.create_texture(&FootprintTexture {
            width: 1,
            height: 1,
            rgba: vec![0xff; 4],
        });
        let material = backend.create_material(
            &MaterialDesc {
                color: [0x29, 0x80, 0xb9, 0xff],
                opacity: 0.6,
            },
            Some(texture),
        );
        let geometry = backend.create_geometry(&MeshData::default(), material);

        assert_eq!(backend.materials[&material].color, [0x29, 0x80, 0xb9, 153]);
        assert_eq!(backend.materials[&material].texture, Some(texture));
        assert!(backend.entities.contains_key(&geometry));

        backend.release(texture);
        backend.release(material);
        assert!(backend.textures.is_empty());
        assert!(backend.materials.is_empty());
    }

    #[test]
    fn test_hidden_cloud_is_restored() {
        let mut backend = disabled_backend();
        let points = backend.create_points(&[Point3::new(1.0, 0.0, 0.0)], &PointStyle {
            color: [0xff, 0, 0, 0xff],
            radius: 0.02,
        });

        backend.set_visible(points, false);
        assert!(backend.hidden.contains(&points));

        backend.set_visible(points, true);
        assert!(!backend.hidden.contains(&points));
        assert!(backend.clouds.contains_key(&points));

        backend.release(points);
        assert!(backend.clouds.is_empty());
    }
}
