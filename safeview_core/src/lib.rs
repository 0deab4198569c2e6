//! SafeView Core - laser-scan safety visualization pipeline
//!
//! This library turns a robot's live 2D laser scans into a co-registered 3D
//! view of the scan and the robot footprint:
//! 1. **Geometry**: footprint polygon + laser→base rigid transform, validated
//! 2. **Scan**: polar ranges → bounded, finite body-frame points
//! 3. **Render**: footprint mesh, scan cloud and camera anchored on one offset
//! 4. **Stream**: live socket with a fixed-delay reconnect state machine
//!
//! `VisualizerController` wires these together on a single event loop.

pub mod backend;
pub mod config;
pub mod controller;
pub mod geometry;
pub mod messages;
pub mod render;
pub mod scan;
pub mod stream;

#[cfg(feature = "visualization")]
pub mod visualization;

// Re-export key types for convenience
pub use backend::{FixedSurface, HeadlessBackend, HeadlessProbe, HostSurface, RenderBackend, SurfaceSize};
pub use config::{ConfigError, FootprintResponse, TransformResponse, VisualizerConfig};
pub use controller::{ConfigSource, ControlCommand, ControllerHandle, ControllerStats, VisualizerController};
pub use geometry::{FootprintPolygon, GeometryError, GeometryModel, RigidTransform};
pub use messages::{MessageError, StreamEvent};
pub use render::{Camera, RenderError, SceneRenderer};
pub use scan::{PointCloud, ScanFrame, ScanStats, ScanTransformer};
pub use stream::{ConnectionMachine, ConnectionState, ConnectionStatus, StreamClient};

#[cfg(feature = "visualization")]
pub use visualization::RerunBackend;
