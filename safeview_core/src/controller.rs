//! Visualizer controller - wires the stream into the scene and owns lifecycle.
//!
//! One controller drives one view. Everything runs on a single event loop:
//!
//! ```text
//!                 ┌──────────────────────────────────────────┐
//! draw tick ─────►│                                          │──► SceneRenderer::draw
//! StreamEvent ───►│  VisualizerController::run (select!)     │──► ScanTransformer ─► update_scan
//! SurfaceSize ───►│                                          │──► on_resize
//! ControlCommand ►│                                          │──► brake watch
//!                 └──────────────────────────────────────────┘
//! ```
//!
//! Each handler runs to completion before the next event is taken, so a
//! scan is transformed and committed atomically with respect to the others.

use crate::backend::{FootprintTexture, HostSurface, RenderBackend, SurfaceSize};
use crate::config::{FootprintResponse, TransformResponse, VisualizerConfig};
use crate::geometry::GeometryModel;
use crate::messages::StreamEvent;
use crate::render::{RenderError, SceneRenderer};
use crate::scan::{ScanFrame, ScanTransformer};
use crate::stream::{ConnectionStatus, StreamClient};
use safeview_env::{StreamTransport, ViewerContext};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Commands accepted from the host UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    CenterOnFootprint,
    ZoomIn,
    ZoomOut,
    SetLaserScanVisible(bool),
    ForceResize,
    /// New footprint from the configuration service
    UpdateFootprint(FootprintResponse),
    /// New laser calibration from the configuration service
    UpdateTransform(TransformResponse),
    /// Ends `run`
    Shutdown,
}

/// Configuration known at mount time. Either response may be missing.
#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub footprint: Option<FootprintResponse>,
    pub transform: Option<TransformResponse>,
    pub texture: Option<FootprintTexture>,
}

/// Running counters for status logs and the simulation harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerStats {
    pub scans: u64,
    pub simulated_scans: u64,
    pub points_last_scan: usize,
    pub beams_dropped: u64,
    pub brake_updates: u64,
    pub resizes: u64,
    pub frames_drawn: u64,
    pub commands: u64,
}

/// Cloneable remote control for a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<ControlCommand>,
    brake: watch::Receiver<Option<bool>>,
}

impl ControllerHandle {
    /// Queues a command. False if the controller is gone.
    pub fn send(&self, command: ControlCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn center_on_footprint(&self) -> bool {
        self.send(ControlCommand::CenterOnFootprint)
    }

    pub fn zoom_in(&self) -> bool {
        self.send(ControlCommand::ZoomIn)
    }

    pub fn zoom_out(&self) -> bool {
        self.send(ControlCommand::ZoomOut)
    }

    pub fn set_laser_scan_visible(&self, visible: bool) -> bool {
        self.send(ControlCommand::SetLaserScanVisible(visible))
    }

    pub fn force_resize(&self) -> bool {
        self.send(ControlCommand::ForceResize)
    }

    pub fn shutdown(&self) -> bool {
        self.send(ControlCommand::Shutdown)
    }

    /// Latest brake status; `None` until the first `brake_update`.
    pub fn brake_status(&self) -> Option<bool> {
        *self.brake.borrow()
    }

    pub fn subscribe_brake(&self) -> watch::Receiver<Option<bool>> {
        self.brake.clone()
    }
}

pub struct VisualizerController<B: RenderBackend> {
    config: VisualizerConfig,
    geometry: GeometryModel,
    transformer: ScanTransformer,
    renderer: SceneRenderer<B>,
    texture: Option<FootprintTexture>,

    stream: Option<StreamClient>,
    events: Option<mpsc::Receiver<StreamEvent>>,
    resizes: Option<mpsc::Receiver<SurfaceSize>>,

    commands_tx: mpsc::UnboundedSender<ControlCommand>,
    commands_rx: mpsc::UnboundedReceiver<ControlCommand>,
    brake: watch::Sender<Option<bool>>,

    stats: ControllerStats,
    mounted: bool,
}

impl<B: RenderBackend> VisualizerController<B> {
    pub fn new(backend: B, config: VisualizerConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (brake, _) = watch::channel(None);
        Self {
            renderer: SceneRenderer::new(backend, &config),
            config,
            geometry: GeometryModel::new(),
            transformer: ScanTransformer::new(),
            texture: None,
            stream: None,
            events: None,
            resizes: None,
            commands_tx,
            commands_rx,
            brake,
            stats: ControllerStats::default(),
            mounted: false,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            commands: self.commands_tx.clone(),
            brake: self.brake.subscribe(),
        }
    }

    /// Applies configuration, attaches the renderer and builds the footprint.
    ///
    /// Bad configuration falls back to defaults; only an unusable surface
    /// is an error.
    pub fn mount(&mut self, source: ConfigSource, surface: Box<dyn HostSurface>) -> Result<(), RenderError> {
        if self.mounted {
            tracing::warn!("controller already mounted");
            return Ok(());
        }

        match &source.footprint {
            Some(response) => {
                if let Err(e) = self.geometry.apply_footprint_response(response) {
                    tracing::warn!("footprint rejected, keeping default: {e}");
                }
            }
            None => tracing::warn!("no footprint configured, using default"),
        }
        match &source.transform {
            Some(response) => {
                self.geometry.apply_transform_response(response);
            }
            None => tracing::warn!("no laser transform configured"),
        }
        self.texture = source.texture;

        self.renderer.initialize(surface)?;
        self.rebuild_footprint();
        self.mounted = true;

        tracing::info!(
            default_footprint = self.geometry.is_default_footprint(),
            calibrated = self.geometry.laser_to_base().is_some(),
            "visualizer mounted"
        );
        Ok(())
    }

    /// Starts the stream client on `ctx`.
    pub fn connect<C, T>(&mut self, ctx: Arc<C>, transport: Arc<T>)
    where
        C: ViewerContext,
        T: StreamTransport,
    {
        if let Some(mut previous) = self.stream.take() {
            previous.dispose();
        }
        let (client, events) = StreamClient::spawn(ctx, transport, &self.config);
        self.stream = Some(client);
        self.events = Some(events);
    }

    /// Routes host resize notifications into the loop.
    pub fn attach_resizes(&mut self, resizes: mpsc::Receiver<SurfaceSize>) {
        self.resizes = Some(resizes);
    }

    /// Runs the event loop until `Shutdown` is received.
    pub async fn run(&mut self) {
        if !self.mounted {
            tracing::warn!("run called before mount");
            return;
        }

        loop {
            tokio::select! {
                frame = self.renderer.next_frame() => {
                    self.renderer.draw(frame);
                    self.stats.frames_drawn += 1;
                }
                event = recv_or_pending(&mut self.events) => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        tracing::debug!("stream event channel closed");
                        self.events = None;
                    }
                },
                size = recv_or_pending(&mut self.resizes) => match size {
                    Some(size) => {
                        self.stats.resizes += 1;
                        self.renderer.on_resize(size.width, size.height);
                    }
                    None => self.resizes = None,
                },
                Some(command) = self.commands_rx.recv() => {
                    if command == ControlCommand::Shutdown {
                        tracing::info!("controller shutdown requested");
                        break;
                    }
                    self.handle_command(command);
                }
            }
        }
    }

    /// Handles one decoded stream message.
    pub fn handle_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Scan(frame) => self.handle_scan(&frame),
            StreamEvent::Brake(engaged) => {
                self.stats.brake_updates += 1;
                let changed = self.brake.send_if_modified(|current| {
                    let changed = *current != Some(engaged);
                    *current = Some(engaged);
                    changed
                });
                if changed {
                    tracing::info!(engaged, "brake status changed");
                }
            }
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand) {
        self.stats.commands += 1;
        match command {
            ControlCommand::CenterOnFootprint => self.renderer.center_on_footprint(),
            ControlCommand::ZoomIn => self.renderer.zoom_in(),
            ControlCommand::ZoomOut => self.renderer.zoom_out(),
            ControlCommand::SetLaserScanVisible(visible) => self.renderer.set_laser_scan_visible(visible),
            ControlCommand::ForceResize => self.renderer.force_resize(),
            ControlCommand::UpdateFootprint(response) => match self.geometry.apply_footprint_response(&response) {
                Ok(_) => self.rebuild_footprint(),
                Err(e) => tracing::warn!("footprint rejected, keeping previous: {e}"),
            },
            ControlCommand::UpdateTransform(response) => {
                self.geometry.apply_transform_response(&response);
            }
            ControlCommand::Shutdown => {}
        }
    }

    /// Disposes the stream client, then the renderer. Idempotent.
    pub fn unmount(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.dispose();
        }
        self.events = None;
        self.resizes = None;

        if self.mounted {
            self.renderer.dispose();
            self.mounted = false;
            tracing::info!(
                scans = self.stats.scans,
                frames = self.stats.frames_drawn,
                "visualizer unmounted"
            );
        }
    }

    pub fn geometry(&self) -> &GeometryModel {
        &self.geometry
    }

    pub fn renderer(&self) -> &SceneRenderer<B> {
        &self.renderer
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub fn brake_status(&self) -> Option<bool> {
        *self.brake.borrow()
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.stream.as_ref().map(StreamClient::status)
    }

    fn handle_scan(&mut self, frame: &ScanFrame) {
        let (cloud, scan_stats) = self
            .transformer
            .transform_with_stats(frame, self.geometry.laser_to_base());

        self.stats.scans += 1;
        self.stats.points_last_scan = cloud.len();
        self.stats.beams_dropped += (scan_stats.dropped_invalid_beam + scan_stats.dropped_out_of_bounds) as u64;
        if scan_stats.simulated {
            self.stats.simulated_scans += 1;
        }

        self.renderer.update_scan(&cloud);
    }

    fn rebuild_footprint(&mut self) {
        self.renderer
            .rebuild_footprint(self.geometry.footprint(), self.texture.as_ref());
    }
}

impl<B: RenderBackend> Drop for VisualizerController<B> {
    fn drop(&mut self) {
        self.unmount();
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FixedSurface, HeadlessBackend, HeadlessProbe, ResourceKind};
    use crate::geometry::RigidTransform;
    use approx::assert_relative_eq;
    use serde_json::json;
    use std::time::Duration;

    fn source() -> ConfigSource {
        ConfigSource {
            footprint: Some(serde_json::from_value(json!({"polygon": [[0, 0], [2, 0], [2, 1], [0, 1]]})).unwrap()),
            transform: Some(
                serde_json::from_value(json!({"Position": [0.1, 0.0, 0.2], "Orientation": [0, 0, 0, 1]})).unwrap(),
            ),
            texture: None,
        }
    }

    fn mounted(source: ConfigSource) -> (VisualizerController<HeadlessBackend>, HeadlessProbe) {
        let backend = HeadlessBackend::new();
        let probe = backend.probe();
        let mut controller = VisualizerController::new(backend, VisualizerConfig::default());
        controller
            .mount(source, Box::new(FixedSurface::new(640, 480)))
            .unwrap();
        (controller, probe)
    }

    #[test]
    fn test_mount_applies_configuration() {
        let (controller, probe) = mounted(source());
        assert!(!controller.geometry().is_default_footprint());
        assert!(controller.geometry().laser_to_base().is_some());

        let anchor = controller.renderer().anchor();
        assert_relative_eq!(anchor.x, -1.0);
        assert_relative_eq!(anchor.y, -0.5);
        assert_eq!(probe.live(ResourceKind::Geometry), 1);
    }

    #[test]
    fn test_mount_with_bad_configuration_falls_back() {
        let bad = ConfigSource {
            footprint: Some(serde_json::from_value(json!({"polygon": [[0, 0], [1, "x"]]})).unwrap()),
            transform: Some(serde_json::from_value(json!({"Position": [0, 0], "Orientation": [0, 0, 0, 1]})).unwrap()),
            texture: None,
        };
        let (controller, _probe) = mounted(bad);
        assert!(controller.geometry().is_default_footprint());
        assert!(controller.geometry().laser_to_base().is_none());
        assert!(controller.is_mounted());
    }

    #[test]
    fn test_scan_event_reaches_renderer() {
        let (mut controller, probe) = mounted(source());
        controller.handle_event(StreamEvent::Scan(ScanFrame::new(0.0, 0.1, vec![1.0, f64::NAN, 1.0])));

        let scan = controller.renderer().scan_mesh().unwrap();
        assert_eq!(probe.point_count(scan.points), Some(2));
        assert_eq!(controller.stats().scans, 1);
        assert_eq!(controller.stats().beams_dropped, 1);

        let footprint = controller.renderer().footprint_mesh().unwrap();
        assert_eq!(probe.translation(scan.points), probe.translation(footprint.geometry));
    }

    #[test]
    fn test_scan_without_calibration_is_simulated() {
        let no_transform = ConfigSource {
            transform: None,
            ..source()
        };
        let (mut controller, _probe) = mounted(no_transform);
        controller.handle_event(StreamEvent::Scan(ScanFrame::new(0.0, 0.1, vec![])));
        assert_eq!(controller.stats().simulated_scans, 1);
        assert!(controller.renderer().scan_mesh().is_some());
    }

    #[test]
    fn test_brake_status_published() {
        let (mut controller, _probe) = mounted(source());
        let handle = controller.handle();
        assert_eq!(handle.brake_status(), None);

        controller.handle_event(StreamEvent::Brake(true));
        assert_eq!(handle.brake_status(), Some(true));
        controller.handle_event(StreamEvent::Brake(false));
        assert_eq!(controller.brake_status(), Some(false));
        assert_eq!(controller.stats().brake_updates, 2);
    }

    #[test]
    fn test_runtime_footprint_update_rebuilds() {
        let (mut controller, probe) = mounted(source());
        let before = controller.renderer().footprint_mesh().unwrap();

        let response = serde_json::from_value(json!({"polygon": [[-1, -1], [3, -1], [3, 1], [-1, 1]]})).unwrap();
        controller.handle_command(ControlCommand::UpdateFootprint(response));

        assert!(!probe.is_live(before.geometry));
        assert_relative_eq!(controller.renderer().anchor().x, -1.0);
        assert_relative_eq!(controller.renderer().anchor().y, 0.0);

        let rejected = serde_json::from_value(json!({"polygon": [[0, 0], [1, 1]]})).unwrap();
        let kept = controller.renderer().footprint_mesh();
        controller.handle_command(ControlCommand::UpdateFootprint(rejected));
        assert_eq!(controller.renderer().footprint_mesh(), kept);
    }

    #[test]
    fn test_runtime_transform_update() {
        let (mut controller, _probe) = mounted(source());
        let response = serde_json::from_value(json!({"Position": [1, 2, 3], "Orientation": [0, 0, 0, 1]})).unwrap();
        controller.handle_command(ControlCommand::UpdateTransform(response));
        assert_eq!(
            controller.geometry().laser_to_base().map(RigidTransform::translation),
            Some(nalgebra::Vector3::new(1.0, 2.0, 3.0))
        );
    }

    #[test]
    fn test_unmount_releases_everything_and_is_idempotent() {
        let (mut controller, probe) = mounted(source());
        controller.handle_event(StreamEvent::Scan(ScanFrame::new(0.0, 0.1, vec![1.0; 8])));

        controller.unmount();
        controller.unmount();
        assert_eq!(probe.total_live(), 0);
        assert!(!probe.is_attached());
        assert!(!controller.is_mounted());
    }

    #[test]
    fn test_unattachable_surface_fails_mount() {
        let mut controller = VisualizerController::new(HeadlessBackend::new(), VisualizerConfig::default());
        let err = controller
            .mount(source(), Box::new(FixedSurface::unavailable()))
            .unwrap_err();
        assert!(matches!(err, RenderError::SurfaceUnavailable(_)));
        assert!(!controller.is_mounted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_handles_commands_resizes_and_frames() {
        let (mut controller, probe) = mounted(source());
        let handle = controller.handle();
        let (resize_tx, resize_rx) = mpsc::channel(4);
        controller.attach_resizes(resize_rx);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            resize_tx.send(SurfaceSize::new(1280, 720)).await.unwrap();
            handle.zoom_in();
            handle.set_laser_scan_visible(false);
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.shutdown();
        };
        tokio::join!(controller.run(), driver);

        let stats = controller.stats();
        assert!(stats.frames_drawn >= 10, "frames drawn: {}", stats.frames_drawn);
        assert_eq!(stats.resizes, 1);
        assert_eq!(stats.commands, 2);
        assert_relative_eq!(controller.renderer().camera().aspect, 1280.0 / 720.0);
        assert_relative_eq!(controller.renderer().camera().distance(), 4.5);
        assert!(!controller.renderer().is_scan_visible());
        assert_eq!(probe.frames_presented(), stats.frames_drawn);
    }
}
