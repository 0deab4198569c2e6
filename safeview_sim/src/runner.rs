//! Scenario runner - drives the full pipeline against a simulated robot.
//!
//! Every run uses a fresh current-thread runtime with a paused clock, so the
//! draw loop and scan cadence are virtual and a seed reproduces a run exactly.

use crate::context::SimContext;
use crate::robot::SimulatedRobot;
use crate::scenarios::ScenarioId;
use crate::transport::{SimLink, SimTransport};

use safeview_core::backend::ResourceKind;
use safeview_core::messages::{encode_brake, encode_scan};
use safeview_core::{
    ConfigSource, ControlCommand, ControllerHandle, FixedSurface, FootprintResponse, HeadlessBackend, HeadlessProbe,
    TransformResponse, VisualizerConfig, VisualizerController,
};
use safeview_env::InboundFrame;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cap on violations kept per run
const MAX_VIOLATIONS: usize = 8;

/// Failures that prevent a scenario from starting at all.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Failed to build simulation runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Failed to mount visualizer: {0}")]
    Mount(#[from] safeview_core::RenderError),
}

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    pub scenario: ScenarioId,
    pub seed: u64,
    pub passed: bool,

    /// Virtual seconds the run took
    pub final_time_secs: f64,

    pub failure_reason: Option<String>,
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn aborted(scenario: ScenarioId, seed: u64, error: SimError) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            final_time_secs: 0.0,
            failure_reason: Some(error.to_string()),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Valid scans delivered to an open connection
    pub scans_sent: u64,
    pub malformed_sent: u64,
    pub socket_errors_sent: u64,
    pub brakes_sent: u64,

    pub scans_rendered: u64,
    pub simulated_scans: u64,
    pub beams_dropped: u64,
    pub frames_drawn: u64,

    pub connections: usize,
    pub connect_attempts: usize,

    /// Largest |coordinate| handed to the backend
    pub max_abs_coordinate: f64,
    pub invariant_checks: u64,
    /// Backend resources still live after unmount
    pub leaked_resources: usize,
}

/// Runs scenarios.
pub struct ScenarioRunner {
    seed: u64,
    duration_secs: f64,
    scan_rate_hz: u32,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            duration_secs: 10.0,
            scan_rate_hz: 10,
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs.max(0.5);
        self
    }

    pub fn with_scan_rate(mut self, hz: u32) -> Self {
        self.scan_rate_hz = hz.max(1);
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.run_async(scenario)),
            Err(e) => ScenarioResult::aborted(scenario, self.seed, e.into()),
        }
    }

    async fn run_async(&self, scenario: ScenarioId) -> ScenarioResult {
        let started = tokio::time::Instant::now();
        let ctx = SimContext::shared(self.seed);
        let (transport, link) = SimTransport::new(Arc::clone(&ctx));

        let config = VisualizerConfig::default().with_stream_url("sim://robot/ws");
        let reconnect_delay = config.reconnect_delay();
        let backend = HeadlessBackend::new();
        let probe = backend.probe();

        let mut controller = VisualizerController::new(backend, config);
        if let Err(e) = controller.mount(config_source(scenario), Box::new(FixedSurface::new(1280, 720))) {
            return ScenarioResult::aborted(scenario, self.seed, e.into());
        }
        controller.connect(Arc::clone(&ctx), Arc::new(transport));

        let mut harness = Harness {
            link: link.clone(),
            handle: controller.handle(),
            probe: probe.clone(),
            robot: SimulatedRobot::new(ctx.rng(1)),
            period: Duration::from_secs_f64(1.0 / f64::from(self.scan_rate_hz)),
            metrics: ScenarioMetrics::default(),
            violations: Vec::new(),
            last_brake: None,
        };
        let ticks = (self.duration_secs * f64::from(self.scan_rate_hz)).round() as u64;

        tokio::join!(controller.run(), harness.script(scenario, ticks));

        let stats = controller.stats();
        let brake = controller.brake_status();
        controller.unmount();
        // let the stream driver observe shutdown and close its socket
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        let mut metrics = harness.metrics;
        metrics.scans_rendered = stats.scans;
        metrics.simulated_scans = stats.simulated_scans;
        metrics.beams_dropped = stats.beams_dropped;
        metrics.frames_drawn = stats.frames_drawn;
        metrics.connections = link.connection_count();
        metrics.connect_attempts = link.attempts().len();
        metrics.max_abs_coordinate = probe.max_abs_coordinate();
        metrics.leaked_resources = probe.total_live();

        let mut failures = harness.violations;
        if metrics.leaked_resources > 0 {
            failures.push(format!("{} resources live after unmount", metrics.leaked_resources));
        }
        if link.is_connected() {
            failures.push("socket still open after unmount".to_string());
        }
        if metrics.frames_drawn == 0 {
            failures.push("draw loop never ran".to_string());
        }
        if harness.last_brake.is_some() && brake != harness.last_brake {
            failures.push(format!("brake status {:?}, last sent {:?}", brake, harness.last_brake));
        }
        failures.extend(evaluate(scenario, &metrics, &link.attempts(), reconnect_delay));

        let passed = failures.is_empty();
        if !passed {
            warn!(scenario = scenario.name(), ?failures, "scenario failed");
        }
        debug!(?metrics, "scenario metrics");

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            final_time_secs: started.elapsed().as_secs_f64(),
            failure_reason: (!passed).then(|| failures.join("; ")),
            metrics,
        }
    }
}

/// Scenario-specific pass criteria.
fn evaluate(scenario: ScenarioId, m: &ScenarioMetrics, attempts: &[Duration], delay: Duration) -> Vec<String> {
    let mut failures = Vec::new();
    let mut expect = |ok: bool, msg: String| {
        if !ok {
            failures.push(msg);
        }
    };

    match scenario {
        ScenarioId::SteadyStream | ScenarioId::MalformedFrames => {
            expect(m.connections == 1, format!("expected 1 connection, saw {}", m.connections));
            expect(
                m.scans_rendered == m.scans_sent,
                format!("rendered {} of {} scans", m.scans_rendered, m.scans_sent),
            );
            expect(m.simulated_scans == 0, "calibrated run used simulated scans".to_string());
        }
        ScenarioId::LinkFlap => {
            expect(m.connections == 3, format!("expected 3 connections, saw {}", m.connections));
            expect(attempts.len() == 5, format!("expected 5 connect attempts, saw {}", attempts.len()));
            let spaced = attempts.windows(2).all(|w| w[1] - w[0] == delay);
            expect(spaced, format!("reconnect attempts not spaced by {delay:?}: {attempts:?}"));
            expect(
                m.scans_rendered == m.scans_sent,
                format!("rendered {} of {} scans", m.scans_rendered, m.scans_sent),
            );
        }
        ScenarioId::MissingCalibration => {
            expect(m.scans_rendered > 0, "no scans rendered".to_string());
            expect(
                m.simulated_scans == m.scans_rendered,
                format!("{} of {} scans simulated", m.simulated_scans, m.scans_rendered),
            );
        }
        ScenarioId::ScanBurst => {
            expect(
                m.scans_rendered == m.scans_sent,
                format!("rendered {} of {} scans", m.scans_rendered, m.scans_sent),
            );
        }
        ScenarioId::CorruptCalibration => {
            expect(m.beams_dropped > 0, "far-off calibration dropped nothing".to_string());
            expect(m.simulated_scans > 0, "invalid calibration did not degrade".to_string());
        }
    }

    if m.max_abs_coordinate >= safeview_core::scan::MAX_COORDINATE {
        failures.push(format!("point out of bounds: {}", m.max_abs_coordinate));
    }
    failures
}

fn config_source(scenario: ScenarioId) -> ConfigSource {
    let footprint: FootprintResponse = serde_json::from_value(json!({
        "polygon": [[-0.30, -0.25], [0.35, -0.25], [0.35, 0.25], [-0.30, 0.25]]
    }))
    .unwrap_or_default();

    let transform = match scenario {
        ScenarioId::MissingCalibration => None,
        ScenarioId::CorruptCalibration => Some(transform_response([999.5, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0])),
        _ => Some(transform_response([0.15, 0.0, 0.2], [0.0, 0.0, 0.0, 1.0])),
    };

    ConfigSource {
        footprint: Some(footprint),
        transform,
        texture: None,
    }
}

fn transform_response(position: [f64; 3], orientation: [f64; 4]) -> TransformResponse {
    TransformResponse {
        position: Some(position.iter().map(|v| json!(v)).collect()),
        orientation: Some(orientation.iter().map(|v| json!(v)).collect()),
    }
}

/// The robot side of a run.
struct Harness {
    link: SimLink,
    handle: ControllerHandle,
    probe: HeadlessProbe,
    robot: SimulatedRobot,
    period: Duration,
    metrics: ScenarioMetrics,
    violations: Vec<String>,
    last_brake: Option<bool>,
}

impl Harness {
    async fn script(&mut self, scenario: ScenarioId, ticks: u64) {
        self.link.wait_for_connections(1).await;

        for i in 0..ticks {
            match scenario {
                ScenarioId::MalformedFrames => {
                    if i % 3 == 0 {
                        self.send_garbage(i);
                    }
                    if i % 5 == 0 && self.link.push_socket_error("connection reset by peer") {
                        self.metrics.socket_errors_sent += 1;
                    }
                }
                ScenarioId::LinkFlap => {
                    if i == ticks / 5 {
                        self.flap(0).await;
                    } else if i == 3 * ticks / 5 {
                        self.flap(2).await;
                    }
                }
                ScenarioId::ScanBurst if i % 10 == 0 => {
                    for _ in 0..50 {
                        self.robot.step(0.002);
                        self.send_scan();
                    }
                }
                ScenarioId::CorruptCalibration if i == ticks / 2 => {
                    let non_unit = transform_response([0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 2.0]);
                    self.handle.send(ControlCommand::UpdateTransform(non_unit));
                }
                _ => {}
            }

            self.tick().await;
        }

        // drain what is in flight before stopping
        tokio::time::sleep(self.period * 2).await;
        self.check();
        self.handle.shutdown();
    }

    async fn tick(&mut self) {
        self.robot.step(self.period.as_secs_f64());
        self.send_scan();

        let engaged = self.robot.brake_engaged();
        if self.last_brake != Some(engaged) && self.link.push_text(encode_brake(engaged)) {
            self.last_brake = Some(engaged);
            self.metrics.brakes_sent += 1;
        }

        tokio::time::sleep(self.period).await;
        self.check();
    }

    fn send_scan(&mut self) {
        let frame = self.robot.scan();
        if self.link.push_text(encode_scan(&frame)) {
            self.metrics.scans_sent += 1;
        }
    }

    fn send_garbage(&mut self, i: u64) {
        let sent = match i % 5 {
            0 => self.link.push_text("{oops"),
            1 => self.link.push_text(r#"{"type":"scan_update","data":{"ranges":"x"}}"#),
            2 => self.link.push_frame(InboundFrame::Binary(vec![0xff, 0xfe, 0xfd])),
            3 => self.link.push_text(r#"{"type":"battery_update","data":80}"#),
            _ => self.link.push_text(r#"{"data":true}"#),
        };
        if sent {
            self.metrics.malformed_sent += 1;
        }
    }

    /// Drops the link, refusing the next `refused` reconnects, and waits until back up.
    async fn flap(&mut self, refused: u32) {
        let before = self.link.connection_count();
        self.link.refuse_next(refused);
        self.link.drop_connection();
        info!(refused, "sim: link dropped");
        self.link.wait_for_connections(before + 1).await;
    }

    fn check(&mut self) {
        self.metrics.invariant_checks += 1;

        let footprint = self.probe.live_translations(ResourceKind::Geometry);
        let scans = self.probe.live_translations(ResourceKind::Points);
        if scans.len() > 1 {
            self.violate(format!("{} point clouds live at once", scans.len()));
        }
        if let (Some(anchor), Some(scan)) = (footprint.first(), scans.first()) {
            if anchor != scan {
                self.violate(format!("scan offset {scan:?} != footprint offset {anchor:?}"));
            }
        }
        if footprint.len() != 1 {
            self.violate(format!("{} footprint meshes live", footprint.len()));
        }
    }

    fn violate(&mut self, message: String) {
        if self.violations.len() < MAX_VIOLATIONS {
            self.violations.push(message);
        }
    }
}
