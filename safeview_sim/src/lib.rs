//! SafeView Deterministic Simulation Harness
//!
//! Runs the whole visualization pipeline (stream client, controller,
//! renderer) against a simulated robot with every source of
//! non-determinism under control:
//! - **Time**: tokio's paused clock drives the draw loop and scan cadence;
//!   `SimContext` keeps the reconnect clock virtual
//! - **Network**: `SimTransport`/`SimLink` script frames, garbage, socket
//!   errors, drops and refused reconnects
//! - **Randomness**: scan noise and invalid beams derive from one 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ current-thread runtime (paused clock)                         │
//! │                                                               │
//! │  SimulatedRobot ──► SimLink ══ SimTransport ──► StreamClient   │
//! │   (ray caster)      (faults)                     │             │
//! │                                                   ▼             │
//! │                           VisualizerController ──► Headless    │
//! │                                  ▲                 Backend     │
//! │  invariant checks ───────────────┴──────── HeadlessProbe ◄─┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use safeview_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_duration(10.0).run(ScenarioId::LinkFlap);
//! assert!(result.passed);
//! ```

mod context;
mod robot;
mod runner;
mod transport;
pub mod scenarios;

pub use context::SimContext;
pub use robot::{Obstacle, Pose, Room, SimulatedRobot};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner, SimError};
pub use transport::{SimLink, SimTransport};
