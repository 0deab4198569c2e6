//! Fault scenarios for the visualization pipeline.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: Clean stream, calibrated laser
    SteadyStream,

    /// SIM-002: Garbage frames and socket errors mixed into the stream
    MalformedFrames,

    /// SIM-003: Robot drops the link; some reconnects are refused
    LinkFlap,

    /// SIM-004: No laser calibration configured
    MissingCalibration,

    /// SIM-005: Bursts of scans faster than the draw loop
    ScanBurst,

    /// SIM-006: Calibration that throws points out of bounds, then goes invalid
    CorruptCalibration,
}

impl ScenarioId {
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyStream,
            ScenarioId::MalformedFrames,
            ScenarioId::LinkFlap,
            ScenarioId::MissingCalibration,
            ScenarioId::ScanBurst,
            ScenarioId::CorruptCalibration,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyStream => "steady_stream",
            ScenarioId::MalformedFrames => "malformed_frames",
            ScenarioId::LinkFlap => "link_flap",
            ScenarioId::MissingCalibration => "missing_calibration",
            ScenarioId::ScanBurst => "scan_burst",
            ScenarioId::CorruptCalibration => "corrupt_calibration",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyStream => "10 Hz scans + brake toggles, every scan rendered co-registered",
            ScenarioId::MalformedFrames => "Garbage JSON, bad payloads, non-UTF-8 and socket errors never close the link",
            ScenarioId::LinkFlap => "Two link drops, two refused reconnects, fixed 10 s spacing",
            ScenarioId::MissingCalibration => "No laser transform: simulated ring scan keeps the view populated",
            ScenarioId::ScanBurst => "50-scan bursts: one live cloud, no leaked resources",
            ScenarioId::CorruptCalibration => "Far-off then non-unit calibration: bounded output, degraded fallback",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_stream" | "steady" | "sim-001" => Ok(ScenarioId::SteadyStream),
            "malformed_frames" | "malformed" | "sim-002" => Ok(ScenarioId::MalformedFrames),
            "link_flap" | "flap" | "sim-003" => Ok(ScenarioId::LinkFlap),
            "missing_calibration" | "uncalibrated" | "sim-004" => Ok(ScenarioId::MissingCalibration),
            "scan_burst" | "burst" | "sim-005" => Ok(ScenarioId::ScanBurst),
            "corrupt_calibration" | "corrupt" | "sim-006" => Ok(ScenarioId::CorruptCalibration),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
