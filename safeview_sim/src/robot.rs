//! Simulated robot - ground-truth room and a noisy 2D laser.
//!
//! The robot drives an ellipse inside a rectangular room with one round
//! obstacle. Scans are ray cast against that world, with Gaussian range noise
//! and a small share of invalid returns (NaN, Inf, 0, negative) that the
//! pipeline must drop.

use nalgebra::{Point2, Vector2};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use safeview_core::ScanFrame;
use std::f64::consts::{PI, TAU};

/// Axis-aligned room centered on the origin.
#[derive(Debug, Clone, Copy)]
pub struct Room {
    pub half_width: f64,
    pub half_depth: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct Obstacle {
    pub center: Point2<f64>,
    pub radius: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Point2<f64>,
    pub heading: f64,
}

pub struct SimulatedRobot {
    rng: ChaCha8Rng,
    noise: Normal<f64>,
    room: Room,
    obstacle: Option<Obstacle>,
    pose: Pose,
    time: f64,

    beams: usize,
    max_range: f64,
    /// Probability that a beam returns garbage
    invalid_rate: f64,
    /// Brake engaged for this many seconds out of every `brake_period`
    brake_on_secs: f64,
    brake_period: f64,
}

impl SimulatedRobot {
    /// Orbit radii of the driven ellipse (meters)
    const ORBIT: (f64, f64) = (1.0, 0.5);
    /// Angular speed around the orbit (rad/s)
    const OMEGA: f64 = 0.4;

    pub fn new(rng: ChaCha8Rng) -> Self {
        let mut robot = Self {
            rng,
            noise: Normal::new(0.0, 0.01).unwrap_or_else(|_| unreachable!("std is positive")),
            room: Room {
                half_width: 3.0,
                half_depth: 2.0,
            },
            obstacle: Some(Obstacle {
                center: Point2::new(1.8, 1.0),
                radius: 0.3,
            }),
            pose: Pose {
                position: Point2::origin(),
                heading: 0.0,
            },
            time: 0.0,
            beams: 360,
            max_range: 30.0,
            invalid_rate: 0.02,
            brake_on_secs: 1.0,
            brake_period: 4.0,
        };
        robot.step(0.0);
        robot
    }

    pub fn with_invalid_rate(mut self, rate: f64) -> Self {
        self.invalid_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_noise(mut self, std: f64) -> Self {
        if let Ok(noise) = Normal::new(0.0, std) {
            self.noise = noise;
        }
        self
    }

    pub fn without_obstacle(mut self) -> Self {
        self.obstacle = None;
        self
    }

    /// Advances the robot along its orbit.
    pub fn step(&mut self, dt: f64) {
        self.time += dt;
        let phase = Self::OMEGA * self.time;
        let (rx, ry) = Self::ORBIT;
        self.pose.position = Point2::new(rx * phase.cos(), ry * phase.sin());
        // Tangent of the ellipse
        self.pose.heading = (ry * phase.cos()).atan2(-rx * phase.sin());
    }

    /// One sweep over a full turn, starting at -π.
    pub fn scan(&mut self) -> ScanFrame {
        let increment = TAU / self.beams as f64;
        let angle_min = -PI;

        let ranges = (0..self.beams)
            .map(|i| {
                let bearing = angle_min + i as f64 * increment;
                if self.rng.gen_bool(self.invalid_rate) {
                    return self.invalid_return();
                }
                let truth = self.ray_cast(self.pose.heading + bearing);
                (truth + self.noise.sample(&mut self.rng)).max(0.001)
            })
            .collect();

        ScanFrame::new(angle_min, increment, ranges)
    }

    pub fn brake_engaged(&self) -> bool {
        self.time % self.brake_period < self.brake_on_secs
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn room(&self) -> Room {
        self.room
    }

    /// Distance from the robot to the first surface along `angle` (world frame).
    pub fn ray_cast(&self, angle: f64) -> f64 {
        let origin = self.pose.position;
        let dir = Vector2::new(angle.cos(), angle.sin());

        let wall = |o: f64, d: f64, half: f64| {
            if d > 1e-12 {
                (half - o) / d
            } else if d < -1e-12 {
                (-half - o) / d
            } else {
                f64::INFINITY
            }
        };
        let mut hit = wall(origin.x, dir.x, self.room.half_width).min(wall(origin.y, dir.y, self.room.half_depth));

        if let Some(obstacle) = self.obstacle {
            // |o + t·d − c|² = r², d is unit
            let oc = origin - obstacle.center;
            let b = oc.dot(&dir);
            let c = oc.norm_squared() - obstacle.radius * obstacle.radius;
            let disc = b * b - c;
            if disc >= 0.0 {
                let t = -b - disc.sqrt();
                if t > 0.0 {
                    hit = hit.min(t);
                }
            }
        }

        hit.min(self.max_range)
    }

    fn invalid_return(&mut self) -> f64 {
        match self.rng.gen_range(0..4) {
            0 => f64::NAN,
            1 => f64::INFINITY,
            2 => 0.0,
            _ => -1.0,
        }
    }
}
