//! Simulation context implementing ViewerContext for deterministic testing.

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use safeview_env::{TaskHandle, ViewerContext};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Simulation context backed by a virtual clock.
///
/// - `now()` reads the virtual clock
/// - `sleep()` advances the virtual clock by the full duration, then yields
/// - RNG streams are derived from the master seed
///
/// Reconnect delays therefore elapse instantly in wall time while the
/// recorded virtual timestamps stay exact.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Names of tasks spawned through this context
    spawned: Arc<Mutex<Vec<String>>>,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Independent RNG stream; the same `(seed, stream)` always yields the same sequence.
    pub fn rng(&self, stream: u64) -> ChaCha8Rng {
        let combined = self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream;
        ChaCha8Rng::seed_from_u64(combined)
    }

    pub fn spawned_tasks(&self) -> Vec<String> {
        self.spawned.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            spawned: Arc::clone(&self.spawned),
        }
    }
}

#[async_trait]
impl ViewerContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> TaskHandle
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.spawned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
        let handle = tokio::spawn(future);
        TaskHandle::new(name, handle.abort_handle())
    }
}
