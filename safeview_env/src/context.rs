//! Core environment context trait for SafeView.

use crate::types::TaskHandle;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for clock and task interaction.
///
/// This trait abstracts the "real world" so that the stream client and the
/// controller can run in both production (tokio) and simulation (virtual
/// clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `tokio::spawn`
/// - **Simulation**: `SimContext` - virtual clock advanced by `sleep`
#[async_trait]
pub trait ViewerContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// The reconnect timer is exactly one of these futures, so dropping it
    /// cancels the pending reconnect.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task and returns a handle that can abort it.
    fn spawn<F>(&self, name: &str, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static;
}
