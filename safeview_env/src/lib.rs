//! SafeView Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the visualization core
//! run against **Production** I/O (tokio + WebSocket) and **Simulation**
//! (virtual clock + scripted sockets) without code changes.
//!
//! # What Gets Intercepted
//!
//! - Time (`now()`, `sleep()`), which drives the reconnect timer
//! - Task spawning (`spawn()`), which hosts the stream driver
//! - The live socket (`StreamTransport::connect()`, `StreamConnection::recv()`)
//!
//! # Example
//!
//! ```ignore
//! use safeview_env::{ViewerContext, StreamTransport};
//!
//! async fn pump<Ctx: ViewerContext, T: StreamTransport>(ctx: &Ctx, transport: &T) {
//!     loop {
//!         if let Ok(mut conn) = transport.connect("ws://robot:8080/ws").await {
//!             while let Some(frame) = conn.recv().await {
//!                 handle(frame);
//!             }
//!         }
//!         ctx.sleep(Duration::from_secs(10)).await;
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;
mod transport;
mod types;
mod websocket;

pub use context::ViewerContext;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use transport::{StreamConnection, StreamTransport};
pub use types::{InboundFrame, TaskHandle};
pub use websocket::WebSocketTransport;
