//! DataBox Transport Layer
//!
//! Hosts DataBoxes for remote clients:
//! - Handler: connect handshake and frame routing
//! - WebSocket: browser-compatible transport
//! - Metrics: Prometheus metrics (optional feature)

pub mod handler;
#[cfg(feature = "websocket")]
pub mod websocket;
#[cfg(feature = "metrics")]
pub mod metrics;

pub use handler::{ConnectConfig, ConnectHandler};
#[cfg(feature = "websocket")]
pub use websocket::{AuthResolver, WebSocketServer};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
