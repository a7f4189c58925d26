pub mod bridge;
pub mod metrics;
pub mod protocol;

pub use bridge::{Bridge, BridgeConfig, BridgeError, RemoteView};
pub use metrics::{serve_metrics, DynoMetrics};
pub use protocol::{IncomingMessage, ProtocolVersion, StatusMsg};
