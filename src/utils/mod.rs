//! Utility modules shared by the stream controller and the HTTP facade.

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, probe_loopback_port};
pub use throttle::LogThrottler;
