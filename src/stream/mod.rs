//! Stream session core
//!
//! - `port`: ephemeral port allocation shared by all cameras
//! - `timer`: restartable single-shot timers (keepalive, cooldown, auto-reset)
//! - `pipeline`: receiver/reader command construction
//! - `process`: external process supervision
//! - `session`: per-camera lifecycle controller

pub mod pipeline;
pub mod port;
pub mod process;
pub mod session;
pub mod timer;
pub mod wake;

#[cfg(test)]
pub(crate) mod testing;

pub use pipeline::{build_plan, split_command_line, PipelinePlan, PipelineSource, StageCommand};
pub use port::{LoopbackProbe, PortAllocator, PortLease, PortProbe};
pub use process::{ExitReport, PipelineHandle, PipelineLauncher, ProcessLauncher};
pub use session::{
    ControllerDeps, RefreshToken, StreamController, StreamDescriptor, StreamRequest, StreamState,
    StreamStatus,
};
pub use timer::{AutoResetFlag, Timer};
pub use wake::{NoopActivator, StreamActivator};
