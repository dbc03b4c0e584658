//! External process supervision for stream pipelines
//!
//! Each pipeline stage runs as a child process with piped output. A watcher
//! task per child owns the `Child`, reports natural exits through a one-shot
//! callback, and performs SIGTERM-then-SIGKILL termination on request.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pipeline::{PipelinePlan, StageCommand};
use crate::error::StreamError;

/// Maximum number of output lines kept per stage
const LOG_BUFFER_SIZE: usize = 64;

/// Output lines included in exit diagnostics
const EXIT_TAIL_LINES: usize = 8;

/// Time a stage gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// How a pipeline stage ended on its own
#[derive(Debug, Clone)]
pub struct ExitReport {
    pub stage: &'static str,
    pub pid: Option<u32>,
    /// Exit status description ("exit status: 1", "signal: 9 (SIGKILL)")
    pub status: String,
    pub success: bool,
    /// Last lines the stage wrote before exiting
    pub last_output: Vec<String>,
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} (pid {}) exited with {}", self.stage, pid, self.status)?,
            None => write!(f, "{} exited with {}", self.stage, self.status)?,
        }
        if let Some(last) = self.last_output.last() {
            write!(f, ": {}", last)?;
        }
        Ok(())
    }
}

/// Invoked at most once per pipeline, for the first stage that exits on its own
pub type ExitCallback = Box<dyn FnOnce(ExitReport) + Send>;

/// Launches pipelines
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    /// Spawn every stage of `plan` and wait for spawn confirmation
    ///
    /// `on_exit` is only installed once the pipeline has survived its settle
    /// window. A stage that dies within the window yields
    /// [`StreamError::EarlyExit`] and the callback is dropped unused.
    async fn launch(
        &self,
        camera_id: &str,
        plan: &PipelinePlan,
        on_exit: ExitCallback,
    ) -> Result<Box<dyn PipelineHandle>, StreamError>;
}

/// Ownership of a running pipeline
#[async_trait]
pub trait PipelineHandle: Send + Sync {
    /// Process ids of the stages still owned by this handle
    fn pids(&self) -> Vec<u32>;

    /// Terminate every stage and wait until all of them are reaped
    ///
    /// Disarms the exit callback first, so a kill never reports as an exit.
    /// Calling it again is a no-op.
    async fn kill(&mut self);
}

type LogRing = Arc<Mutex<VecDeque<String>>>;

struct ExitState {
    /// First natural exit observed
    report: Option<ExitReport>,
    callback: Option<ExitCallback>,
}

struct StageProcess {
    name: &'static str,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    watcher: Option<JoinHandle<()>>,
}

/// Pipeline of child processes owned by a stream session
pub struct ProcessPipeline {
    camera_id: String,
    stages: Vec<StageProcess>,
    exit: Arc<Mutex<ExitState>>,
}

impl ProcessPipeline {
    fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            stages: Vec::new(),
            exit: Arc::new(Mutex::new(ExitState {
                report: None,
                callback: None,
            })),
        }
    }

    fn spawn_stage(&mut self, stage: &StageCommand) -> Result<(), StreamError> {
        info!(
            camera = %self.camera_id,
            "Starting {} stage: {}",
            stage.name,
            stage.display()
        );

        let mut child = Command::new(&stage.program)
            .args(&stage.args)
            .envs(&stage.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StreamError::SpawnFailed(format!("{}: {}", stage.program, e))
            })?;

        let pid = child.id();
        let name = stage.name;
        let logs: LogRing = Arc::new(Mutex::new(VecDeque::with_capacity(LOG_BUFFER_SIZE)));

        if let Some(stdout) = child.stdout.take() {
            let (camera_id, logs) = (self.camera_id.clone(), logs.clone());
            tokio::spawn(async move {
                collect_logs(camera_id, name, stdout, logs).await;
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let (camera_id, logs) = (self.camera_id.clone(), logs.clone());
            tokio::spawn(async move {
                collect_logs(camera_id, name, stderr, logs).await;
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_stage(
            self.camera_id.clone(),
            name,
            child,
            kill_rx,
            logs,
            self.exit.clone(),
        ));

        debug!(camera = %self.camera_id, "{} stage running with PID {:?}", name, pid);
        self.stages.push(StageProcess {
            name,
            pid,
            kill_tx: Some(kill_tx),
            watcher: Some(watcher),
        });
        Ok(())
    }
}

#[async_trait]
impl PipelineHandle for ProcessPipeline {
    fn pids(&self) -> Vec<u32> {
        self.stages
            .iter()
            .filter(|s| s.watcher.as_ref().is_some_and(|w| !w.is_finished()))
            .filter_map(|s| s.pid)
            .collect()
    }

    async fn kill(&mut self) {
        // Disarm before terminating so the teardown is not reported twice
        drop(self.exit.lock().callback.take());

        for stage in &mut self.stages {
            if let Some(tx) = stage.kill_tx.take() {
                let _ = tx.send(());
            }
        }
        for stage in &mut self.stages {
            if let Some(watcher) = stage.watcher.take() {
                if let Err(e) = watcher.await {
                    warn!(camera = %self.camera_id, "{} watcher failed: {}", stage.name, e);
                }
                debug!(camera = %self.camera_id, "{} stage reaped", stage.name);
            }
        }
    }
}

/// Collect child output into tracing and a bounded ring buffer
///
/// Keeps draining until EOF. Bytes that are not UTF-8 are replaced, since a
/// closed pipe would kill the stage on its next write.
async fn collect_logs<R: AsyncRead + Unpin>(
    camera_id: String,
    stage: &'static str,
    reader: R,
    logs: LogRing,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                debug!(camera = %camera_id, stage, "{}", line);
                let mut logs = logs.lock();
                if logs.len() >= LOG_BUFFER_SIZE {
                    logs.pop_front();
                }
                logs.push_back(line);
            }
            Err(e) => {
                warn!(camera = %camera_id, stage, "Error reading output: {}", e);
                break;
            }
        }
    }
}

fn tail(logs: &LogRing) -> Vec<String> {
    let logs = logs.lock();
    let start = logs.len().saturating_sub(EXIT_TAIL_LINES);
    logs.range(start..).cloned().collect()
}

/// Own one child until it exits or a kill is requested
async fn watch_stage(
    camera_id: String,
    stage: &'static str,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    logs: LogRing,
    exit: Arc<Mutex<ExitState>>,
) {
    let pid = child.id();

    tokio::select! {
        status = child.wait() => {
            let (status, success) = match status {
                Ok(s) => (s.to_string(), s.success()),
                Err(e) => (format!("wait error: {}", e), false),
            };
            // Give the log collectors a moment to drain the final lines
            tokio::task::yield_now().await;
            let report = ExitReport {
                stage,
                pid,
                status,
                success,
                last_output: tail(&logs),
            };
            info!(camera = %camera_id, "Pipeline stage {}", report);

            let callback = {
                let mut state = exit.lock();
                if state.report.is_none() {
                    state.report = Some(report.clone());
                }
                state.callback.take()
            };
            if let Some(callback) = callback {
                callback(report);
            }
        }
        // Resolves on an explicit kill and when the handle is dropped
        _ = kill_rx => {
            terminate(&camera_id, stage, &mut child, pid).await;
        }
    }
}

async fn terminate(camera_id: &str, stage: &'static str, child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(camera = %camera_id, "SIGTERM to {} ({}) failed: {}", stage, pid, e);
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(camera = %camera_id, "{} stage terminated: {}", stage, status);
        }
        Ok(Err(e)) => {
            warn!(camera = %camera_id, "Failed to wait for {}: {}", stage, e);
        }
        Err(_) => {
            warn!(
                camera = %camera_id,
                "{} did not exit after SIGTERM, killing", stage
            );
            if let Err(e) = child.kill().await {
                warn!(camera = %camera_id, "Failed to kill {}: {}", stage, e);
            }
        }
    }
}

/// Launcher for real OS processes
///
/// A pipeline still alive after the plan's settle window counts as started.
#[derive(Debug, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl PipelineLauncher for ProcessLauncher {
    async fn launch(
        &self,
        camera_id: &str,
        plan: &PipelinePlan,
        on_exit: ExitCallback,
    ) -> Result<Box<dyn PipelineHandle>, StreamError> {
        if plan.stages.is_empty() {
            return Err(StreamError::ConfigInvalid("pipeline has no stages".to_string()));
        }

        let mut pipeline = ProcessPipeline::new(camera_id);
        for stage in &plan.stages {
            if let Err(e) = pipeline.spawn_stage(stage) {
                pipeline.kill().await;
                return Err(e);
            }
        }

        tokio::time::sleep(plan.settle).await;

        let early_exit = {
            let mut state = pipeline.exit.lock();
            match state.report.clone() {
                Some(report) => Some(report),
                None => {
                    state.callback = Some(on_exit);
                    None
                }
            }
        };

        if let Some(report) = early_exit {
            pipeline.kill().await;
            return Err(StreamError::EarlyExit(report.to_string()));
        }

        info!(
            camera = %camera_id,
            "Pipeline started on port {} (PIDs {:?})",
            plan.port,
            pipeline.pids()
        );
        Ok(Box::new(pipeline))
    }
}
