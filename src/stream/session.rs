//! Per-camera stream session controller
//!
//! One `StreamController` owns the lifecycle of a camera's pipeline:
//!
//! ```text
//! Idle ──start──> Starting ──spawned──> Active ──expiry/exit/stop──> Cooldown
//!  ^                 │  └──stop──────────────────────────────────────> │
//!  └───spawn failed──┘                                                 │
//!  ^──────────────────────────── cooldown elapsed ─────────────────────┘
//! ```
//!
//! State transitions are serialized behind one async mutex. Waking the
//! camera, probing ports, spawning and waiting out a cooldown all happen with
//! the lock released, so a slow camera never blocks another one.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use typeshare::typeshare;

use super::pipeline::{build_plan, PipelinePlan, PipelineSource};
use super::port::{PortAllocator, PortLease};
use super::process::{ExitCallback, ExitReport, PipelineHandle, PipelineLauncher};
use super::timer::Timer;
use super::wake::StreamActivator;
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::events::{EventBus, SystemEvent};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Collaborators shared by every controller
#[derive(Clone)]
pub struct ControllerDeps {
    pub ports: Arc<PortAllocator>,
    pub launcher: Arc<dyn PipelineLauncher>,
    pub activator: Arc<dyn StreamActivator>,
    pub events: Arc<EventBus>,
}

/// Everything a start needs, resolved from the camera's current settings
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub config: StreamConfig,
    pub source: PipelineSource,
    pub stream_options_id: String,
}

/// Presented by a caller that believes a session is running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshToken {
    /// Session the caller was handed; `None` refreshes whatever is active
    pub session_id: Option<u64>,
}

/// Caller-facing result of every successful start or refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    /// Reader arguments consuming the pipeline output
    pub input_arguments: Vec<String>,
    pub stream_options_id: String,
    /// Epoch milliseconds by which the caller must refresh
    pub refresh_at: i64,
    pub has_audio: bool,
    pub session_id: u64,
}

/// Controller state
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Cooldown,
    Starting,
    Active,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Cooldown => "cooldown",
            Self::Starting => "starting",
            Self::Active => "active",
        }
    }
}

/// Point-in-time view of a controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub state: StreamState,
    pub port: Option<u16>,
    pub pids: Vec<u32>,
    pub session_id: Option<u64>,
    pub started_at: Option<i64>,
    pub refresh_at: Option<i64>,
    pub cooldown_remaining_ms: Option<u64>,
}

type StartOutcome = Result<StreamDescriptor, StreamError>;

/// Epoch-millisecond clock driven by `tokio::time`, so deadlines handed to
/// callers follow paused time in tests.
struct EpochClock {
    base_ms: i64,
    base: Instant,
}

impl EpochClock {
    fn new() -> Self {
        Self {
            base_ms: chrono::Utc::now().timestamp_millis(),
            base: Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        self.base_ms + self.base.elapsed().as_millis() as i64
    }
}

struct StartAttempt {
    id: u64,
    outcome: watch::Receiver<Option<StartOutcome>>,
    cancel: CancellationToken,
    /// Pipeline exited between spawn confirmation and activation
    exited: bool,
}

struct ActiveSession {
    id: u64,
    port: PortLease,
    pipeline: Box<dyn PipelineHandle>,
    started_at: i64,
    descriptor: StreamDescriptor,
    keepalive: Timer,
    keepalive_timeout: Duration,
    refresh_window: Duration,
}

enum Phase {
    Idle,
    Cooldown {
        ends_at: Instant,
        seq: u64,
        _timer: Timer,
    },
    Starting(StartAttempt),
    Active(ActiveSession),
}

impl Phase {
    fn state(&self) -> StreamState {
        match self {
            Phase::Idle => StreamState::Idle,
            Phase::Cooldown { .. } => StreamState::Cooldown,
            Phase::Starting(_) => StreamState::Starting,
            Phase::Active(_) => StreamState::Active,
        }
    }
}

struct Inner {
    phase: Phase,
    next_session_id: u64,
    cooldown_seq: u64,
    /// Settings of the latest request; governs cooldown and wake timeouts
    config: StreamConfig,
}

/// Stream session lifecycle for one camera
pub struct StreamController {
    camera_id: String,
    deps: ControllerDeps,
    inner: Mutex<Inner>,
    clock: EpochClock,
    wake_throttle: LogThrottler,
}

impl StreamController {
    pub fn new(camera_id: impl Into<String>, deps: ControllerDeps, config: StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            camera_id: camera_id.into(),
            deps,
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                next_session_id: 1,
                cooldown_seq: 0,
                config,
            }),
            clock: EpochClock::new(),
            wake_throttle: LogThrottler::default(),
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Start a session, join the one being started, or refresh the active one
    ///
    /// A request during cooldown waits out the remaining window. A refresh
    /// token that does not match a running or starting session fails with
    /// [`StreamError::RefreshOnNoSession`].
    pub async fn start_or_refresh(
        self: &Arc<Self>,
        request: &StreamRequest,
        token: Option<RefreshToken>,
    ) -> StartOutcome {
        loop {
            let mut inner = self.inner.lock().await;
            match &mut inner.phase {
                Phase::Active(session) => {
                    if let Some(expected) = token.and_then(|t| t.session_id) {
                        if expected != session.id {
                            return Err(StreamError::RefreshOnNoSession);
                        }
                    }
                    return Ok(self.refresh(session));
                }
                Phase::Starting(attempt) => {
                    let outcome = attempt.outcome.clone();
                    drop(inner);
                    debug!(camera = %self.camera_id, "Joining in-flight stream start");
                    return wait_outcome(outcome).await;
                }
                Phase::Cooldown { ends_at, .. } => {
                    if token.is_some() {
                        return Err(StreamError::RefreshOnNoSession);
                    }
                    let ends_at = *ends_at;
                    if ends_at <= Instant::now() {
                        self.enter_idle(&mut inner);
                        continue;
                    }
                    drop(inner);
                    info!(
                        camera = %self.camera_id,
                        "Waiting {:?} for camera cooldown",
                        ends_at - Instant::now()
                    );
                    tokio::time::sleep_until(ends_at).await;
                }
                Phase::Idle => {
                    if token.is_some() {
                        return Err(StreamError::RefreshOnNoSession);
                    }
                    request.source.validate()?;
                    let outcome = self.begin_start(&mut inner, request);
                    drop(inner);
                    return wait_outcome(outcome).await;
                }
            }
        }
    }

    /// Tear down the running or starting session and enter cooldown
    ///
    /// Idempotent. Always sends a wake-off signal.
    pub async fn stop(self: &Arc<Self>) {
        let session = {
            let mut inner = self.inner.lock().await;
            let cooldown = inner.config.cooldown();
            match std::mem::replace(&mut inner.phase, Phase::Idle) {
                Phase::Active(session) => {
                    info!(camera = %self.camera_id, "Stopping stream session {}", session.id);
                    self.enter_cooldown(&mut inner, cooldown);
                    Some(session)
                }
                Phase::Starting(attempt) => {
                    info!(camera = %self.camera_id, "Aborting stream start {}", attempt.id);
                    attempt.cancel.cancel();
                    self.enter_cooldown(&mut inner, cooldown);
                    None
                }
                other => {
                    inner.phase = other;
                    None
                }
            }
        };

        if let Some(session) = session {
            self.teardown(session).await;
        }
        self.send_wake_signal(false);
    }

    pub async fn status(&self) -> StreamStatus {
        let inner = self.inner.lock().await;
        let mut status = StreamStatus {
            state: inner.phase.state(),
            port: None,
            pids: Vec::new(),
            session_id: None,
            started_at: None,
            refresh_at: None,
            cooldown_remaining_ms: None,
        };
        match &inner.phase {
            Phase::Active(session) => {
                status.port = Some(session.port.port());
                status.pids = session.pipeline.pids();
                status.session_id = Some(session.id);
                status.started_at = Some(session.started_at);
                status.refresh_at = Some(session.descriptor.refresh_at);
            }
            Phase::Starting(attempt) => status.session_id = Some(attempt.id),
            Phase::Cooldown { ends_at, .. } => {
                let remaining = ends_at.saturating_duration_since(Instant::now());
                status.cooldown_remaining_ms = Some(remaining.as_millis() as u64);
            }
            Phase::Idle => {}
        }
        status
    }

    fn refresh(&self, session: &mut ActiveSession) -> StreamDescriptor {
        session.keepalive.reset(session.keepalive_timeout);
        session.descriptor.refresh_at =
            self.clock.now_ms() + session.refresh_window.as_millis() as i64;
        debug!(
            camera = %self.camera_id,
            "Refreshed stream session {} on port {}",
            session.id,
            session.port.port()
        );
        session.descriptor.clone()
    }

    fn begin_start(
        self: &Arc<Self>,
        inner: &mut Inner,
        request: &StreamRequest,
    ) -> watch::Receiver<Option<StartOutcome>> {
        let id = inner.next_session_id;
        inner.next_session_id += 1;
        inner.config = request.config.clone();

        let (tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        inner.phase = Phase::Starting(StartAttempt {
            id,
            outcome: rx.clone(),
            cancel: cancel.clone(),
            exited: false,
        });
        info!(camera = %self.camera_id, "Starting stream session {}", id);
        self.publish_state(StreamState::Starting, None);

        // Runs detached so a caller giving up never strands a half-built pipeline
        let this = self.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let outcome = this.run_start(id, &request, &cancel).await;
            if let Err(e) = &outcome {
                let mut inner = this.inner.lock().await;
                if matches!(&inner.phase, Phase::Starting(a) if a.id == id) {
                    warn!(camera = %this.camera_id, "Stream start failed: {}", e);
                    this.deps.events.publish(SystemEvent::StreamStartFailed {
                        camera_id: this.camera_id.clone(),
                        error: e.to_string(),
                    });
                    this.enter_idle(&mut inner);
                    // The camera was woken before anything could fail
                    this.send_wake_signal(false);
                }
            }
            let _ = tx.send(Some(outcome));
        });

        rx
    }

    async fn run_start(
        self: &Arc<Self>,
        id: u64,
        request: &StreamRequest,
        cancel: &CancellationToken,
    ) -> StartOutcome {
        let config = &request.config;

        // Battery cameras ignore RTSP until the base station wakes them
        tokio::select! {
            _ = cancel.cancelled() => return Err(StreamError::StartAborted),
            _ = self.wake(true, config.wake_timeout()) => {}
        }

        let mut retries_left = config.spawn_retries;
        let mut busy_port: Option<PortLease> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(StreamError::StartAborted);
            }

            let lease = self
                .deps
                .ports
                .allocate_with_attempts(config.port_probe_attempts)
                .await?;
            // Held until a different port is leased so it is not picked again
            drop(busy_port.take());

            let plan = build_plan(config, &request.source, lease.port())?;
            let launched = self
                .deps
                .launcher
                .launch(&self.camera_id, &plan, self.exit_callback(id))
                .await;

            match launched {
                Ok(pipeline) => {
                    return self.activate(id, request, lease, pipeline, plan, cancel).await;
                }
                Err(StreamError::EarlyExit(reason)) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        camera = %self.camera_id,
                        "Pipeline on port {} died during startup ({}), retrying on a fresh port",
                        lease.port(),
                        reason
                    );
                    busy_port = Some(lease);
                }
                Err(StreamError::EarlyExit(reason)) => {
                    return Err(StreamError::SpawnFailed(reason));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn activate(
        self: &Arc<Self>,
        id: u64,
        request: &StreamRequest,
        port: PortLease,
        mut pipeline: Box<dyn PipelineHandle>,
        plan: PipelinePlan,
        cancel: &CancellationToken,
    ) -> StartOutcome {
        let mut inner = self.inner.lock().await;

        let abort = match &inner.phase {
            Phase::Starting(a) if a.id == id && !cancel.is_cancelled() => {
                a.exited.then(|| {
                    StreamError::SpawnFailed("pipeline exited before activation".to_string())
                })
            }
            _ => Some(StreamError::StartAborted),
        };
        if let Some(err) = abort {
            drop(inner);
            pipeline.kill().await;
            drop(port);
            debug!(camera = %self.camera_id, "Discarded partial start {}: {}", id, err);
            return Err(err);
        }

        let config = &request.config;
        let now_ms = self.clock.now_ms();
        let descriptor = StreamDescriptor {
            input_arguments: plan.reader_args,
            stream_options_id: request.stream_options_id.clone(),
            refresh_at: now_ms + config.refresh_window_ms as i64,
            has_audio: plan.has_audio,
            session_id: id,
        };

        let keepalive = Timer::new("keepalive");
        let weak = Arc::downgrade(self);
        keepalive.arm(config.keepalive_timeout(), move || {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.on_keepalive_expired(id).await });
            }
        });

        let port_number = port.port();
        inner.phase = Phase::Active(ActiveSession {
            id,
            port,
            pipeline,
            started_at: now_ms,
            descriptor: descriptor.clone(),
            keepalive,
            keepalive_timeout: config.keepalive_timeout(),
            refresh_window: config.refresh_window(),
        });
        drop(inner);

        info!(
            camera = %self.camera_id,
            "Stream session {} active on port {}",
            id,
            port_number
        );
        self.publish_state(StreamState::Active, Some(port_number));
        Ok(descriptor)
    }

    fn exit_callback(self: &Arc<Self>, id: u64) -> ExitCallback {
        let weak = Arc::downgrade(self);
        Box::new(move |report| {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.on_pipeline_exit(id, report).await });
            }
        })
    }

    async fn on_keepalive_expired(self: Arc<Self>, id: u64) {
        let session = {
            let mut inner = self.inner.lock().await;
            // A refresh that raced the fire re-armed the timer
            let Some(session) = take_active_if(&mut inner, |s| s.id == id && !s.keepalive.is_pending())
            else {
                return;
            };
            info!(
                camera = %self.camera_id,
                "Stream session {} not refreshed within {:?}, stopping",
                id,
                session.keepalive_timeout
            );
            let cooldown = inner.config.cooldown();
            self.enter_cooldown(&mut inner, cooldown);
            session
        };

        self.teardown(session).await;
        self.send_wake_signal(false);
    }

    async fn on_pipeline_exit(self: Arc<Self>, id: u64, report: ExitReport) {
        let session = {
            let mut inner = self.inner.lock().await;
            if let Phase::Starting(attempt) = &mut inner.phase {
                if attempt.id == id {
                    attempt.exited = true;
                }
                return;
            }
            let Some(session) = take_active_if(&mut inner, |s| s.id == id) else {
                return;
            };
            let cooldown = inner.config.cooldown();
            self.enter_cooldown(&mut inner, cooldown);
            session
        };

        let reason = StreamError::ProcessCrashed(report.to_string()).to_string();
        warn!(camera = %self.camera_id, "Stream session {} ended: {}", id, reason);
        self.deps.events.publish(SystemEvent::StreamPipelineExited {
            camera_id: self.camera_id.clone(),
            reason,
        });

        self.teardown(session).await;
        self.send_wake_signal(false);
    }

    async fn finish_cooldown(self: Arc<Self>, seq: u64) {
        let mut inner = self.inner.lock().await;
        if matches!(&inner.phase, Phase::Cooldown { seq: s, .. } if *s == seq) {
            self.enter_idle(&mut inner);
        }
    }

    /// Kill the pipeline, then release its port
    async fn teardown(&self, mut session: ActiveSession) {
        session.keepalive.cancel();
        session.pipeline.kill().await;
        let port = session.port.port();
        drop(session);
        debug!(
            camera = %self.camera_id,
            "Stream session torn down, port {} released",
            port
        );
    }

    fn enter_cooldown(self: &Arc<Self>, inner: &mut Inner, cooldown: Duration) {
        if cooldown.is_zero() {
            self.enter_idle(inner);
            return;
        }

        inner.cooldown_seq += 1;
        let seq = inner.cooldown_seq;
        let timer = Timer::new("cooldown");
        let weak = Arc::downgrade(self);
        timer.arm(cooldown, move || {
            if let Some(this) = weak.upgrade() {
                tokio::spawn(async move { this.finish_cooldown(seq).await });
            }
        });

        inner.phase = Phase::Cooldown {
            ends_at: Instant::now() + cooldown,
            seq,
            _timer: timer,
        };
        self.publish_state(StreamState::Cooldown, None);
    }

    fn enter_idle(&self, inner: &mut Inner) {
        inner.phase = Phase::Idle;
        self.publish_state(StreamState::Idle, None);
    }

    async fn wake(&self, active: bool, timeout: Duration) {
        let signal = self.deps.activator.set_stream_active(&self.camera_id, active);
        let error = match tokio::time::timeout(timeout, signal).await {
            Ok(Ok(())) => {
                self.wake_throttle.clear(&self.camera_id);
                debug!(camera = %self.camera_id, active, "Stream activation signalled");
                return;
            }
            Ok(Err(e)) => e,
            Err(_) => StreamError::UpstreamUnresponsive(format!("no answer within {:?}", timeout)),
        };
        warn_throttled!(
            self.wake_throttle,
            &self.camera_id,
            camera = %self.camera_id,
            "Failed to signal stream active={}: {}",
            active,
            error
        );
    }

    /// Fire-and-forget wake or sleep signal
    fn send_wake_signal(self: &Arc<Self>, active: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            let timeout = this.inner.lock().await.config.wake_timeout();
            this.wake(active, timeout).await;
        });
    }

    fn publish_state(&self, state: StreamState, port: Option<u16>) {
        self.deps.events.publish(SystemEvent::StreamStateChanged {
            camera_id: self.camera_id.clone(),
            state: state.as_str().to_string(),
            port,
        });
    }
}

fn take_active_if(
    inner: &mut Inner,
    pred: impl FnOnce(&ActiveSession) -> bool,
) -> Option<ActiveSession> {
    if !matches!(&inner.phase, Phase::Active(s) if pred(s)) {
        return None;
    }
    match std::mem::replace(&mut inner.phase, Phase::Idle) {
        Phase::Active(session) => Some(session),
        other => {
            inner.phase = other;
            None
        }
    }
}

async fn wait_outcome(mut outcome: watch::Receiver<Option<StartOutcome>>) -> StartOutcome {
    let settled = outcome
        .wait_for(Option::is_some)
        .await
        .map(|value| value.clone());
    match settled {
        Ok(Some(result)) => result,
        // Starter task went away without reporting
        _ => Err(StreamError::StartAborted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::collections::HashSet;

    use crate::stream::testing::{fake_deps, FakeActivator, FakeLauncher, WakeBehavior};

    struct Harness {
        controller: Arc<StreamController>,
        launcher: Arc<FakeLauncher>,
        activator: Arc<FakeActivator>,
        ports: Arc<PortAllocator>,
        events: Arc<EventBus>,
    }

    fn harness() -> Harness {
        let fakes = fake_deps();
        Harness {
            controller: StreamController::new("cam1", fakes.deps, StreamConfig::default()),
            launcher: fakes.launcher,
            activator: fakes.activator,
            ports: fakes.ports,
            events: fakes.events,
        }
    }

    fn request() -> StreamRequest {
        StreamRequest {
            config: StreamConfig::default(),
            source: PipelineSource {
                host: Some("192.168.1.20".to_string()),
                audio_enabled: true,
                ..Default::default()
            },
            stream_options_id: "channel0".to_string(),
        }
    }

    fn token(desc: &StreamDescriptor) -> Option<RefreshToken> {
        Some(RefreshToken {
            session_id: Some(desc.session_id),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_becomes_active() {
        let h = harness();
        let before = chrono::Utc::now().timestamp_millis();

        let desc = h.controller.start_or_refresh(&request(), None).await.unwrap();

        let ahead = desc.refresh_at - before;
        assert!((39_000..=41_500).contains(&ahead), "refreshAt {} ms ahead", ahead);
        assert!(desc.has_audio);
        assert_eq!(desc.stream_options_id, "channel0");

        let status = h.controller.status().await;
        assert_eq!(status.state, StreamState::Active);
        let port = status.port.unwrap();
        assert!(desc.input_arguments.contains(&format!("udp://127.0.0.1:{}", port)));
        assert_eq!(status.pids.len(), 1);
        assert!(h.launcher.is_live(status.pids[0]));
        assert_eq!(*h.activator.calls.lock(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_port_and_process() {
        let h = harness();
        let first = h.controller.start_or_refresh(&request(), None).await.unwrap();
        let before = h.controller.status().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = h
            .controller
            .start_or_refresh(&request(), token(&first))
            .await
            .unwrap();

        let after = h.controller.status().await;
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.input_arguments, first.input_arguments);
        assert!(second.refresh_at - first.refresh_at >= 4_900);
        assert_eq!(after.port, before.port);
        assert_eq!(after.pids, before.pids);
        assert_eq!(h.launcher.launch_count(), 1);

        // Refreshes keep the session alive past the original keepalive deadline
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(8)).await;
            h.controller
                .start_or_refresh(&request(), token(&first))
                .await
                .unwrap();
        }
        assert_eq!(h.controller.status().await.state, StreamState::Active);

        // A start without a token reuses the running session as well
        let reused = h.controller.start_or_refresh(&request(), None).await.unwrap();
        assert_eq!(reused.session_id, first.session_id);
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_expiry_enters_cooldown() {
        let h = harness();
        h.controller.start_or_refresh(&request(), None).await.unwrap();
        let pid = h.controller.status().await.pids[0];

        tokio::time::sleep(Duration::from_millis(11_500)).await;

        let status = h.controller.status().await;
        assert_eq!(status.state, StreamState::Cooldown);
        assert!(!h.launcher.is_live(pid));
        assert_eq!(h.ports.reserved_count(), 0);
        let remaining = status.cooldown_remaining_ms.unwrap();
        assert!((9_000..=10_000).contains(&remaining));

        // The next start waits out the rest of the cooldown
        let waited = Instant::now();
        h.controller.start_or_refresh(&request(), None).await.unwrap();
        assert!(waited.elapsed() >= Duration::from_millis(9_000));
        assert_eq!(h.launcher.launch_count(), 2);
        assert!(h.activator.calls.lock().contains(&false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_during_cooldown_waits_remainder() {
        let h = harness();
        h.controller.start_or_refresh(&request(), None).await.unwrap();

        h.controller.stop().await;
        let stopped_at = Instant::now();
        assert_eq!(h.controller.status().await.state, StreamState::Cooldown);

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        h.controller.start_or_refresh(&request(), None).await.unwrap();

        let launches = h.launcher.launches.lock().clone();
        assert_eq!(launches.len(), 2);
        assert!(launches[1].0 >= stopped_at + Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_elapses_to_idle() {
        let h = harness();
        h.controller.start_or_refresh(&request(), None).await.unwrap();
        h.controller.stop().await;

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(h.controller.status().await.state, StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_spawn_once() {
        let h = harness();
        let req = request();

        let results = join_all((0..20).map(|_| h.controller.start_or_refresh(&req, None))).await;

        let ids: HashSet<u64> = results
            .into_iter()
            .map(|r| r.unwrap().session_id)
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.launcher.launch_count(), 1);
        assert_eq!(h.ports.reserved_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_start_aborts() {
        let h = harness();
        let controller = h.controller.clone();
        let starter = tokio::spawn(async move { controller.start_or_refresh(&request(), None).await });

        // Launch is in flight
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.controller.status().await.state, StreamState::Starting);
        h.controller.stop().await;

        assert_eq!(starter.await.unwrap(), Err(StreamError::StartAborted));
        assert_eq!(h.controller.status().await.state, StreamState::Cooldown);
        assert!(h.launcher.live.lock().is_empty());
        assert_eq!(h.ports.reserved_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_failure_reaches_joined_callers() {
        let h = harness();
        h.launcher
            .fail_next(StreamError::SpawnFailed("gst-launch-1.0: not found".to_string()));
        let mut events = h.events.subscribe();
        let req = request();

        let results = join_all((0..3).map(|_| h.controller.start_or_refresh(&req, None))).await;
        for result in results {
            assert!(matches!(result, Err(StreamError::SpawnFailed(_))));
        }

        assert_eq!(h.controller.status().await.state, StreamState::Idle);
        assert_eq!(h.ports.reserved_count(), 0);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, SystemEvent::StreamStartFailed { .. });
        }
        assert!(saw_failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_retries_on_fresh_port() {
        let h = harness();
        h.launcher.fail_next(StreamError::EarlyExit("address in use".to_string()));

        h.controller.start_or_refresh(&request(), None).await.unwrap();

        let launches = h.launcher.launches.lock().clone();
        assert_eq!(launches.len(), 2);
        assert_ne!(launches[0].1, launches[1].1);
        assert_eq!(h.ports.reserved_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_exit_exhausts_retries() {
        let h = harness();
        for _ in 0..3 {
            h.launcher.fail_next(StreamError::EarlyExit("address in use".to_string()));
        }

        let result = h.controller.start_or_refresh(&request(), None).await;
        assert!(matches!(result, Err(StreamError::SpawnFailed(_))));
        assert_eq!(h.launcher.launch_count(), 3);
        assert_eq!(h.ports.reserved_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_drives_silent_cooldown() {
        let h = harness();
        let desc = h.controller.start_or_refresh(&request(), None).await.unwrap();
        let pid = h.controller.status().await.pids[0];
        let mut events = h.events.subscribe();

        h.launcher.crash(pid);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.controller.status().await.state, StreamState::Cooldown);
        assert_eq!(h.ports.reserved_count(), 0);

        let mut saw_exit = false;
        while let Ok(event) = events.try_recv() {
            saw_exit |= matches!(event, SystemEvent::StreamPipelineExited { .. });
        }
        assert!(saw_exit);

        // The stale token no longer refreshes anything
        assert_eq!(
            h.controller.start_or_refresh(&request(), token(&desc)).await,
            Err(StreamError::RefreshOnNoSession)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_without_session() {
        let h = harness();
        let result = h
            .controller
            .start_or_refresh(&request(), Some(RefreshToken::default()))
            .await;
        assert_eq!(result, Err(StreamError::RefreshOnNoSession));
        assert_eq!(h.launcher.launch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_token_is_rejected() {
        let h = harness();
        let desc = h.controller.start_or_refresh(&request(), None).await.unwrap();
        let stale = Some(RefreshToken {
            session_id: Some(desc.session_id + 7),
        });
        assert_eq!(
            h.controller.start_or_refresh(&request(), stale).await,
            Err(StreamError::RefreshOnNoSession)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_source_is_config_invalid() {
        let h = harness();
        let mut req = request();
        req.source.host = None;

        let result = h.controller.start_or_refresh(&req, None).await;
        assert!(matches!(result, Err(StreamError::ConfigInvalid(_))));
        assert_eq!(h.launcher.launch_count(), 0);
        assert_eq!(h.controller.status().await.state, StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let h = harness();
        h.controller.stop().await;
        h.controller.stop().await;
        assert_eq!(h.controller.status().await.state, StreamState::Idle);

        h.controller.start_or_refresh(&request(), None).await.unwrap();
        h.controller.stop().await;
        h.controller.stop().await;
        assert_eq!(h.controller.status().await.state, StreamState::Cooldown);
        assert!(h.launcher.live.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cooldown_goes_idle() {
        let h = harness();
        let mut req = request();
        req.config.cooldown_ms = 0;

        h.controller.start_or_refresh(&req, None).await.unwrap();
        h.controller.stop().await;
        assert_eq!(h.controller.status().await.state, StreamState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_sends_wake_off() {
        let h = harness();
        h.launcher
            .fail_next(StreamError::SpawnFailed("gst-launch-1.0: not found".to_string()));

        let result = h.controller.start_or_refresh(&request(), None).await;
        assert!(matches!(result, Err(StreamError::SpawnFailed(_))));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*h.activator.calls.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_send_wake_off() {
        let h = harness();
        for _ in 0..3 {
            h.launcher.fail_next(StreamError::EarlyExit("address in use".to_string()));
        }

        assert!(h.controller.start_or_refresh(&request(), None).await.is_err());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*h.activator.calls.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_wake_signal_does_not_block_start() {
        let h = harness();
        h.activator.set_behavior(WakeBehavior::Fail);

        let started = Instant::now();
        h.controller.start_or_refresh(&request(), None).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(h.controller.status().await.state, StreamState::Active);

        // Wake-off failures do not disturb the stop either
        h.controller.stop().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.controller.status().await.state, StreamState::Cooldown);
        assert_eq!(*h.activator.calls.lock(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_wake_signal_is_bounded() {
        let h = harness();
        h.activator.set_behavior(WakeBehavior::Hang);

        let started = Instant::now();
        h.controller.start_or_refresh(&request(), None).await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "started after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "started after {:?}", elapsed);
        assert_eq!(h.controller.status().await.state, StreamState::Active);
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_before_activation_fails_start() {
        let h = harness();
        h.launcher.exit_next_on_launch();

        let result = h.controller.start_or_refresh(&request(), None).await;
        assert!(matches!(result, Err(StreamError::SpawnFailed(_))), "{:?}", result);

        assert_eq!(h.controller.status().await.state, StreamState::Idle);
        assert_eq!(h.ports.reserved_count(), 0);
        assert!(h.launcher.live.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_settle_follows_request() {
        let h = harness();
        let mut req = request();
        req.config.spawn_settle_ms = 750;

        let started = Instant::now();
        h.controller.start_or_refresh(&req, None).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(750));
        assert_eq!(h.launcher.plans.lock()[0].settle, Duration::from_millis(750));
    }
}
