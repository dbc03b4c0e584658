//! In-process fakes for the stream collaborators

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use super::pipeline::PipelinePlan;
use super::port::{PortAllocator, PortProbe};
use super::process::{ExitCallback, ExitReport, PipelineHandle, PipelineLauncher};
use super::session::ControllerDeps;
use super::wake::StreamActivator;
use crate::error::StreamError;
use crate::events::EventBus;

pub struct AlwaysFree;

#[async_trait]
impl PortProbe for AlwaysFree {
    async fn is_free(&self, _port: u16) -> bool {
        true
    }
}

/// Launcher that pretends to spawn and tracks which fake pids are alive
#[derive(Default)]
pub struct FakeLauncher {
    next_pid: AtomicU32,
    /// Launch instant and port of every attempt
    pub launches: Mutex<Vec<(Instant, u16)>>,
    pub plans: Mutex<Vec<PipelinePlan>>,
    failures: Mutex<VecDeque<StreamError>>,
    /// Launches whose pipeline exits right after spawn confirmation
    exits_on_launch: AtomicU32,
    pub live: Arc<Mutex<HashSet<u32>>>,
    callbacks: Mutex<Vec<(u32, ExitCallback)>>,
}

impl FakeLauncher {
    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    /// Make the next launch fail with `err` after the settle time
    pub fn fail_next(&self, err: StreamError) {
        self.failures.lock().push_back(err);
    }

    /// Make the next launch succeed but report an exit before it returns
    pub fn exit_next_on_launch(&self) {
        self.exits_on_launch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_live(&self, pid: u32) -> bool {
        self.live.lock().contains(&pid)
    }

    /// Simulate the pipeline dying on its own
    pub fn crash(&self, pid: u32) {
        self.live.lock().remove(&pid);
        let callback = {
            let mut callbacks = self.callbacks.lock();
            let idx = callbacks.iter().position(|(p, _)| *p == pid);
            idx.map(|i| callbacks.remove(i).1)
        };
        if let Some(callback) = callback {
            callback(ExitReport {
                stage: "receiver",
                pid: Some(pid),
                status: "exit status: 1".to_string(),
                success: false,
                last_output: vec!["connection lost".to_string()],
            });
        }
    }
}

struct FakeHandle {
    pid: u32,
    live: Arc<Mutex<HashSet<u32>>>,
}

#[async_trait]
impl PipelineHandle for FakeHandle {
    fn pids(&self) -> Vec<u32> {
        if self.live.lock().contains(&self.pid) {
            vec![self.pid]
        } else {
            vec![]
        }
    }

    async fn kill(&mut self) {
        self.live.lock().remove(&self.pid);
    }
}

#[async_trait]
impl PipelineLauncher for Arc<FakeLauncher> {
    async fn launch(
        &self,
        _camera_id: &str,
        plan: &PipelinePlan,
        on_exit: ExitCallback,
    ) -> Result<Box<dyn PipelineHandle>, StreamError> {
        self.launches.lock().push((Instant::now(), plan.port));
        self.plans.lock().push(plan.clone());
        tokio::time::sleep(plan.settle).await;

        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let pid = 1000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.live.lock().insert(pid);
        self.callbacks.lock().push((pid, on_exit));

        let exits = self
            .exits_on_launch
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if exits {
            self.crash(pid);
            // Let the exit notification land before the launch returns
            tokio::task::yield_now().await;
        }

        Ok(Box::new(FakeHandle {
            pid,
            live: self.live.clone(),
        }))
    }
}

/// How the fake base station answers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WakeBehavior {
    #[default]
    Accept,
    Fail,
    /// Never answers
    Hang,
}

/// Activator recording every signal
#[derive(Default)]
pub struct FakeActivator {
    pub calls: Mutex<Vec<bool>>,
    behavior: Mutex<WakeBehavior>,
}

impl FakeActivator {
    pub fn set_behavior(&self, behavior: WakeBehavior) {
        *self.behavior.lock() = behavior;
    }
}

#[async_trait]
impl StreamActivator for Arc<FakeActivator> {
    async fn set_stream_active(&self, _camera_id: &str, active: bool) -> Result<(), StreamError> {
        self.calls.lock().push(active);
        let behavior = *self.behavior.lock();
        match behavior {
            WakeBehavior::Accept => Ok(()),
            WakeBehavior::Fail => Err(StreamError::UpstreamUnresponsive(
                "base station returned 500".to_string(),
            )),
            WakeBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Controller dependencies wired to fakes
pub struct FakeDeps {
    pub deps: ControllerDeps,
    pub launcher: Arc<FakeLauncher>,
    pub activator: Arc<FakeActivator>,
    pub ports: Arc<PortAllocator>,
    pub events: Arc<EventBus>,
}

pub fn fake_deps() -> FakeDeps {
    let launcher = Arc::new(FakeLauncher::default());
    let activator = Arc::new(FakeActivator::default());
    let ports = Arc::new(PortAllocator::with_parts(
        40000..=40999,
        10,
        Box::new(StdRng::seed_from_u64(1)),
        Box::new(AlwaysFree),
    ));
    let events = Arc::new(EventBus::new());
    let deps = ControllerDeps {
        ports: ports.clone(),
        launcher: Arc::new(launcher.clone()),
        activator: Arc::new(activator.clone()),
        events: events.clone(),
    };
    FakeDeps {
        deps,
        launcher,
        activator,
        ports,
        events,
    }
}
