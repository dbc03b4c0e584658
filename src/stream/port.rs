//! Ephemeral transport port allocation
//!
//! Ports are drawn at random from the configured range and probed with a
//! transient loopback bind. A reservation set shared by all cameras closes
//! the window where two concurrent starts could probe the same free port.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{AppError, StreamError};
use crate::utils::probe_loopback_port;

/// Checks whether a port can currently be bound
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_free(&self, port: u16) -> bool;
}

/// Probe by binding TCP and UDP sockets on 127.0.0.1
pub struct LoopbackProbe;

#[async_trait]
impl PortProbe for LoopbackProbe {
    async fn is_free(&self, port: u16) -> bool {
        tokio::task::spawn_blocking(move || probe_loopback_port(port))
            .await
            .unwrap_or(false)
    }
}

/// Port reservation held for the lifetime of a stream session
///
/// Dropping the lease returns the port to the pool. The controller drops it
/// only after the pipeline process has been reaped.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.port);
        debug!("Released port {}", self.port);
    }
}

/// Allocator shared by every camera's stream controller
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    default_attempts: u32,
    reserved: Arc<Mutex<HashSet<u16>>>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    probe: Box<dyn PortProbe>,
}

impl PortAllocator {
    /// Allocator over `range` using loopback probes and an entropy-seeded RNG
    pub fn new(range: RangeInclusive<u16>, default_attempts: u32) -> Self {
        Self::with_parts(
            range,
            default_attempts,
            Box::new(StdRng::from_entropy()),
            Box::new(LoopbackProbe),
        )
    }

    /// Allocator for the configured port range
    ///
    /// The stored configuration may have been edited by hand, so it is
    /// validated before any port is picked.
    pub fn from_config(config: &StreamConfig) -> Result<Self, AppError> {
        config.validate().map_err(AppError::Config)?;
        Ok(Self::new(
            config.port_range_start..=config.port_range_end,
            config.port_probe_attempts,
        ))
    }

    /// Allocator with an injected randomness source and probe
    pub fn with_parts(
        range: RangeInclusive<u16>,
        default_attempts: u32,
        rng: Box<dyn RngCore + Send>,
        probe: Box<dyn PortProbe>,
    ) -> Self {
        Self {
            range,
            default_attempts: default_attempts.max(1),
            reserved: Arc::new(Mutex::new(HashSet::new())),
            rng: Mutex::new(rng),
            probe,
        }
    }

    /// Allocate with the configured number of attempts
    pub async fn allocate(&self) -> Result<PortLease, StreamError> {
        self.allocate_with_attempts(self.default_attempts).await
    }

    /// Probe up to `max_attempts` random ports and lease the first free one
    pub async fn allocate_with_attempts(&self, max_attempts: u32) -> Result<PortLease, StreamError> {
        debug!("Trying to find a free port in {:?}", self.range);
        if self.range.is_empty() {
            return Err(StreamError::NoPortFound { attempts: 0 });
        }

        for _ in 0..max_attempts {
            let port = self.rng.lock().gen_range(self.range.clone());

            if !self.reserved.lock().insert(port) {
                continue;
            }
            // Reserved before probing, so a concurrent allocation cannot pick
            // the same port while this probe is in flight.
            let lease = PortLease {
                port,
                reserved: self.reserved.clone(),
            };

            if self.probe.is_free(port).await {
                debug!("Found free port: {}", port);
                return Ok(lease);
            }
        }

        Err(StreamError::NoPortFound {
            attempts: max_attempts,
        })
    }

    /// Number of ports currently leased
    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }
}
