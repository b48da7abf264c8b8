//! Periodic liveness probe for Tether connections.
//!
//! A [`KeepAlive`] owns one background task that calls a [`Probe`] on a
//! fixed interval. The client starts it the moment a socket opens, with no
//! identity, and restarts it once an identity is established so later
//! probes can name the peer. It is stopped when the socket closes.
//!
//! The monitor only sends. A missing acknowledgement is never acted on
//! here; dead connections surface through the transport's own close and
//! failure signals.
//!
//! ```ignore
//! let mut keepalive = KeepAlive::new(KeepAliveConfig::default());
//! keepalive.start(None, probe.clone());           // socket open
//! keepalive.start(Some(identity), probe.clone()); // identity established
//! keepalive.stop();                               // socket closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tether_protocol::Identity;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for the keepalive monitor.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Time between probes. Default: 10 s.
    pub interval: Duration,
    /// Random delay (0..max) added before the *first* probe, so that many
    /// connections opened together do not probe in lockstep. Default: none.
    pub initial_jitter: Duration,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            initial_jitter: Duration::ZERO,
        }
    }
}

impl KeepAliveConfig {
    /// Shortest interval accepted.
    pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

    /// A config with the given interval and no jitter.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    /// Clamps out-of-range values so the config is safe to use.
    ///
    /// Called automatically by [`KeepAlive::new`].
    pub fn validated(mut self) -> Self {
        if self.interval < Self::MIN_INTERVAL {
            warn!(
                interval_ms = self.interval.as_millis() as u64,
                min_ms = Self::MIN_INTERVAL.as_millis() as u64,
                "keepalive interval below minimum, clamping"
            );
            self.interval = Self::MIN_INTERVAL;
        }
        self
    }

    fn first_delay(&self) -> Duration {
        let max = self.initial_jitter.as_micros() as u64;
        if max == 0 {
            return self.interval;
        }
        let jitter = Duration::from_micros(rand::rng().random_range(0..max));
        self.interval + jitter
    }
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Sends one keepalive on the connection being monitored.
///
/// Called from the monitor's task, so it must not block. Implementations
/// hand the message to the connection's outbound sender, the same one
/// application traffic uses.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, identity: Option<&Identity>);
}

impl<F> Probe for F
where
    F: Fn(Option<&Identity>) + Send + Sync + 'static,
{
    fn probe(&self, identity: Option<&Identity>) {
        self(identity)
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// The keepalive monitor for one connection.
///
/// Dropping it stops the background task.
pub struct KeepAlive {
    config: KeepAliveConfig,
    task: Option<JoinHandle<()>>,
    probes_sent: Arc<AtomicU64>,
}

impl KeepAlive {
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config: config.validated(),
            task: None,
            probes_sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Starts probing, replacing any running task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&mut self, identity: Option<Identity>, probe: Arc<dyn Probe>) {
        self.stop();

        let interval = self.config.interval;
        let first = Instant::now() + self.config.first_delay();
        let probes_sent = Arc::clone(&self.probes_sent);

        debug!(
            interval_ms = interval.as_millis() as u64,
            identified = identity.is_some(),
            "keepalive started"
        );

        self.task = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(first, interval);
            // A stalled runtime should not produce a burst of probes.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let n = probes_sent.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(probe = n, "keepalive probe");
                probe.probe(identity.as_ref());
            }
        }));
    }

    /// Stops probing. Safe to call when not running.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("keepalive stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Total probes sent across every start.
    pub fn probes_sent(&self) -> u64 {
        self.probes_sent.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}
