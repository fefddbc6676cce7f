//! # Prioritization Bridge
//!
//! Background thread relaying prioritization directives from an external
//! process into the engine's state scheduler.
//!
//! ## Loop
//!
//! ```text
//! while running:
//!     sleep(poll_interval)
//!     try_receive(channel) ── nothing ──▶ next cycle
//!         │
//!         ▼
//!     requested ∩ live states ──▶ Prioritizer::apply_priority_set
//! ```
//!
//! ## Guarantees
//!
//! - Best-effort: a failed or empty receive is "no directive this cycle".
//! - States that are no longer live are dropped silently; the external
//!   process may be working from a stale view.
//! - Cancellation is cooperative. Stopping does not interrupt a sleep or a
//!   receive, it only prevents the next cycle, so shutdown completes within
//!   one poll interval plus one receive timeout.
//! - The bridge never touches tracker state. Its owner joins it before the
//!   channel or the engine handles go away.

use crate::primitives::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_RECEIVE_TIMEOUT_MS};
use crate::{AmbaError, EngineStateId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// =============================================================================
// COLLABORATOR TRAITS
// =============================================================================

/// Source of prioritization directives.
pub trait DirectiveChannel: Send {
    /// Append the next directive's engine state ids to `out`.
    ///
    /// Returns `false` when nothing was available within the channel's
    /// timeout. Failures are reported as `false` too.
    fn try_receive(&mut self, out: &mut Vec<EngineStateId>) -> bool;
}

/// View of the engine's currently live states.
pub trait LiveStates: Send + Sync {
    /// Engine ids of all states the engine currently keeps.
    fn live_states(&self) -> BTreeSet<EngineStateId>;
}

/// Capability of a scheduler to favor a set of states.
pub trait Prioritizer: Send + Sync {
    /// Favor `states` in upcoming scheduling decisions. Fire-and-forget.
    fn apply_priority_set(&self, states: &BTreeSet<EngineStateId>);
}

/// The engine's active state scheduler.
pub trait Scheduler: Send + Sync {
    /// The scheduler's prioritization capability, if it has one.
    fn prioritizer(&self) -> Option<Arc<dyn Prioritizer>> {
        None
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Floor for both intervals; 0 would turn the loop into a busy spin.
const MIN_INTERVAL_MS: u64 = 1;

/// Timing of the bridge loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Sleep between two poll cycles.
    pub poll_interval_ms: u64,
    /// Maximum time one receive may block.
    pub receive_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    /// Poll interval as a `Duration`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_INTERVAL_MS))
    }

    /// Receive timeout as a `Duration`.
    #[must_use]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(MIN_INTERVAL_MS))
    }

    /// Upper bound between a stop request and the thread exiting.
    #[must_use]
    pub fn shutdown_bound(&self) -> Duration {
        self.poll_interval() + self.receive_timeout()
    }
}

// =============================================================================
// IN-PROCESS CHANNEL
// =============================================================================

/// [`DirectiveChannel`] fed from the same process through an mpsc queue.
#[derive(Debug)]
pub struct QueueChannel {
    receiver: Receiver<Vec<EngineStateId>>,
    timeout: Duration,
}

/// Create an in-process directive queue whose receives wait up to `timeout`.
#[must_use]
pub fn queue_channel(timeout: Duration) -> (Sender<Vec<EngineStateId>>, QueueChannel) {
    let (sender, receiver) = mpsc::channel();
    (sender, QueueChannel { receiver, timeout })
}

impl DirectiveChannel for QueueChannel {
    fn try_receive(&mut self, out: &mut Vec<EngineStateId>) -> bool {
        match self.receiver.recv_timeout(self.timeout) {
            Ok(states) => {
                out.extend(states);
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }
}

// =============================================================================
// STATE & STATS
// =============================================================================

/// Lifecycle of the bridge thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    /// Polling.
    Running,
    /// Stop requested; the current cycle is still finishing.
    Stopping,
    /// The thread has returned.
    Stopped,
}

/// Counters updated by the bridge thread.
#[derive(Debug, Default)]
struct BridgeCounters {
    cycles: AtomicU64,
    directives: AtomicU64,
    states_applied: AtomicU64,
    states_dropped: AtomicU64,
}

/// Point-in-time copy of the bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    /// Poll cycles started.
    pub cycles: u64,
    /// Directives received.
    pub directives: u64,
    /// States handed to the prioritizer.
    pub states_applied: u64,
    /// Requested states that were no longer live.
    pub states_dropped: u64,
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Handle to the running bridge thread.
///
/// Dropping the handle stops and joins the thread.
#[derive(Debug)]
pub struct PrioritizationBridge {
    active: Arc<AtomicBool>,
    counters: Arc<BridgeCounters>,
    handle: Option<JoinHandle<()>>,
}

impl PrioritizationBridge {
    /// Start the bridge thread.
    ///
    /// The scheduler's prioritization capability is looked up once, here.
    /// Without it the bridge does not start and
    /// `AmbaError::PrioritizationUnsupported` is returned.
    pub fn spawn<C>(
        channel: C,
        engine: Arc<dyn LiveStates>,
        scheduler: &dyn Scheduler,
        config: &BridgeConfig,
    ) -> Result<Self, AmbaError>
    where
        C: DirectiveChannel + 'static,
    {
        let Some(prioritizer) = scheduler.prioritizer() else {
            tracing::warn!("active scheduler cannot apply priority sets; bridge not started");
            return Err(AmbaError::PrioritizationUnsupported);
        };

        let active = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(BridgeCounters::default());
        let worker = Worker {
            channel,
            engine,
            prioritizer,
            active: Arc::clone(&active),
            counters: Arc::clone(&counters),
            poll_interval: config.poll_interval(),
        };

        let handle = thread::Builder::new()
            .name("amba-prioritization".to_string())
            .spawn(move || worker.run())
            .map_err(|e| AmbaError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            active,
            counters,
            handle: Some(handle),
        })
    }

    /// The shared cooperative stop flag (`true` while running).
    #[must_use]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.active)
    }

    /// Request the thread to stop after its current cycle.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BridgeState {
        match &self.handle {
            Some(handle) if !handle.is_finished() => {
                if self.active.load(Ordering::Acquire) {
                    BridgeState::Running
                } else {
                    BridgeState::Stopping
                }
            }
            _ => BridgeState::Stopped,
        }
    }

    /// Copy of the counters.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            directives: self.counters.directives.load(Ordering::Relaxed),
            states_applied: self.counters.states_applied.load(Ordering::Relaxed),
            states_dropped: self.counters.states_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop the thread and wait for it to return.
    pub fn shutdown(mut self) -> BridgeStats {
        self.stop_and_join();
        self.stats()
    }

    fn stop_and_join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("prioritization bridge thread panicked");
        }
    }
}

impl Drop for PrioritizationBridge {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// State moved onto the bridge thread.
struct Worker<C> {
    channel: C,
    engine: Arc<dyn LiveStates>,
    prioritizer: Arc<dyn Prioritizer>,
    active: Arc<AtomicBool>,
    counters: Arc<BridgeCounters>,
    poll_interval: Duration,
}

impl<C: DirectiveChannel> Worker<C> {
    fn run(mut self) {
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "prioritization bridge started"
        );

        let mut receive_buffer = Vec::new();
        while self.active.load(Ordering::Acquire) {
            thread::sleep(self.poll_interval);
            self.counters.cycles.fetch_add(1, Ordering::Relaxed);

            receive_buffer.clear();
            if !self.channel.try_receive(&mut receive_buffer) {
                continue;
            }
            self.counters.directives.fetch_add(1, Ordering::Relaxed);
            self.relay(&receive_buffer);
        }

        tracing::info!("prioritization bridge stopped");
    }

    fn relay(&self, requested: &[EngineStateId]) {
        let requested: BTreeSet<EngineStateId> = requested.iter().copied().collect();
        let live = self.engine.live_states();
        let selected: BTreeSet<EngineStateId> = requested.intersection(&live).copied().collect();

        let dropped = requested.len() - selected.len();
        if dropped > 0 {
            tracing::debug!(dropped, "ignoring directive states that are no longer live");
            self.counters
                .states_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }
        if selected.is_empty() {
            return;
        }

        tracing::debug!(states = ?selected, "applying priority set");
        self.prioritizer.apply_priority_set(&selected);
        self.counters
            .states_applied
            .fetch_add(selected.len() as u64, Ordering::Relaxed);
    }
}

// =============================================================================
// TESTS
// =============================================================================
