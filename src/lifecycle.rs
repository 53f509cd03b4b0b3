//! Idle lifecycle controller
//!
//! Wakes the backend group on new traffic and pauses or stops it once the
//! proxy has seen no traffic for the configured delay.
//!
//! All controller state sits behind one mutex that is never held across an
//! `.await`. At most one delayed action exists at a time: it is either pending
//! (racing its timer against a cancel signal) or in flight (talking to the
//! driver). New traffic bumps a generation counter, which cancels a pending
//! action and stops an in-flight pause from arming its follow-up stop.
//!
//! Backend state is re-queried from the driver at every decision point
//! instead of being cached, since the units can be changed from outside.

use crate::backend::{BackendGroup, GroupState};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Nothing scheduled or running
    Idle,
    /// A delayed pause/stop is waiting for its deadline
    ActionPending,
    /// A pause/stop is executing against the driver
    ActionInFlight,
}

/// What to do with an idle backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownAction {
    Pause,
    Stop,
}

impl ShutdownAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownAction::Pause => "pause",
            ShutdownAction::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Global silence required before acting
    pub shutdown_delay: Duration,
    pub action: ShutdownAction,
    /// Time a paused backend is kept before it is stopped; zero never stops
    pub pause_duration: Duration,
}

/// Non-blocking "new connection" notification.
///
/// Notifications coalesce: firing while one is already waiting to be consumed
/// is a no-op, so producers never stall on a slow or absent consumer.
#[derive(Debug, Clone, Default)]
pub struct TrafficSignal {
    notify: Arc<Notify>,
}

impl TrafficSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait for the next notification
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Snapshot of a pending action for the control surface
#[derive(Debug, Clone, Serialize)]
pub struct PendingStatus {
    pub action: ShutdownAction,
    pub remaining_ms: u64,
    /// Scheduled as the follow-up stop of a pause
    pub after_pause: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleStatus {
    pub state: LifecycleState,
    pub pending: Option<PendingStatus>,
    pub in_flight: Option<ShutdownAction>,
}

struct PendingAction {
    id: u64,
    action: ShutdownAction,
    after_pause: bool,
    deadline: Instant,
    cancel: watch::Sender<bool>,
}

struct InFlightAction {
    id: u64,
    action: ShutdownAction,
}

#[derive(Default)]
struct Shared {
    /// Bumped on every traffic event
    generation: u64,
    next_action_id: u64,
    pending: Option<PendingAction>,
    in_flight: Option<InFlightAction>,
}

impl Shared {
    fn state(&self) -> LifecycleState {
        if self.in_flight.is_some() {
            LifecycleState::ActionInFlight
        } else if self.pending.is_some() {
            LifecycleState::ActionPending
        } else {
            LifecycleState::Idle
        }
    }
}

struct Inner {
    group: BackendGroup,
    policy: LifecyclePolicy,
    shared: Mutex<Shared>,
    signal: TrafficSignal,
}

/// Restores `Idle` when an in-flight action ends, including by panic.
///
/// If traffic arrived while the action ran, the traffic signal is fired again
/// so the backend gets resumed right after.
struct InFlightGuard {
    inner: Arc<Inner>,
    id: u64,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let traffic_seen = {
            let mut shared = self.inner.shared.lock();
            if shared.in_flight.as_ref().map(|f| f.id) == Some(self.id) {
                shared.in_flight = None;
            }
            shared.generation != self.generation
        };
        if traffic_seen {
            self.inner.signal.notify();
        }
    }
}

/// Debounced, cancellable idle lifecycle state machine
#[derive(Clone)]
pub struct LifecycleController {
    inner: Arc<Inner>,
}

impl LifecycleController {
    pub fn new(group: BackendGroup, policy: LifecyclePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                group,
                policy,
                shared: Mutex::new(Shared::default()),
                signal: TrafficSignal::new(),
            }),
        }
    }

    pub fn group(&self) -> &BackendGroup {
        &self.inner.group
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.inner.policy
    }

    /// Handle the relay fires on every new connection
    pub fn traffic_signal(&self) -> TrafficSignal {
        self.inner.signal.clone()
    }

    /// Inject a synthetic new-connection event
    pub fn simulate_connection(&self) {
        info!(group = %self.inner.group.name(), "Simulated connection");
        self.inner.signal.notify();
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.shared.lock().state()
    }

    pub fn status(&self) -> LifecycleStatus {
        let shared = self.inner.shared.lock();
        let now = Instant::now();
        LifecycleStatus {
            state: shared.state(),
            pending: shared.pending.as_ref().map(|p| PendingStatus {
                action: p.action,
                remaining_ms: p.deadline.saturating_duration_since(now).as_millis() as u64,
                after_pause: p.after_pause,
            }),
            in_flight: shared.in_flight.as_ref().map(|f| f.action),
        }
    }

    /// Consume traffic notifications until shutdown
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            group = %self.inner.group.name(),
            action = self.inner.policy.action.as_str(),
            shutdown_delay_ms = self.inner.policy.shutdown_delay.as_millis() as u64,
            pause_duration_ms = self.inner.policy.pause_duration.as_millis() as u64,
            "Lifecycle controller started"
        );

        loop {
            tokio::select! {
                _ = self.inner.signal.notified() => {
                    self.on_traffic().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        self.cancel_pending();
        debug!("Lifecycle controller stopped");
    }

    /// React to new traffic: cancel any pending action and resume the backend
    pub async fn on_traffic(&self) {
        let in_flight = {
            let mut shared = self.inner.shared.lock();
            shared.generation += 1;
            if let Some(pending) = shared.pending.take() {
                let _ = pending.cancel.send(true);
                info!(
                    group = %self.inner.group.name(),
                    action = pending.action.as_str(),
                    "Connection detected, aborting pending backend action"
                );
            }
            shared.in_flight.is_some()
        };

        if in_flight {
            debug!(
                group = %self.inner.group.name(),
                "Backend action in flight, resuming once it completes"
            );
            return;
        }

        self.resume_backend().await;
    }

    async fn resume_backend(&self) {
        let group = &self.inner.group;

        if group.any_paused().await {
            info!(group = %group.name(), "Unpausing backend");
            group.unpause().await;
        }
        if group.any_not_running().await {
            info!(group = %group.name(), "Starting backend");
            group.start().await;
        }
    }

    /// Number of traffic events handled so far
    pub fn traffic_generation(&self) -> u64 {
        self.inner.shared.lock().generation
    }

    /// React to the no-traffic condition.
    ///
    /// Schedules the configured action after the shutdown delay when the
    /// controller is idle and the backend is running and unpaused. Returns
    /// whether an action was scheduled.
    pub async fn on_no_traffic(&self) -> bool {
        self.on_no_traffic_since(self.traffic_generation()).await
    }

    /// Like [`on_no_traffic`](Self::on_no_traffic), for a verdict reached
    /// when the traffic generation was `generation`.
    ///
    /// Traffic handled after that point voids the verdict, since the client
    /// behind it will not signal again.
    pub async fn on_no_traffic_since(&self, generation: u64) -> bool {
        {
            let shared = self.inner.shared.lock();
            if shared.state() != LifecycleState::Idle || shared.generation != generation {
                return false;
            }
        }

        let group_state = self.inner.group.state().await;
        if group_state != GroupState::Running {
            debug!(group = %self.inner.group.name(), state = ?group_state, "Backend not running, nothing to do");
            return false;
        }

        let mut shared = self.inner.shared.lock();
        if shared.generation != generation {
            debug!(group = %self.inner.group.name(), "Traffic arrived during idle check, not scheduling");
            return false;
        }
        // State may have moved while the driver was queried
        if shared.state() != LifecycleState::Idle {
            return false;
        }

        let action = self.inner.policy.action;
        let delay = self.inner.policy.shutdown_delay;
        info!(
            group = %self.inner.group.name(),
            action = action.as_str(),
            delay_secs = delay.as_secs_f64(),
            "No traffic, scheduling backend action"
        );
        self.schedule_locked(&mut shared, action, delay, false);
        true
    }

    fn cancel_pending(&self) {
        if let Some(pending) = self.inner.shared.lock().pending.take() {
            let _ = pending.cancel.send(true);
        }
    }

    fn schedule_locked(
        &self,
        shared: &mut Shared,
        action: ShutdownAction,
        delay: Duration,
        after_pause: bool,
    ) {
        shared.next_action_id += 1;
        let id = shared.next_action_id;
        let generation = shared.generation;
        let deadline = Instant::now() + delay;
        let (cancel, cancel_rx) = watch::channel(false);

        shared.pending = Some(PendingAction {
            id,
            action,
            after_pause,
            deadline,
            cancel,
        });

        let controller = self.clone();
        tokio::spawn(async move {
            controller
                .run_delayed(id, generation, action, after_pause, deadline, cancel_rx)
                .await;
        });
    }

    async fn run_delayed(
        self,
        id: u64,
        generation: u64,
        action: ShutdownAction,
        after_pause: bool,
        deadline: Instant,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = cancel_rx.changed() => {
                debug!(action = action.as_str(), "Pending backend action cancelled");
                return;
            }
        }

        {
            let mut shared = self.inner.shared.lock();
            let still_ours = shared.pending.as_ref().map(|p| p.id) == Some(id)
                && shared.generation == generation;
            if !still_ours {
                return;
            }
            shared.pending = None;
            shared.in_flight = Some(InFlightAction { id, action });
        }

        let _guard = InFlightGuard {
            inner: Arc::clone(&self.inner),
            id,
            generation,
        };
        let group = &self.inner.group;

        // Re-check: someone else may have changed the backend meanwhile
        let state = group.state().await;
        let applicable = if after_pause {
            state != GroupState::Stopped
        } else {
            state == GroupState::Running
        };
        if !applicable {
            info!(
                group = %group.name(),
                action = action.as_str(),
                state = ?state,
                "Backend state changed, skipping action"
            );
            return;
        }

        match action {
            ShutdownAction::Stop => {
                info!(group = %group.name(), "Stopping backend");
                let failures = group.stop().await;
                if failures > 0 {
                    warn!(group = %group.name(), failures, "Backend stop incomplete");
                } else {
                    info!(group = %group.name(), "Backend stopped");
                }
            }
            ShutdownAction::Pause => {
                info!(group = %group.name(), "Pausing backend");
                let failures = group.pause().await;
                if failures > 0 {
                    warn!(group = %group.name(), failures, "Backend pause incomplete");
                } else {
                    info!(group = %group.name(), "Backend paused");
                }

                let pause_duration = self.inner.policy.pause_duration;
                if !pause_duration.is_zero() {
                    self.schedule_stop_after_pause(id, generation, pause_duration);
                }
            }
        }
    }

    fn schedule_stop_after_pause(&self, id: u64, generation: u64, delay: Duration) {
        let mut shared = self.inner.shared.lock();
        if shared.generation != generation {
            info!(
                group = %self.inner.group.name(),
                "Traffic arrived during pause, not scheduling stop"
            );
            return;
        }
        if shared.in_flight.as_ref().map(|f| f.id) == Some(id) {
            shared.in_flight = None;
        }

        info!(
            group = %self.inner.group.name(),
            delay_secs = delay.as_secs_f64(),
            "Scheduling stop of paused backend"
        );
        self.schedule_locked(&mut shared, ShutdownAction::Stop, delay, true);
    }
}
