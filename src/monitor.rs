//! Periodic idle sweep
//!
//! Every tick prunes idle connections from the relay and, when none remain,
//! reports the no-traffic condition to the lifecycle controller.
//!
//! The controller's traffic generation is read before connections are
//! counted. A client that connects after the count signals afterwards, so the
//! controller sees the generation move and drops the stale verdict.

use crate::lifecycle::LifecycleController;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Something that tracks client connections and can expire idle ones
pub trait ActivitySource: Send + Sync {
    /// Close connections idle past their timeout, returning how many were closed
    fn prune_idle(&self) -> usize;

    fn active_connections(&self) -> usize;
}

/// Result of a single sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub pruned: usize,
    pub active: usize,
    /// A pause/stop was scheduled by this tick
    pub scheduled: bool,
}

pub struct IdleMonitor {
    source: Arc<dyn ActivitySource>,
    interval: Duration,
    controller: Option<LifecycleController>,
}

impl IdleMonitor {
    pub fn new(source: Arc<dyn ActivitySource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            controller: None,
        }
    }

    /// Report no-traffic to `controller`
    pub fn with_controller(mut self, controller: LifecycleController) -> Self {
        self.controller = Some(controller);
        self
    }

    pub async fn tick(&self) -> TickOutcome {
        let generation = self.controller.as_ref().map(|c| c.traffic_generation());
        let pruned = self.source.prune_idle();
        let active = self.source.active_connections();

        if pruned > 0 {
            debug!(pruned, active, "Pruned idle connections");
        }

        let scheduled = match (&self.controller, generation) {
            (Some(controller), Some(generation)) if active == 0 => {
                controller.on_no_traffic_since(generation).await
            }
            _ => false,
        };

        TickOutcome {
            pruned,
            active,
            scheduled,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            lifecycle = self.controller.is_some(),
            "Idle monitor started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.tick().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Idle monitor shutting down");
                        break;
                    }
                }
            }
        }
    }
}
