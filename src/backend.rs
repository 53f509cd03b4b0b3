//! Backend driver abstraction and the managed group of units
//!
//! The lifecycle controller never caches backend state: the units may be
//! started, paused or stopped by someone else at any time, so every decision
//! re-queries the driver through [`BackendGroup`].

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Observed state of a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Running,
    Paused,
    Stopped,
}

/// Aggregate state of a group, as reported to the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    Running,
    Paused,
    Stopped,
}

/// Imperative operations and state queries for managed process units
#[async_trait]
pub trait BackendDriver: Send + Sync {
    async fn start_unit(&self, id: &str) -> anyhow::Result<()>;

    async fn stop_unit(&self, id: &str) -> anyhow::Result<()>;

    async fn pause_unit(&self, id: &str) -> anyhow::Result<()>;

    async fn unpause_unit(&self, id: &str) -> anyhow::Result<()>;

    async fn inspect_unit(&self, id: &str) -> anyhow::Result<UnitState>;

    /// Running and not paused. Inspection errors are logged and read as `false`.
    async fn is_running(&self, id: &str) -> bool {
        match self.inspect_unit(id).await {
            Ok(state) => state == UnitState::Running,
            Err(e) => {
                warn!(unit = id, error = %e, "Failed to inspect unit");
                false
            }
        }
    }

    /// Inspection errors are logged and read as `false`.
    async fn is_paused(&self, id: &str) -> bool {
        match self.inspect_unit(id).await {
            Ok(state) => state == UnitState::Paused,
            Err(e) => {
                warn!(unit = id, error = %e, "Failed to inspect unit");
                false
            }
        }
    }
}

/// Shared driver reference
pub type SharedDriver = Arc<dyn BackendDriver>;

/// One managed unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendUnit {
    pub id: String,
    pub name: String,
}

impl BackendUnit {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Operation applied to one or every unit of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitAction {
    Start,
    Stop,
    Pause,
    Unpause,
}

impl UnitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Pause => "pause",
            UnitAction::Unpause => "unpause",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(UnitAction::Start),
            "stop" => Some(UnitAction::Stop),
            "pause" => Some(UnitAction::Pause),
            "unpause" => Some(UnitAction::Unpause),
            _ => None,
        }
    }
}

/// Error for unit operations addressed by id
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("unit '{0}' is not part of group")]
    UnknownUnit(String),
    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

/// The set of units addressed uniformly by lifecycle operations
#[derive(Clone)]
pub struct BackendGroup {
    name: String,
    units: Vec<BackendUnit>,
    driver: SharedDriver,
}

impl std::fmt::Debug for BackendGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendGroup")
            .field("name", &self.name)
            .field("units", &self.units)
            .finish_non_exhaustive()
    }
}

impl BackendGroup {
    pub fn new(name: impl Into<String>, units: Vec<BackendUnit>, driver: SharedDriver) -> Self {
        Self {
            name: name.into(),
            units,
            driver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &[BackendUnit] {
        &self.units
    }

    pub fn driver(&self) -> &SharedDriver {
        &self.driver
    }

    pub fn contains(&self, id: &str) -> bool {
        self.units.iter().any(|u| u.id == id)
    }

    pub fn unit(&self, id: &str) -> Option<&BackendUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    async fn apply_unit(&self, id: &str, action: UnitAction) -> anyhow::Result<()> {
        match action {
            UnitAction::Start => self.driver.start_unit(id).await,
            UnitAction::Stop => self.driver.stop_unit(id).await,
            UnitAction::Pause => self.driver.pause_unit(id).await,
            UnitAction::Unpause => self.driver.unpause_unit(id).await,
        }
    }

    /// Apply `action` to every unit, best-effort.
    ///
    /// Failures are logged and do not stop the remaining units. Returns the
    /// number of units that failed.
    pub async fn apply(&self, action: UnitAction) -> usize {
        let mut failures = 0;
        for unit in &self.units {
            if let Err(e) = self.apply_unit(&unit.id, action).await {
                warn!(
                    group = %self.name,
                    unit = %unit.name,
                    action = action.as_str(),
                    error = %e,
                    "Backend action failed"
                );
                failures += 1;
            }
        }
        info!(
            group = %self.name,
            action = action.as_str(),
            units = self.units.len(),
            failures,
            "Applied backend action to group"
        );
        failures
    }

    pub async fn start(&self) -> usize {
        self.apply(UnitAction::Start).await
    }

    pub async fn stop(&self) -> usize {
        self.apply(UnitAction::Stop).await
    }

    pub async fn pause(&self) -> usize {
        self.apply(UnitAction::Pause).await
    }

    pub async fn unpause(&self) -> usize {
        self.apply(UnitAction::Unpause).await
    }

    /// Apply `action` to a single unit of this group
    pub async fn apply_to(&self, id: &str, action: UnitAction) -> Result<(), UnitError> {
        if !self.contains(id) {
            return Err(UnitError::UnknownUnit(id.to_string()));
        }
        self.apply_unit(id, action).await?;
        info!(group = %self.name, unit = id, action = action.as_str(), "Applied backend action");
        Ok(())
    }

    /// State of one unit; inspection errors are logged and read as stopped
    pub async fn unit_state(&self, id: &str) -> Result<UnitState, UnitError> {
        if !self.contains(id) {
            return Err(UnitError::UnknownUnit(id.to_string()));
        }
        Ok(self.inspect_or_stopped(id).await)
    }

    async fn inspect_or_stopped(&self, id: &str) -> UnitState {
        match self.driver.inspect_unit(id).await {
            Ok(state) => state,
            Err(e) => {
                warn!(group = %self.name, unit = id, error = %e, "Failed to inspect unit");
                UnitState::Stopped
            }
        }
    }

    /// Fresh state of every unit, in group order
    pub async fn unit_states(&self) -> Vec<(BackendUnit, UnitState)> {
        let states = join_all(self.units.iter().map(|u| self.inspect_or_stopped(&u.id))).await;
        self.units.iter().cloned().zip(states).collect()
    }

    pub async fn any_paused(&self) -> bool {
        self.unit_states()
            .await
            .iter()
            .any(|(_, s)| *s == UnitState::Paused)
    }

    /// At least one unit is running and not paused
    pub async fn any_running(&self) -> bool {
        self.unit_states()
            .await
            .iter()
            .any(|(_, s)| *s == UnitState::Running)
    }

    /// At least one unit is paused or stopped
    pub async fn any_not_running(&self) -> bool {
        self.unit_states()
            .await
            .iter()
            .any(|(_, s)| *s != UnitState::Running)
    }

    pub async fn all_stopped(&self) -> bool {
        self.unit_states()
            .await
            .iter()
            .all(|(_, s)| *s == UnitState::Stopped)
    }

    /// Aggregate state: running if any unit runs, stopped if all are stopped,
    /// otherwise paused
    pub async fn state(&self) -> GroupState {
        let states = self.unit_states().await;
        if states.iter().any(|(_, s)| *s == UnitState::Running) {
            GroupState::Running
        } else if states.iter().all(|(_, s)| *s == UnitState::Stopped) {
            GroupState::Stopped
        } else {
            GroupState::Paused
        }
    }
}
