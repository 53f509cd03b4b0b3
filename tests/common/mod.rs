//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use idlegate::backend::{BackendDriver, BackendGroup, BackendUnit, UnitState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// In-memory driver that records every action it is asked to perform
#[derive(Default)]
pub struct RecordingDriver {
    states: Mutex<HashMap<String, UnitState>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl RecordingDriver {
    pub fn with_units(units: &[(&str, UnitState)]) -> Arc<Self> {
        let driver = RecordingDriver::default();
        for (id, state) in units {
            driver.states.lock().insert(id.to_string(), *state);
        }
        Arc::new(driver)
    }

    pub fn set_state(&self, id: &str, state: UnitState) {
        self.states.lock().insert(id.to_string(), state);
    }

    pub fn state_of(&self, id: &str) -> Option<UnitState> {
        self.states.lock().get(id).copied()
    }

    /// Number of times `action` was requested, across all units
    pub fn count(&self, action: &str) -> usize {
        self.calls.lock().iter().filter(|(a, _)| a == action).count()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    fn act(&self, action: &str, id: &str, state: UnitState) -> anyhow::Result<()> {
        self.calls.lock().push((action.to_string(), id.to_string()));
        match self.states.lock().get_mut(id) {
            Some(s) => {
                *s = state;
                Ok(())
            }
            None => anyhow::bail!("no such container: {}", id),
        }
    }
}

#[async_trait]
impl BackendDriver for RecordingDriver {
    async fn start_unit(&self, id: &str) -> anyhow::Result<()> {
        self.act("start", id, UnitState::Running)
    }

    async fn stop_unit(&self, id: &str) -> anyhow::Result<()> {
        self.act("stop", id, UnitState::Stopped)
    }

    async fn pause_unit(&self, id: &str) -> anyhow::Result<()> {
        self.act("pause", id, UnitState::Paused)
    }

    async fn unpause_unit(&self, id: &str) -> anyhow::Result<()> {
        self.act("unpause", id, UnitState::Running)
    }

    async fn inspect_unit(&self, id: &str) -> anyhow::Result<UnitState> {
        self.state_of(id)
            .ok_or_else(|| anyhow::anyhow!("no such container: {}", id))
    }
}

/// A one-container group named "game" backed by `driver`
pub fn single_group(driver: Arc<RecordingDriver>) -> BackendGroup {
    BackendGroup::new("game", vec![BackendUnit::new("c1", "game")], driver)
}

/// UDP echo server on an ephemeral loopback port
pub async fn spawn_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65_535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, peer)) => {
                    let _ = socket.send_to(&buf[..len], peer).await;
                }
                Err(_) => break,
            }
        }
    });

    addr
}
