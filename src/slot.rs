//! Slot identity, lifecycle states and the views handed out to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use crate::gpu::GpuLoad;

/// Unique identifier of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SlotId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// Worker launch in progress
    Spawning,
    /// Worker running, no viewer yet
    AwaitingInitialUse,
    /// A viewer has connected
    Active,
    /// Shutdown requested, waiting for the process to exit
    Terminating,
    /// Process gone and resources returned
    Reclaimed,
}

impl SlotState {
    /// Whether the slot still accepts heartbeats and viewers
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SlotState::Spawning | SlotState::AwaitingInitialUse | SlotState::Active
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RenderingMode {
    /// Client-side rendering
    #[default]
    #[serde(rename = "csr")]
    Client,
    /// Server-side rendering on a GPU
    #[serde(rename = "ssr")]
    Server,
}

impl RenderingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderingMode::Client => "csr",
            RenderingMode::Server => "ssr",
        }
    }
}

impl FromStr for RenderingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "csr" | "client" => Ok(RenderingMode::Client),
            "ssr" | "server" => Ok(RenderingMode::Server),
            other => Err(format!("unknown rendering mode '{}'", other)),
        }
    }
}

/// What a heartbeat reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactKind {
    /// Periodic proof of life from the worker
    Liveliness,
    /// A viewer has connected to the worker
    ViewerConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Explicit,
    LivelinessTimeout,
    InitialUseTimeout,
    WorkerExited,
    LaunchFailed,
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminationReason::Explicit => "explicit",
            TerminationReason::LivelinessTimeout => "liveliness_timeout",
            TerminationReason::InitialUseTimeout => "initial_use_timeout",
            TerminationReason::WorkerExited => "worker_exited",
            TerminationReason::LaunchFailed => "launch_failed",
            TerminationReason::Shutdown => "shutdown",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnRequest {
    pub rendering: RenderingMode,
    pub model: Option<String>,
}

/// Returned to the caller of a successful spawn
#[derive(Debug, Clone, Serialize)]
pub struct SlotHandle {
    pub slot_id: SlotId,
    pub port: u16,
    pub gpu_index: Option<u32>,
    /// URL the viewer connects to
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAck {
    Ok,
    /// The report was the slot's first viewer contact
    Activated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateAck {
    Signalled,
    AlreadyTerminating,
    Unknown,
}

/// Pool-owned record of one worker
pub(crate) struct Slot {
    pub id: SlotId,
    pub port: u16,
    pub gpu_index: Option<u32>,
    pub rendering: RenderingMode,
    pub model: Option<String>,
    pub pid: Option<u32>,
    pub respawn_link_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub first_connect_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
    /// Wakes the supervisor; taken on first terminate
    pub kill_tx: Option<oneshot::Sender<()>>,
    pub state_tx: watch::Sender<SlotState>,
}

impl Slot {
    pub fn state(&self) -> SlotState {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, state: SlotState) {
        self.state_tx.send_replace(state);
    }

    pub fn view(&self, now: DateTime<Utc>) -> SlotView {
        SlotView {
            id: self.id,
            port: self.port,
            state: self.state(),
            rendering: self.rendering,
            model: self.model.clone(),
            gpu_index: self.gpu_index,
            pid: self.pid,
            respawn_link_id: self.respawn_link_id.clone(),
            created_at: self.created_at,
            age_secs: seconds_between(self.created_at, now),
            secs_since_heartbeat: seconds_between(self.last_heartbeat_at, now),
            first_connect_at: self.first_connect_at,
            termination_reason: self.termination_reason,
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}

/// Read-only view of a slot
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub id: SlotId,
    pub port: u16,
    pub state: SlotState,
    pub rendering: RenderingMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub gpu_index: Option<u32>,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub respawn_link_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub age_secs: f64,
    pub secs_since_heartbeat: f64,
    pub first_connect_at: Option<DateTime<Utc>>,
    pub termination_reason: Option<TerminationReason>,
}

/// One reclaimed slot
#[derive(Debug, Clone, Serialize)]
pub struct TerminationRecord {
    pub slot_id: SlotId,
    pub port: u16,
    pub reason: TerminationReason,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub slots: Vec<SlotView>,
    pub slot_count: usize,
    pub capacity: usize,
    pub free_ports: usize,
    pub gpus: Vec<GpuLoad>,
    pub history: Vec<TerminationRecord>,
}
