//! The spawn pool: admission control, slot lifecycle and reclamation.
//!
//! # Usage
//!
//! `SpawnPool` is shared behind an `Arc`; [`new`](SpawnPool::new) returns
//! `Arc<Self>` because every launched worker gets a supervisor task holding a
//! reference back to the pool.
//!
//! ```ignore
//! let pool = SpawnPool::new(config, launcher::for_config(&config));
//! let handle = pool.request_spawn(SpawnRequest::default())?;
//! ```
//!
//! # Locking
//!
//! One mutex guards the slots, the port free set, the GPU counters and the
//! termination history. Launching a worker and waiting for it to exit happen
//! outside the lock. A slot that reached `Terminating` never moves back.

use crate::config::Config;
use crate::error::SpawnError;
use crate::gpu::GpuBalancer;
use crate::launcher::{LaunchSpec, WorkerLauncher, WorkerProcess, MAX_STOP_ATTEMPTS};
use crate::ports::PortAllocator;
use crate::slot::{
    ContactKind, HeartbeatAck, PoolSnapshot, RenderingMode, Slot, SlotHandle, SlotId, SlotState,
    SlotView, SpawnRequest, TerminateAck, TerminationReason, TerminationRecord,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Termination records kept for status queries
pub const HISTORY_LEN: usize = 64;

struct PoolInner {
    slots: HashMap<SlotId, Slot>,
    ports: PortAllocator,
    gpus: Option<GpuBalancer>,
    history: VecDeque<TerminationRecord>,
}

impl PoolInner {
    fn mark_terminating(&mut self, id: SlotId, reason: TerminationReason) -> TerminateAck {
        let Some(slot) = self.slots.get_mut(&id) else {
            return TerminateAck::Unknown;
        };
        if !slot.state().is_live() {
            return TerminateAck::AlreadyTerminating;
        }

        slot.termination_reason = Some(reason);
        slot.set_state(SlotState::Terminating);
        if let Some(kill_tx) = slot.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        info!(slot_id = %id, port = slot.port, %reason, "Slot terminating");
        TerminateAck::Signalled
    }
}

pub struct SpawnPool {
    config: Arc<Config>,
    launcher: Arc<dyn WorkerLauncher>,
    inner: Mutex<PoolInner>,
}

impl SpawnPool {
    pub fn new(config: Arc<Config>, launcher: Arc<dyn WorkerLauncher>) -> Arc<Self> {
        let inner = PoolInner {
            slots: HashMap::new(),
            ports: PortAllocator::new(config.spawn.port_range()),
            gpus: config
                .spawn
                .ssr_gpu_count
                .map(|count| GpuBalancer::new(count.get())),
            history: VecDeque::with_capacity(HISTORY_LEN),
        };
        Arc::new(Self {
            config,
            launcher,
            inner: Mutex::new(inner),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.config.spawn.max_spawn_count)
    }

    /// Number of slots, including those still terminating
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admit and launch a new worker
    pub fn request_spawn(self: &Arc<Self>, request: SpawnRequest) -> Result<SlotHandle, SpawnError> {
        let spawn = &self.config.spawn;
        let enabled = match request.rendering {
            RenderingMode::Client => spawn.csr_enabled,
            RenderingMode::Server => spawn.ssr_enabled,
        };
        if !enabled {
            return Err(SpawnError::RenderingModeDisabled(request.rendering.as_str()));
        }

        let id = SlotId::new();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (port, gpu_index) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;

            if inner.slots.len() >= self.capacity() {
                debug!(max = self.capacity(), "Spawn rejected, pool full");
                return Err(SpawnError::PoolExhausted {
                    max: self.capacity(),
                });
            }
            let port = inner
                .ports
                .acquire()
                .map_err(|_| SpawnError::RangeExhausted)?;

            let gpu_index = match (request.rendering, inner.gpus.as_mut()) {
                (RenderingMode::Server, Some(gpus)) => match gpus.assign() {
                    Ok(index) => Some(index),
                    Err(_) => {
                        if let Err(e) = inner.ports.release(port) {
                            error!(port, error = %e, "Port release failed");
                        }
                        return Err(SpawnError::NoGpuAvailable);
                    }
                },
                _ => None,
            };

            let now = Utc::now();
            let (state_tx, _) = watch::channel(SlotState::Spawning);
            inner.slots.insert(
                id,
                Slot {
                    id,
                    port,
                    gpu_index,
                    rendering: request.rendering,
                    model: request.model.clone(),
                    pid: None,
                    respawn_link_id: None,
                    created_at: now,
                    last_heartbeat_at: now,
                    first_connect_at: None,
                    termination_reason: None,
                    kill_tx: Some(kill_tx),
                    state_tx,
                },
            );
            (port, gpu_index)
        };

        let spec = LaunchSpec::for_slot(
            &self.config,
            id,
            port,
            request.rendering,
            gpu_index,
            request.model.as_deref(),
        );

        let worker = match self.launcher.launch(&spec) {
            Ok(worker) => worker,
            Err(e) => {
                error!(slot_id = %id, port, error = %e, "Worker launch failed");
                {
                    let mut inner = self.inner.lock();
                    if let Some(slot) = inner.slots.get_mut(&id) {
                        slot.termination_reason = Some(TerminationReason::LaunchFailed);
                        slot.set_state(SlotState::Terminating);
                    }
                }
                self.reclaim(id);
                return Err(e.into());
            }
        };

        {
            let mut inner = self.inner.lock();
            if let Some(slot) = inner.slots.get_mut(&id) {
                slot.pid = worker.pid();
                slot.respawn_link_id = worker.respawn_link_id().map(str::to_string);
                if slot.state() == SlotState::Spawning {
                    slot.set_state(SlotState::AwaitingInitialUse);
                }
            }
        }

        info!(
            slot_id = %id,
            port,
            gpu_index,
            rendering = request.rendering.as_str(),
            pid = worker.pid().unwrap_or(0),
            "Slot spawned"
        );

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.supervise(id, worker, kill_rx).await;
        });

        Ok(SlotHandle {
            slot_id: id,
            port,
            gpu_index,
            endpoint: self.endpoint(id, port),
        })
    }

    fn endpoint(&self, id: SlotId, port: u16) -> String {
        let server = &self.config.server;
        let tls = &self.config.tls;
        let host = server.public_host();
        if server.proxy_viewer_connections {
            let scheme = if tls.enable_spawn_server { "wss" } else { "ws" };
            format!(
                "{}://{}:{}/proxy/{}",
                scheme, host, server.spawn_server_port, id
            )
        } else {
            let scheme = if tls.enable_sc_server { "wss" } else { "ws" };
            format!("{}://{}:{}", scheme, host, port)
        }
    }

    /// Own the worker until it is gone, then give its resources back
    async fn supervise(
        self: Arc<Self>,
        id: SlotId,
        mut worker: WorkerProcess,
        mut kill_rx: oneshot::Receiver<()>,
    ) {
        let killed = tokio::select! {
            status = worker.wait() => {
                match status {
                    Ok(status) => info!(slot_id = %id, ?status, "Worker exited"),
                    Err(e) => warn!(slot_id = %id, error = %e, "Error waiting for worker"),
                }
                false
            }
            _ = &mut kill_rx => true,
        };

        if killed {
            let grace = self.config.spawn.shutdown_grace_period();
            if !worker.shutdown(id, grace).await {
                error!(
                    slot_id = %id,
                    "Slot stays terminating; capacity is reduced until the worker exits"
                );
                if let Err(e) = worker.wait().await {
                    warn!(slot_id = %id, error = %e, "Error waiting for worker");
                }
            }
        } else {
            self.inner
                .lock()
                .mark_terminating(id, TerminationReason::WorkerExited);
        }

        self.reclaim(id);
    }

    /// Remove a slot whose process is gone and release what it held
    fn reclaim(&self, id: SlotId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(slot) = inner.slots.remove(&id) else {
            return;
        };

        if let Err(e) = inner.ports.release(slot.port) {
            error!(slot_id = %id, port = slot.port, error = %e, "Port release failed");
        }
        if let (Some(index), Some(gpus)) = (slot.gpu_index, inner.gpus.as_mut()) {
            if let Err(e) = gpus.release(index) {
                error!(slot_id = %id, gpu_index = index, error = %e, "GPU release failed");
            }
        }

        let reason = slot
            .termination_reason
            .unwrap_or(TerminationReason::WorkerExited);
        if inner.history.len() == HISTORY_LEN {
            inner.history.pop_front();
        }
        inner.history.push_back(TerminationRecord {
            slot_id: id,
            port: slot.port,
            reason,
            at: Utc::now(),
        });

        slot.set_state(SlotState::Reclaimed);
        info!(
            slot_id = %id,
            port = slot.port,
            %reason,
            slots = inner.slots.len(),
            "Slot reclaimed"
        );
    }

    pub fn report_heartbeat(&self, id: SlotId, kind: ContactKind) -> Result<HeartbeatAck, SpawnError> {
        self.report_heartbeat_at(id, kind, Utc::now())
    }

    /// Record contact from a worker or viewer at `at`
    pub fn report_heartbeat_at(
        &self,
        id: SlotId,
        kind: ContactKind,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatAck, SpawnError> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(&id)
            .ok_or_else(|| SpawnError::UnknownSlot(id.to_string()))?;

        if !slot.state().is_live() {
            return Err(SpawnError::SlotTerminating(id.to_string()));
        }

        if at > slot.last_heartbeat_at {
            slot.last_heartbeat_at = at;
        }

        if kind == ContactKind::ViewerConnected && slot.first_connect_at.is_none() {
            slot.first_connect_at = Some(at);
            slot.set_state(SlotState::Active);
            info!(slot_id = %id, port = slot.port, "Viewer connected, slot active");
            return Ok(HeartbeatAck::Activated);
        }

        Ok(HeartbeatAck::Ok)
    }

    /// Validate a slot for a viewer relay.
    ///
    /// Returns the worker port and a subscription to the slot's lifecycle.
    /// The viewer contact is recorded by the caller once the worker accepts
    /// the connection.
    pub fn open_relay(&self, id: SlotId) -> Result<(u16, watch::Receiver<SlotState>), SpawnError> {
        let inner = self.inner.lock();
        let slot = inner
            .slots
            .get(&id)
            .ok_or_else(|| SpawnError::UnknownSlot(id.to_string()))?;
        if !slot.state().is_live() {
            return Err(SpawnError::SlotTerminating(id.to_string()));
        }
        Ok((slot.port, slot.state_tx.subscribe()))
    }

    /// Begin terminating a slot; does not wait for the process to exit
    pub fn terminate(&self, id: SlotId, reason: TerminationReason) -> TerminateAck {
        self.inner.lock().mark_terminating(id, reason)
    }

    /// Terminate a slot and wait until it is reclaimed
    pub async fn terminate_and_wait(&self, id: SlotId, reason: TerminationReason) -> TerminateAck {
        let Some(mut rx) = self.subscribe(id) else {
            return TerminateAck::Unknown;
        };
        let ack = self.terminate(id, reason);
        // A closed channel means the slot is already gone
        let _ = rx.wait_for(|state| *state == SlotState::Reclaimed).await;
        ack
    }

    /// Lifecycle updates for a slot
    pub fn subscribe(&self, id: SlotId) -> Option<watch::Receiver<SlotState>> {
        self.inner
            .lock()
            .slots
            .get(&id)
            .map(|slot| slot.state_tx.subscribe())
    }

    pub fn slot(&self, id: SlotId) -> Option<SlotView> {
        let now = Utc::now();
        self.inner.lock().slots.get(&id).map(|slot| slot.view(now))
    }

    /// Apply timeout policy at `now`, terminating every slot found overdue
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<(SlotId, TerminationReason)> {
        let spawn = &self.config.spawn;
        let initial_use = chrono::Duration::seconds(spawn.initial_use_duration().as_secs() as i64);
        let liveliness = chrono::Duration::seconds(spawn.liveliness_timeout().as_secs() as i64);

        let mut inner = self.inner.lock();
        let verdicts: Vec<(SlotId, TerminationReason)> = inner
            .slots
            .values()
            .filter_map(|slot| {
                let state = slot.state();
                if state == SlotState::AwaitingInitialUse
                    && slot.first_connect_at.is_none()
                    && now - slot.created_at >= initial_use
                {
                    return Some((slot.id, TerminationReason::InitialUseTimeout));
                }
                if matches!(state, SlotState::Active | SlotState::AwaitingInitialUse)
                    && now - slot.last_heartbeat_at >= liveliness
                {
                    return Some((slot.id, TerminationReason::LivelinessTimeout));
                }
                None
            })
            .collect();

        for (id, reason) in &verdicts {
            warn!(slot_id = %id, %reason, "Slot overdue");
            inner.mark_terminating(*id, *reason);
        }
        verdicts
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let now = Utc::now();
        let inner = self.inner.lock();
        let mut slots: Vec<SlotView> = inner.slots.values().map(|s| s.view(now)).collect();
        slots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.port.cmp(&b.port)));

        PoolSnapshot {
            slot_count: slots.len(),
            slots,
            capacity: self.capacity(),
            free_ports: inner.ports.free_count(),
            gpus: inner.gpus.as_ref().map(|g| g.loads()).unwrap_or_default(),
            history: inner.history.iter().cloned().collect(),
        }
    }

    /// Terminate every slot and wait for the workers to exit
    pub async fn shutdown_all(&self) {
        let receivers: Vec<(SlotId, watch::Receiver<SlotState>)> = {
            let mut inner = self.inner.lock();
            let ids: Vec<SlotId> = inner.slots.keys().copied().collect();
            ids.into_iter()
                .filter_map(|id| {
                    inner.mark_terminating(id, TerminationReason::Shutdown);
                    inner.slots.get(&id).map(|s| (id, s.state_tx.subscribe()))
                })
                .collect()
        };
        if receivers.is_empty() {
            return;
        }

        info!(count = receivers.len(), "Stopping all workers");
        let grace = self.config.spawn.shutdown_grace_period();
        let deadline = grace * (MAX_STOP_ATTEMPTS + 1) + Duration::from_secs(1);
        let wait_all = async {
            for (_, mut rx) in receivers {
                let _ = rx.wait_for(|state| *state == SlotState::Reclaimed).await;
            }
        };
        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            error!(remaining = self.len(), "Workers still running after shutdown");
        } else {
            info!("All workers stopped");
        }
    }
}
