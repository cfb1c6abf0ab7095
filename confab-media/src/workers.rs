//! Media worker pool: spawning, load sampling, and room placement.
//!
//! The pool keeps N worker processes (default one per logical CPU), samples
//! each worker's cumulative CPU time once per second and scores workers as
//! `wCpu·cpu% + wRouters·routers + wTransports·transports`. Rooms stick to a
//! worker by FNV-1a of the room id; overloaded workers fail over to the
//! least-loaded live one.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use confab_core::config::{WorkerDiedPolicy, WorkerPoolConfig};
use confab_core::models::RoomId;
use confab_core::{Error, Result};

use crate::sfu::{SfuBackend, WorkerHandle, WorkerSettings};

const RESPAWN_DELAY: Duration = Duration::from_millis(200);

/// 32-bit FNV-1a; sticky room placement hash.
fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = 0x811c_9dc5_u32;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

struct WorkerRecord {
    handle: Arc<dyn WorkerHandle>,
    pid: u32,
    online: bool,
    routers: u32,
    transports: u32,
    cpu_percent: Option<f64>,
    sample_failed: bool,
    last_cpu: Option<Duration>,
    last_sample: Option<Instant>,
}

impl WorkerRecord {
    fn new(handle: Arc<dyn WorkerHandle>) -> Self {
        let pid = handle.pid();
        Self {
            handle,
            pid,
            online: true,
            routers: 0,
            transports: 0,
            cpu_percent: None,
            sample_failed: false,
            last_cpu: None,
            last_sample: None,
        }
    }

    fn score(&self, config: &WorkerPoolConfig) -> f64 {
        if !self.online || self.sample_failed {
            return f64::INFINITY;
        }
        config.weight_cpu * self.cpu_percent.unwrap_or(0.0)
            + config.weight_routers * f64::from(self.routers)
            + config.weight_transports * f64::from(self.transports)
    }

    fn is_overloaded(&self, config: &WorkerPoolConfig) -> bool {
        !self.online || self.score(config) >= config.overload_threshold
    }
}

/// A worker chosen for a room.
#[derive(Clone)]
pub struct PickedWorker {
    pub pid: u32,
    pub handle: Arc<dyn WorkerHandle>,
}

struct PoolInner {
    backend: Arc<dyn SfuBackend>,
    config: WorkerPoolConfig,
    settings: WorkerSettings,
    slots: Mutex<Vec<WorkerRecord>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Spawn the configured number of workers and start the CPU sampler.
    pub async fn start(
        backend: Arc<dyn SfuBackend>,
        config: WorkerPoolConfig,
    ) -> Result<Self> {
        let count = if config.count == 0 {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            config.count
        };

        let settings = WorkerSettings {
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            log_level: config.log_level.clone(),
        };

        let sample_interval = Duration::from_millis(config.sample_interval_ms);
        let pool = Self {
            inner: Arc::new(PoolInner {
                backend,
                config,
                settings,
                slots: Mutex::new(Vec::with_capacity(count)),
                cancel: CancellationToken::new(),
            }),
        };

        let (death_tx, death_rx) = mpsc::unbounded_channel();

        for slot in 0..count {
            let handle = pool
                .inner
                .backend
                .spawn_worker(&pool.inner.settings)
                .await?;
            pool.install(slot, handle, &death_tx);
        }

        tracing::info!(workers = count, "Media worker pool started");

        pool.spawn_death_task(death_rx, death_tx.clone());
        pool.spawn_sampler(sample_interval);
        pool.sample_now().await;

        Ok(pool)
    }

    fn install(
        &self,
        slot: usize,
        handle: Arc<dyn WorkerHandle>,
        death_tx: &mpsc::UnboundedSender<usize>,
    ) {
        let pid = handle.pid();
        {
            let inner = Arc::downgrade(&self.inner);
            let death_tx = death_tx.clone();
            handle.on_died(Box::new(move || {
                // Take the worker out of rotation immediately; the async
                // death task decides between respawn and process exit.
                if let Some(inner) = inner.upgrade() {
                    if let Some(record) = inner.slots.lock().get_mut(slot) {
                        record.online = false;
                    }
                }
                let _ = death_tx.send(slot);
            }));
        }

        let mut slots = self.inner.slots.lock();
        let record = WorkerRecord::new(handle);
        if slot < slots.len() {
            slots[slot] = record;
        } else {
            slots.push(record);
        }
        tracing::debug!(slot = slot, pid = pid, "Media worker installed");
    }

    fn spawn_death_task(
        &self,
        mut death_rx: mpsc::UnboundedReceiver<usize>,
        death_tx: mpsc::UnboundedSender<usize>,
    ) {
        let pool = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                let slot = tokio::select! {
                    () = cancel.cancelled() => return,
                    slot = death_rx.recv() => match slot {
                        Some(slot) => slot,
                        None => return,
                    },
                };
                pool.handle_worker_death(slot, &death_tx).await;
            }
        });
    }

    async fn handle_worker_death(&self, slot: usize, death_tx: &mpsc::UnboundedSender<usize>) {
        let (pid, policy) = {
            let slots = self.inner.slots.lock();
            let Some(record) = slots.get(slot) else {
                return;
            };
            (record.pid, self.inner.config.died_policy)
        };

        match policy {
            WorkerDiedPolicy::Respawn => {
                tracing::warn!(slot = slot, pid = pid, "Media worker died, respawning");
                tokio::time::sleep(RESPAWN_DELAY).await;
                match self.inner.backend.spawn_worker(&self.inner.settings).await {
                    Ok(handle) => {
                        self.install(slot, handle, death_tx);
                        self.sample_now().await;
                    }
                    Err(e) => {
                        tracing::error!(slot = slot, error = %e, "Failed to respawn media worker");
                    }
                }
            }
            WorkerDiedPolicy::Exit => {
                tracing::error!(slot = slot, pid = pid, "Media worker died, exiting per policy");
                std::process::exit(1);
            }
        }
    }

    fn spawn_sampler(&self, interval: Duration) {
        let pool = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                pool.sample_now().await;
            }
        });
    }

    /// Sample every worker's CPU usage once.
    pub async fn sample_now(&self) {
        let handles: Vec<(usize, Arc<dyn WorkerHandle>)> = {
            let slots = self.inner.slots.lock();
            slots
                .iter()
                .enumerate()
                .filter(|(_, r)| r.online)
                .map(|(i, r)| (i, Arc::clone(&r.handle)))
                .collect()
        };

        for (slot, handle) in handles {
            let outcome = handle.cpu_time().await;
            let now = Instant::now();
            let mut slots = self.inner.slots.lock();
            let Some(record) = slots.get_mut(slot) else {
                continue;
            };
            // The slot may have been respawned while we were sampling.
            if record.pid != handle.pid() {
                continue;
            }
            match outcome {
                Ok(cpu) => {
                    if let (Some(last_cpu), Some(last_sample)) =
                        (record.last_cpu, record.last_sample)
                    {
                        let wall = now.duration_since(last_sample).as_secs_f64();
                        if wall > 0.0 {
                            let delta = cpu.saturating_sub(last_cpu).as_secs_f64();
                            record.cpu_percent = Some(delta / wall);
                        }
                    }
                    record.last_cpu = Some(cpu);
                    record.last_sample = Some(now);
                    record.sample_failed = false;
                }
                Err(e) => {
                    tracing::warn!(pid = record.pid, error = %e, "Worker CPU sample failed");
                    record.sample_failed = true;
                }
            }
        }
    }

    /// Pick the worker for a room: sticky by FNV-1a of the room id over the
    /// live workers, falling back to the least-loaded one when the sticky
    /// choice is overloaded.
    pub fn pick_for_room(&self, room_id: &RoomId) -> Result<PickedWorker> {
        let slots = self.inner.slots.lock();
        let live: Vec<&WorkerRecord> = slots.iter().filter(|r| r.online).collect();
        if live.is_empty() {
            return Err(Error::NoWorkersAvailable);
        }

        let index = (fnv1a_32(room_id.as_str().as_bytes()) as usize) % live.len();
        let sticky = live[index];
        let chosen = if sticky.is_overloaded(&self.inner.config) {
            Self::least_loaded_of(&live, &self.inner.config).unwrap_or(sticky)
        } else {
            sticky
        };

        tracing::debug!(
            room_id = %room_id,
            pid = chosen.pid,
            sticky_pid = sticky.pid,
            "Picked worker for room"
        );
        Ok(PickedWorker {
            pid: chosen.pid,
            handle: Arc::clone(&chosen.handle),
        })
    }

    /// Pick the live worker with the minimum score.
    pub fn pick_least_loaded(&self) -> Result<PickedWorker> {
        let slots = self.inner.slots.lock();
        let live: Vec<&WorkerRecord> = slots.iter().filter(|r| r.online).collect();
        Self::least_loaded_of(&live, &self.inner.config)
            .map(|record| PickedWorker {
                pid: record.pid,
                handle: Arc::clone(&record.handle),
            })
            .ok_or(Error::NoWorkersAvailable)
    }

    fn least_loaded_of<'a>(
        live: &[&'a WorkerRecord],
        config: &WorkerPoolConfig,
    ) -> Option<&'a WorkerRecord> {
        live.iter()
            .copied()
            .min_by(|a, b| {
                a.score(config)
                    .partial_cmp(&b.score(config))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// Adjust a worker's router count (clamped at zero).
    pub fn inc_routers(&self, pid: u32, delta: i32) {
        let mut slots = self.inner.slots.lock();
        if let Some(record) = slots.iter_mut().find(|r| r.pid == pid) {
            record.routers = Self::apply_delta(record.routers, delta);
        }
    }

    /// Adjust a worker's transport count (clamped at zero).
    pub fn inc_transports(&self, pid: u32, delta: i32) {
        let mut slots = self.inner.slots.lock();
        if let Some(record) = slots.iter_mut().find(|r| r.pid == pid) {
            record.transports = Self::apply_delta(record.transports, delta);
        }
    }

    fn apply_delta(value: u32, delta: i32) -> u32 {
        if delta >= 0 {
            value.saturating_add(delta as u32)
        } else {
            value.saturating_sub(delta.unsigned_abs())
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.slots.lock().len()
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.slots.lock().iter().filter(|r| r.online).count()
    }

    /// Stop the sampler and death tasks and close every worker.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<Arc<dyn WorkerHandle>> = {
            let slots = self.inner.slots.lock();
            slots.iter().map(|r| Arc::clone(&r.handle)).collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }

    #[cfg(test)]
    fn force_offline(&self, pid: u32) {
        let mut slots = self.inner.slots.lock();
        if let Some(record) = slots.iter_mut().find(|r| r.pid == pid) {
            record.online = false;
        }
    }
}
