//! Fleet of device worker threads and the administrative control surface.
//!
//! One OS thread per device worker; the registry lock is the only lock held
//! across the worker table and it is never held across device I/O. Workers
//! block in exactly two places: inside the deadline-bounded protocol poll and
//! on their pause semaphore while disabled or paused.

use crate::device::{Enablement, Health, SharedRegistry};
use crate::error::{self, ErrorKind};
use crate::hal::{new_device_channel, DeviceChannel, MiningDriver, SolutionSink};
use crate::misc::{self, LOGGER};
use crate::recovery;
use crate::stats::{self, new_thread_stats, SharedThreadStats};
use crate::tuning;
use crate::work::WorkItem;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use slog::{debug, error, info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often a parked worker rechecks its enablement
const PAUSE_RECHECK: Duration = Duration::from_millis(100);

/// How long a worker waits for its first work item per loop turn
const WORK_WAIT: Duration = Duration::from_millis(100);

/// Interval of the fleet hash-rate reporter
const REPORT_INTERVAL: Duration = Duration::from_secs(5);

const REGISTRY_LOCK: &str = "device registry lock";
const THREADS_LOCK: &str = "worker table lock";

/// Bookkeeping for one worker thread
pub(crate) struct WorkerSlot {
    pub device_id: usize,
    pub halt: Arc<AtomicBool>,
    pub restart: Arc<AtomicBool>,
    pub pause: Arc<AtomicBool>,
    pub sem_tx: Sender<()>,
    pub work_tx: Sender<WorkItem>,
    pub channel: DeviceChannel,
    pub stats: SharedThreadStats,
    pub done_rx: Receiver<()>,
    pub join: Option<JoinHandle<()>>,
}

/// Everything a worker thread owns
struct WorkerCtx {
    thread_id: usize,
    device_id: usize,
    registry: SharedRegistry,
    driver: Arc<dyn MiningDriver>,
    sink: Arc<dyn SolutionSink>,
    halt: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    sem_rx: Receiver<()>,
    work_rx: Receiver<WorkItem>,
    channel: DeviceChannel,
    stats: SharedThreadStats,
    done_tx: Sender<()>,
}

pub struct Fleet {
    pub registry: SharedRegistry,
    driver: Arc<dyn MiningDriver>,
    sink: Arc<dyn SolutionSink>,
    threads: RwLock<Vec<WorkerSlot>>,
    recovery_tx: Sender<usize>,
    recovery_rx: Mutex<Option<Receiver<usize>>>,
    started: Instant,
}

impl Fleet {
    pub fn new(
        registry: SharedRegistry,
        driver: Arc<dyn MiningDriver>,
        sink: Arc<dyn SolutionSink>,
    ) -> Arc<Self> {
        let (recovery_tx, recovery_rx) = unbounded();
        Arc::new(Self {
            registry,
            driver,
            sink,
            threads: RwLock::new(Vec::new()),
            recovery_tx,
            recovery_rx: Mutex::new(Some(recovery_rx)),
            started: Instant::now(),
        })
    }

    pub(crate) fn driver(&self) -> &Arc<dyn MiningDriver> {
        &self.driver
    }

    pub(crate) fn threads(&self) -> &RwLock<Vec<WorkerSlot>> {
        &self.threads
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Detect devices and bring up the worker threads, the recovery
    /// coordinator and the hash-rate reporter.
    pub fn start(fleet: &Arc<Fleet>) -> error::Result<()> {
        let detected = fleet.driver.detect();
        if detected == 0 {
            return Err(ErrorKind::General("no devices detected".to_string()).into());
        }
        info!(LOGGER, "{} {} devices detected", detected, fleet.driver.dname());
        fleet
            .registry
            .write()
            .expect(REGISTRY_LOCK)
            .set_detected(detected);

        for device_id in 0..detected {
            let thread_count = fleet
                .registry
                .read()
                .expect(REGISTRY_LOCK)
                .device(device_id)
                .threads;
            for _ in 0..thread_count {
                fleet.spawn_worker_slot(device_id)?;
            }
            fleet.pause_dynamic_threads(device_id);
        }

        let requests = fleet
            .recovery_rx
            .lock()
            .expect("recovery receiver lock")
            .take()
            .ok_or_else(|| ErrorKind::Channel("recovery coordinator already started".to_string()))?;
        recovery::spawn(Arc::clone(fleet), requests);
        stats::spawn_reporter(Arc::clone(&fleet.registry), REPORT_INTERVAL);
        Ok(())
    }

    /// Append a new worker slot for `device_id` and start its thread.
    /// Workers of one device share the transport slot.
    fn spawn_worker_slot(&self, device_id: usize) -> error::Result<usize> {
        let mut threads = self.threads.write().expect(THREADS_LOCK);
        let thread_id = threads.len();

        let channel = threads
            .iter()
            .find(|slot| slot.device_id == device_id)
            .map(|slot| Arc::clone(&slot.channel))
            .unwrap_or_else(new_device_channel);

        let slot = self.build_slot(thread_id, device_id, channel, new_thread_stats())?;
        threads.push(slot);
        drop(threads);

        self.registry
            .write()
            .expect(REGISTRY_LOCK)
            .device_mut(device_id)
            .thread_ids
            .push(thread_id);
        Ok(thread_id)
    }

    /// Replace a quiesced worker's runtime state and start a fresh thread.
    /// The previous work queue is deliberately left with the old thread.
    pub(crate) fn respawn_worker(&self, thread_id: usize) -> error::Result<()> {
        let mut threads = self.threads.write().expect(THREADS_LOCK);
        let (device_id, channel, thread_stats) = {
            let slot = &threads[thread_id];
            (
                slot.device_id,
                Arc::clone(&slot.channel),
                Arc::clone(&slot.stats),
            )
        };
        let slot = self.build_slot(thread_id, device_id, channel, thread_stats)?;
        threads[thread_id] = slot;
        Ok(())
    }

    fn build_slot(
        &self,
        thread_id: usize,
        device_id: usize,
        channel: DeviceChannel,
        thread_stats: SharedThreadStats,
    ) -> error::Result<WorkerSlot> {
        let halt = Arc::new(AtomicBool::new(false));
        let restart = Arc::new(AtomicBool::new(false));
        let pause = Arc::new(AtomicBool::new(false));
        let (sem_tx, sem_rx) = unbounded();
        let (work_tx, work_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);

        let ctx = WorkerCtx {
            thread_id,
            device_id,
            registry: Arc::clone(&self.registry),
            driver: Arc::clone(&self.driver),
            sink: Arc::clone(&self.sink),
            halt: Arc::clone(&halt),
            restart: Arc::clone(&restart),
            pause: Arc::clone(&pause),
            sem_rx,
            work_rx,
            channel: Arc::clone(&channel),
            stats: Arc::clone(&thread_stats),
            done_tx,
        };

        let join = thread::Builder::new()
            .name(format!("miner-{}", thread_id))
            .spawn(move || miner_thread(ctx))
            .map_err(|e| ErrorKind::General(format!("thread {} create failed: {}", thread_id, e)))?;

        Ok(WorkerSlot {
            device_id,
            halt,
            restart,
            pause,
            sem_tx,
            work_tx,
            channel,
            stats: thread_stats,
            done_rx,
            join: Some(join),
        })
    }

    fn check_selection(&self, device_id: usize) -> error::Result<()> {
        let detected = self.registry.read().expect(REGISTRY_LOCK).detected();
        if device_id >= detected {
            return Err(ErrorKind::Device(device_id, "invalid selection".to_string()).into());
        }
        Ok(())
    }

    pub fn enable_device(&self, device_id: usize) -> error::Result<()> {
        self.check_selection(device_id)?;
        let bound = {
            let mut registry = self.registry.write().expect(REGISTRY_LOCK);
            let device = registry.device_mut(device_id);
            if device.enablement == Enablement::Enabled {
                return Err(
                    ErrorKind::Device(device_id, "device already enabled".to_string()).into(),
                );
            }
            if device.health != Health::Well {
                return Err(ErrorKind::Device(
                    device_id,
                    "must restart device before enabling it".to_string(),
                )
                .into());
            }
            device.enablement = Enablement::Enabled;
            device.thread_ids.clone()
        };
        let threads = self.threads.read().expect(THREADS_LOCK);
        for thread_id in bound {
            debug!(LOGGER, "Posting semaphore to thread {}", thread_id);
            let _ = threads[thread_id].sem_tx.send(());
        }
        Ok(())
    }

    pub fn disable_device(&self, device_id: usize) -> error::Result<()> {
        self.check_selection(device_id)?;
        let mut registry = self.registry.write().expect(REGISTRY_LOCK);
        let device = registry.device_mut(device_id);
        if device.enablement == Enablement::Disabled {
            return Err(ErrorKind::Device(device_id, "device already disabled".to_string()).into());
        }
        device.enablement = Enablement::Disabled;
        Ok(())
    }

    /// Hand the device to the recovery coordinator; returns once queued
    pub fn restart_device(&self, device_id: usize) -> error::Result<()> {
        self.check_selection(device_id)?;
        info!(LOGGER, "Attempting to restart threads of device {}", device_id);
        self.recovery_tx
            .send(device_id)
            .map_err(|_| ErrorKind::Channel("recovery queue closed".to_string()).into())
    }

    /// Signal every worker to abandon the current scan for new work
    pub fn restart_work(&self) {
        let threads = self.threads.read().expect(THREADS_LOCK);
        for slot in threads.iter() {
            slot.restart.store(true, Ordering::Relaxed);
        }
    }

    /// Distribute one work item to every worker queue
    pub fn submit_work(&self, work: &WorkItem) {
        let threads = self.threads.read().expect(THREADS_LOCK);
        for slot in threads.iter() {
            let _ = slot.work_tx.send(work.clone());
        }
    }

    /// In dynamic mode only the primary thread of a device keeps scanning;
    /// the extra threads pause until dynamic mode is left again.
    pub fn pause_dynamic_threads(&self, device_id: usize) {
        let (dynamic, disabled, bound) = {
            let registry = self.registry.read().expect(REGISTRY_LOCK);
            let device = registry.device(device_id);
            (
                device.is_dynamic(),
                device.enablement == Enablement::Disabled,
                device.thread_ids.clone(),
            )
        };
        let threads = self.threads.read().expect(THREADS_LOCK);
        for &thread_id in bound.iter().skip(1) {
            let slot = &threads[thread_id];
            if !slot.pause.load(Ordering::Relaxed) && dynamic {
                warn!(LOGGER, "Disabling extra threads due to dynamic mode.");
            }
            slot.pause.store(dynamic, Ordering::Relaxed);
            if !dynamic && !disabled {
                let _ = slot.sem_tx.send(());
            }
        }
    }

    /// Multi-line status summary of one device, for the management surface
    pub fn device_status(&self, device_id: usize) -> error::Result<String> {
        self.check_selection(device_id)?;
        let (device, uptime) = {
            let registry = self.registry.read().expect(REGISTRY_LOCK);
            (registry.device(device_id).clone(), self.uptime())
        };

        let mut displayed_rolling = device.rolling;
        let mut displayed_total =
            device.total_hashes as f64 / 1e6 / uptime.as_secs_f64().max(1.0);
        let mhash_base = displayed_rolling >= 1.0;
        if !mhash_base {
            displayed_rolling *= 1000.0;
            displayed_total *= 1000.0;
        }

        let mut out = format!(
            "{} {}: {:.1} / {:.1} {}h/s | A:{} R:{} HW:{} U:{:.2}/m I:{} xI:{} rI:{}\n",
            self.driver.name(),
            device_id,
            displayed_rolling,
            displayed_total,
            if mhash_base { "M" } else { "K" },
            device.accepted,
            device.rejected,
            device.hw_errors,
            stats::utility(device.accepted, uptime),
            device.intensity(),
            device.xintensity(),
            device.rawintensity(),
        );
        out.push_str(&self.driver.statline_before(&device));
        out.push_str(&self.driver.statline(&device));
        out.push('\n');
        out.push_str(&format!("Last initialised: {}\n", device.last_init));

        let threads = self.threads.read().expect(THREADS_LOCK);
        for &thread_id in &device.thread_ids {
            let slot = &threads[thread_id];
            let mut rolling = slot.stats.lock().expect("thread stats lock").rolling;
            if !mhash_base {
                rolling *= 1000.0;
            }
            let health = match device.health {
                Health::Well => "ALIVE".to_string(),
                Health::Sick => "SICK".to_string(),
                Health::Dead => "DEAD".to_string(),
                Health::Init | Health::NoStart => "Never started".to_string(),
            };
            out.push_str(&format!(
                "Thread {}: {:.1} {}h/s {} {}{}\n",
                thread_id,
                rolling,
                if mhash_base { "M" } else { "K" },
                if device.enablement != Enablement::Disabled {
                    "Enabled"
                } else {
                    "Disabled"
                },
                health,
                if slot.pause.load(Ordering::Relaxed) {
                    " paused"
                } else {
                    ""
                },
            ));
        }
        Ok(out)
    }

    /// Stop every worker and wait for them to confirm
    pub fn shutdown(&self) {
        let mut threads = self.threads.write().expect(THREADS_LOCK);
        for slot in threads.iter() {
            slot.halt.store(true, Ordering::Relaxed);
            let _ = slot.sem_tx.send(());
        }
        for slot in threads.iter_mut() {
            if let Some(join) = slot.join.take() {
                let _ = join.join();
            }
        }
    }
}

/// Main loop of one device worker
fn miner_thread(ctx: WorkerCtx) {
    if !worker_startup(&ctx) {
        return;
    }

    let mut current: Option<WorkItem> = None;
    loop {
        if ctx.halt.load(Ordering::Relaxed) {
            break;
        }

        let active = {
            let registry = ctx.registry.read().expect(REGISTRY_LOCK);
            registry.device(ctx.device_id).enablement == Enablement::Enabled
        };
        if !active || ctx.pause.load(Ordering::Relaxed) {
            match ctx.sem_rx.recv_timeout(PAUSE_RECHECK) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if !fetch_work(&ctx, &mut current) {
            break;
        }
        let work = match current.as_mut() {
            Some(work) => work,
            None => continue,
        };

        let max_hashes = {
            let mut registry = ctx.registry.write().expect(REGISTRY_LOCK);
            let device = registry.device_mut(ctx.device_id);
            let min_threads = ctx.driver.min_threads(device);
            let algorithm = *ctx.driver.algorithm();
            let (_threads, hashes) = tuning::tune_threads_hashes(device, min_threads, &algorithm);
            device.max_hashes = hashes;
            hashes
        };

        ctx.restart.store(false, Ordering::Relaxed);
        match ctx
            .driver
            .scan_work(&ctx.channel, ctx.device_id, work, &ctx.restart, &*ctx.sink)
        {
            Ok(outcome) => {
                {
                    let mut registry = ctx.registry.write().expect(REGISTRY_LOCK);
                    let device = registry.device_mut(ctx.device_id);
                    device.account_scan(outcome.hashes, outcome.elapsed);
                    if let Some(telemetry) = outcome.telemetry {
                        device.apply_telemetry(telemetry);
                    }
                }
                let mut thread_stats = ctx.stats.lock().expect("thread stats lock");
                stats::decay_time(
                    &mut thread_stats.rolling,
                    outcome.hashes as f64 / 1e6,
                    outcome.elapsed.as_secs_f64(),
                    stats::ROLLING_INTERVAL_S,
                );
                drop(thread_stats);
                work.advance_nonce(max_hashes);
            }
            Err(e) => {
                // one hardware-error event; the worker carries on and the
                // health monitor decides whether the device needs recovery
                warn!(LOGGER, "Device {}: {}", ctx.device_id, e);
                let mut registry = ctx.registry.write().expect(REGISTRY_LOCK);
                registry.device_mut(ctx.device_id).hw_errors += 1;
            }
        }
    }

    debug!(LOGGER, "Miner thread {} shut down", ctx.thread_id);
    let _ = ctx.done_tx.send(());
}

/// Prepare the device and make sure the transport is open; returns false
/// when the worker cannot start.
fn worker_startup(ctx: &WorkerCtx) -> bool {
    {
        let mut registry = ctx.registry.write().expect(REGISTRY_LOCK);
        let device = registry.device_mut(ctx.device_id);
        if let Err(e) = ctx.driver.thread_prepare(device) {
            error!(LOGGER, "Device {}: thread prepare failed: {}", ctx.device_id, e);
            let _ = device.set_health(Health::NoStart);
            return false;
        }
    }

    // the channel lock is held across the open so that sibling threads of
    // the same device cannot race a second open
    {
        let mut channel = ctx.channel.lock().expect("device channel lock");
        if channel.is_none() {
            let opened = {
                let registry = ctx.registry.read().expect(REGISTRY_LOCK);
                ctx.driver.thread_init(registry.device(ctx.device_id))
            };
            match opened {
                Ok(port) => *channel = Some(port),
                Err(e) => {
                    drop(channel);
                    error!(
                        LOGGER,
                        "Device {}: transport init failed: {}", ctx.device_id, e
                    );
                    let mut registry = ctx.registry.write().expect(REGISTRY_LOCK);
                    let _ = registry
                        .device_mut(ctx.device_id)
                        .set_health(Health::NoStart);
                    return false;
                }
            }
        }
    }

    let mut registry = ctx.registry.write().expect(REGISTRY_LOCK);
    let device = registry.device_mut(ctx.device_id);
    if let Err(e) = device.set_health(Health::Well) {
        debug!(LOGGER, "{}", e);
    }
    if device.last_init.is_empty() {
        device.last_init = misc::datestamp();
    }
    info!(
        LOGGER,
        "Thread {} started on device {}", ctx.thread_id, ctx.device_id
    );
    true
}

/// Pull the freshest queued work; keeps the previous item when the queue is
/// empty. Returns false when the queue is gone and the worker should exit.
fn fetch_work(ctx: &WorkerCtx, current: &mut Option<WorkItem>) -> bool {
    let mut newest = None;
    loop {
        match ctx.work_rx.try_recv() {
            Ok(work) => newest = Some(work),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => return false,
        }
    }

    if newest.is_none() && current.is_none() {
        match ctx.work_rx.recv_timeout(WORK_WAIT) {
            Ok(work) => newest = Some(work),
            Err(RecvTimeoutError::Timeout) => return true,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }

    if let Some(mut work) = newest {
        ctx.driver.prepare_work(&mut work);
        *current = Some(work);
    }
    true
}
