//! Single-flight device recovery.
//!
//! Only one thread ever reinitializes devices: if a device is so wedged that
//! a reinit never returns, the coordinator is stuck on it but cannot harm any
//! other device, and a second sick device simply waits in the queue. The
//! queue carries device indices, never references into the worker table.

use crate::device::{Enablement, Health};
use crate::fleet::Fleet;
use crate::misc::{self, LOGGER};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use slog::{debug, error, info, warn};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

/// How long a quiesced worker gets to confirm its exit before the transport
/// is pulled out from under it
pub const QUIESCE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn spawn(fleet: Arc<Fleet>, requests: Receiver<usize>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("recovery".to_string())
        .spawn(move || {
            // one request at a time is the back-pressure point
            for device_id in requests.iter() {
                restart_device(&fleet, device_id);
            }
        })
        .expect("cannot spawn recovery coordinator")
}

fn restart_device(fleet: &Arc<Fleet>, device_id: usize) {
    let lock_msg = "device registry lock";
    let detected = fleet.registry.read().expect(lock_msg).detected();
    if fleet.driver().detect() != detected {
        warn!(
            LOGGER,
            "Hardware not reporting same number of active devices, \
             will not attempt to restart device {}",
            device_id
        );
        return;
    }

    let (bound, previous_enablement) = {
        let mut registry = fleet.registry.write().expect(lock_msg);
        let device = registry.device_mut(device_id);
        let previous = device.enablement;
        device.enablement = Enablement::Recovering;
        device.rolling = 0.0;
        (device.thread_ids.clone(), previous)
    };

    quiesce_workers(fleet, &bound);

    // The coordinator opens the transport itself so that a wedged open cannot
    // take a fresh worker down with it; the worker finds the slot filled.
    let reinit = {
        let registry = fleet.registry.read().expect(lock_msg);
        fleet.driver().thread_init(registry.device(device_id))
    };
    let port = match reinit {
        Ok(port) => port,
        Err(e) => {
            error!(LOGGER, "Failed to reinit device {}: {}", device_id, e);
            let mut registry = fleet.registry.write().expect(lock_msg);
            let device = registry.device_mut(device_id);
            if let Err(e) = device.set_health(Health::Dead) {
                debug!(LOGGER, "{}", e);
            }
            device.enablement = previous_enablement;
            return;
        }
    };

    {
        let mut registry = fleet.registry.write().expect(lock_msg);
        let device = registry.device_mut(device_id);
        if let Err(e) = device.set_health(Health::Init) {
            debug!(LOGGER, "{}", e);
        }
        device.last_init = misc::datestamp();
    }

    if let Some(&first) = bound.first() {
        let threads = fleet.threads().read().expect("worker table lock");
        *threads[first].channel.lock().expect("device channel lock") = Some(port);
    }

    for &thread_id in &bound {
        debug!(LOGGER, "Reinit worker thread {}", thread_id);
        if let Err(e) = fleet.respawn_worker(thread_id) {
            error!(LOGGER, "{}", e);
            return;
        }
        info!(LOGGER, "Thread {} restarted", thread_id);
    }

    {
        let mut registry = fleet.registry.write().expect(lock_msg);
        registry.device_mut(device_id).enablement = previous_enablement;
    }
    // non-blocking post so the fresh workers begin scanning
    let threads = fleet.threads().read().expect("worker table lock");
    for &thread_id in &bound {
        let _ = threads[thread_id].sem_tx.send(());
    }
}

/// Stop every worker bound to the device, forcing the transport away from
/// any that fail to confirm within the timeout
fn quiesce_workers(fleet: &Arc<Fleet>, bound: &[usize]) {
    for &thread_id in bound {
        let (halt, sem_tx, done_rx, channel, thread_stats) = {
            let threads = fleet.threads().read().expect("worker table lock");
            let slot = &threads[thread_id];
            (
                Arc::clone(&slot.halt),
                slot.sem_tx.clone(),
                slot.done_rx.clone(),
                Arc::clone(&slot.channel),
                Arc::clone(&slot.stats),
            )
        };

        {
            let mut thread_stats = thread_stats.lock().expect("thread stats lock");
            thread_stats.rolling = 0.0;
            // reports the last time we tried to revive a sick device
            thread_stats.last_sick = Some(SystemTime::now());
        }

        halt.store(true, Ordering::Relaxed);
        let _ = sem_tx.send(());

        match done_rx.recv_timeout(QUIESCE_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!(LOGGER, "Thread {} no longer running", thread_id);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(LOGGER, "Thread {} still exists, killing it off", thread_id);
                fleet.driver().thread_shutdown(&channel);
            }
        }
    }
}
