//! Hardware abstraction layer: the driver vtable every mining backend
//! implements, plus the types flowing between workers, drivers and the
//! submission side.

use crate::device::DeviceRecord;
use crate::error;
use crate::serial::Transport;
use crate::work::WorkItem;

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Size of the midstate digest shared between algorithm and wire protocol
pub const MIDSTATE_SIZE: usize = 32;

/// Describes the active hashing algorithm as far as this core needs to know
/// it: intensity scaling constants and the midstate precompute hook. The
/// compression function itself lives with the algorithm implementation.
#[derive(Clone, Copy)]
pub struct Algorithm {
    pub name: &'static str,
    /// Shift applied to the standard intensity exponent
    pub intensity_shift: u32,
    /// Shift applied to shader-based intensity; 0 means the xintensity value
    /// multiplies the shader count directly
    pub xintensity_shift: u32,
    /// Computes the midstate over the first 64 bytes of a prepared header
    pub midstate: fn(&[u8]) -> [u8; MIDSTATE_SIZE],
}

/// Raw solution decoded from the mining hardware
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Solution {
    pub device_id: usize,
    pub pool_id: usize,
    /// actual nonce
    pub nonce: u32,
}

/// Upstream sink for decoded nonces; accept/reject accounting happens on the
/// other side of this trait.
pub trait SolutionSink: Send + Sync {
    fn submit(&self, work: &WorkItem, solution: Solution);
}

impl SolutionSink for crossbeam_channel::Sender<Solution> {
    fn submit(&self, _work: &WorkItem, solution: Solution) {
        // the receiving side going away is a shutdown condition, not an error
        let _ = self.send(solution);
    }
}

/// Device telemetry embedded in responses by some firmware variants
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub supply_voltage: Option<f32>,
    pub temperature: Option<f32>,
    pub frequency_mhz: Option<u32>,
    pub active_cores: Option<u32>,
}

/// Result of one scan cycle
#[derive(Clone, Debug)]
pub struct ScanOutcome {
    /// Approximate number of hashes searched, for rate display
    pub hashes: i64,
    /// Nonce found this cycle, if any
    pub nonce: Option<u32>,
    /// Telemetry decoded from the response, if the firmware provides it
    pub telemetry: Option<Telemetry>,
    /// Wall time the cycle took
    pub elapsed: Duration,
}

/// Shared slot holding a worker thread's transport.
///
/// The slot is shared between the owning worker and the recovery coordinator
/// so that a forced shutdown can release the port out from under a wedged
/// thread; the worker reacquires the lock between bounded reads and treats an
/// emptied slot as a communication failure.
pub type DeviceChannel = Arc<Mutex<Option<Box<dyn Transport + Send>>>>;

pub fn new_device_channel() -> DeviceChannel {
    Arc::new(Mutex::new(None))
}

/// Any mining device backend implements at least these hooks
pub trait MiningDriver: Send + Sync {
    /// Full driver name for logs
    fn dname(&self) -> &'static str;

    /// Short display name used in status lines
    fn name(&self) -> &'static str;

    /// Number of devices currently present
    fn detect(&self) -> usize;

    fn algorithm(&self) -> &Algorithm;

    /// One-time per-thread setup before the transport is opened
    fn thread_prepare(&self, device: &mut DeviceRecord) -> error::Result<()>;

    /// Open the device transport; called from the worker on first start and
    /// from the recovery coordinator on reinit
    fn thread_init(&self, device: &DeviceRecord) -> error::Result<Box<dyn Transport + Send>>;

    /// Cache whatever can be precomputed for the work item (midstate)
    fn prepare_work(&self, work: &mut WorkItem);

    /// Execute one scan cycle; `restart` aborts the poll early.
    /// An `Err` is a communication failure counting one hardware error.
    fn scan_work(
        &self,
        channel: &DeviceChannel,
        device_id: usize,
        work: &WorkItem,
        restart: &AtomicBool,
        sink: &dyn SolutionSink,
    ) -> error::Result<ScanOutcome>;

    /// Force-release the transport of a thread that did not stop in time
    fn thread_shutdown(&self, channel: &DeviceChannel);

    /// Smallest batch the hardware accepts
    fn min_threads(&self, device: &DeviceRecord) -> u64 {
        u64::from(device.work_size.max(1))
    }

    /// Telemetry fragment prepended to the device status line
    fn statline_before(&self, device: &DeviceRecord) -> String;

    /// Tuning fragment appended to the device status line
    fn statline(&self, device: &DeviceRecord) -> String;
}
