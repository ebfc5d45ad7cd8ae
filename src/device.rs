//! Fixed-capacity registry of mining device records.
//!
//! Records are allocated once when the registry is built and live for the
//! process lifetime; afterwards only their mutable fields change. The
//! registry is shared fleet-wide behind a single read/write lock which may be
//! held across a bounded loop over all slots but never across device I/O.

use crate::error::{self, ErrorKind};
use crate::hal::Telemetry;
use crate::stats;

use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

/// Maximum number of device slots
pub const MAX_DEVICES: usize = 16;

pub const MIN_INTENSITY: i32 = -10;
pub const MAX_INTENSITY: i32 = 31;
pub const MIN_XINTENSITY: i32 = 1;
pub const MAX_XINTENSITY: i32 = 9999;
pub const MIN_RAWINTENSITY: i32 = 1;
pub const MAX_RAWINTENSITY: i32 = std::i32::MAX;

/// Device life cycle.
///
/// Permitted transitions: `Init -> {Well, NoStart}`, `Well <-> Sick`,
/// `Sick -> Dead` and `{Sick, Dead} -> Init` when the recovery coordinator
/// restarts the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Health {
    Init,
    NoStart,
    Well,
    Sick,
    Dead,
}

impl Health {
    pub fn can_transition(self, to: Health) -> bool {
        match (self, to) {
            (Health::Init, Health::Well) | (Health::Init, Health::NoStart) => true,
            (Health::Well, Health::Sick) | (Health::Sick, Health::Well) => true,
            (Health::Sick, Health::Dead) => true,
            (Health::Sick, Health::Init) | (Health::Dead, Health::Init) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enablement {
    Enabled,
    Disabled,
    Recovering,
}

/// One device slot: identity, tuning, health and accounting state
#[derive(Clone, Debug)]
pub struct DeviceRecord {
    pub id: usize,
    /// Logical unit behind this slot for hardware exposing several
    pub virtual_id: usize,
    pub mapped: bool,
    pub path: String,
    pub name: String,

    // scan-sizing mode; at most one of the three values is nonzero and
    // `dynamic` excludes all of them, enforced by the setters below
    intensity: i32,
    xintensity: i32,
    rawintensity: i32,
    dynamic: bool,

    pub vector_width: u32,
    pub work_size: u32,
    pub shaders: u32,
    pub lookup_gap: u32,
    pub thread_concurrency: u64,
    /// Worker threads bound to this device; thread 0 is the primary
    pub threads: usize,

    pub min_engine: i32,
    pub gpu_engine: i32,
    pub min_fan: i32,
    pub gpu_fan: i32,
    pub memclock: i32,
    pub memdiff: i32,
    pub powertune: i32,
    pub voltage: f32,

    // temperature limits exist twice, for the vendor control path and the
    // fallback sysfs path; the setters keep the pairs in step
    overheat_temp: i32,
    driver_overheat_temp: i32,
    target_temp: i32,
    driver_target_temp: i32,

    pub health: Health,
    pub last_well: SystemTime,
    /// Datestamp of the last (re)initialization, for the status screen
    pub last_init: String,
    pub enablement: Enablement,

    /// Fleet worker-table indices of the threads bound to this device
    pub thread_ids: Vec<usize>,

    pub accepted: u64,
    pub rejected: u64,
    pub hw_errors: u64,
    /// Rolling hash rate in Mh/s
    pub rolling: f64,
    pub total_hashes: u64,
    /// Batch size of the last scan cycle, drives the nonce-range advance
    pub max_hashes: u64,

    pub telemetry: Telemetry,
}

impl DeviceRecord {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            virtual_id: id,
            mapped: false,
            path: String::new(),
            name: String::new(),
            intensity: 0,
            xintensity: 0,
            rawintensity: 0,
            // adaptive sizing until the user pins a mode
            dynamic: true,
            vector_width: 1,
            work_size: 0,
            shaders: 0,
            lookup_gap: 0,
            thread_concurrency: 0,
            threads: 1,
            min_engine: 0,
            gpu_engine: 0,
            min_fan: 0,
            gpu_fan: 0,
            memclock: 0,
            memdiff: 0,
            powertune: 0,
            voltage: 0.0,
            overheat_temp: 85,
            driver_overheat_temp: 85,
            target_temp: 75,
            driver_target_temp: 75,
            health: Health::Init,
            last_well: SystemTime::UNIX_EPOCH,
            last_init: String::new(),
            enablement: Enablement::Enabled,
            thread_ids: Vec::new(),
            accepted: 0,
            rejected: 0,
            hw_errors: 0,
            rolling: 0.0,
            total_hashes: 0,
            max_hashes: 0,
            telemetry: Telemetry::default(),
        }
    }

    pub fn intensity(&self) -> i32 {
        self.intensity
    }

    pub fn xintensity(&self) -> i32 {
        self.xintensity
    }

    pub fn rawintensity(&self) -> i32 {
        self.rawintensity
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Fix the standard intensity, disabling the other sizing modes
    pub fn set_intensity(&mut self, value: i32) {
        self.dynamic = false;
        self.intensity = value;
        self.xintensity = 0;
        self.rawintensity = 0;
    }

    /// Fix the shader-based intensity, disabling the other sizing modes
    pub fn set_xintensity(&mut self, value: i32) {
        self.dynamic = false;
        self.intensity = 0;
        self.rawintensity = 0;
        self.xintensity = value;
    }

    /// Fix the raw thread count, disabling the other sizing modes
    pub fn set_rawintensity(&mut self, value: i32) {
        self.dynamic = false;
        self.intensity = 0;
        self.xintensity = 0;
        self.rawintensity = value;
    }

    /// Switch to runtime-adaptive sizing
    pub fn set_dynamic(&mut self) {
        self.dynamic = true;
    }

    /// Copy the complete sizing mode of another record (broadcast path)
    pub fn copy_intensity_mode(&mut self, from: &DeviceRecord) {
        self.dynamic = from.dynamic;
        self.intensity = from.intensity;
        self.xintensity = from.xintensity;
        self.rawintensity = from.rawintensity;
    }

    /// Used by the tuner when the batch undershoots the hardware minimum
    pub(crate) fn bump_intensity(&mut self) {
        self.intensity += 1;
    }

    /// Update both temperature-limit fields of the overheat pair
    pub fn set_overheat_temp(&mut self, value: i32) {
        self.overheat_temp = value;
        self.driver_overheat_temp = value;
    }

    pub fn overheat_temp(&self) -> i32 {
        self.overheat_temp
    }

    /// Update both temperature-limit fields of the target pair
    pub fn set_target_temp(&mut self, value: i32) {
        self.target_temp = value;
        self.driver_target_temp = value;
    }

    pub fn target_temp(&self) -> i32 {
        self.target_temp
    }

    /// Transition the device health, rejecting edges outside the life cycle
    pub fn set_health(&mut self, to: Health) -> error::Result<()> {
        if self.health == to {
            return Ok(());
        }
        if !self.health.can_transition(to) {
            return Err(ErrorKind::Device(
                self.id,
                format!("illegal health transition {:?} -> {:?}", self.health, to),
            )
            .into());
        }
        self.health = to;
        if to == Health::Well {
            self.last_well = SystemTime::now();
        }
        Ok(())
    }

    /// Fold one finished scan cycle into the accounting counters
    pub fn account_scan(&mut self, hashes: i64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        stats::decay_time(
            &mut self.rolling,
            hashes as f64 / 1e6,
            secs,
            stats::ROLLING_INTERVAL_S,
        );
        if hashes > 0 {
            self.total_hashes += hashes as u64;
        }
    }

    pub fn apply_telemetry(&mut self, telemetry: Telemetry) {
        self.telemetry = telemetry;
    }
}

/// Fixed table of device records plus the detected-device count
pub struct DeviceRegistry {
    devices: Vec<DeviceRecord>,
    detected: usize,
}

pub type SharedRegistry = Arc<RwLock<DeviceRegistry>>;

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: (0..MAX_DEVICES).map(DeviceRecord::new).collect(),
            detected: 0,
        }
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    pub fn detected(&self) -> usize {
        self.detected
    }

    pub fn set_detected(&mut self, count: usize) {
        self.detected = count.min(MAX_DEVICES);
    }

    pub fn device(&self, id: usize) -> &DeviceRecord {
        &self.devices[id]
    }

    pub fn device_mut(&mut self, id: usize) -> &mut DeviceRecord {
        &mut self.devices[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.devices.iter_mut()
    }
}
