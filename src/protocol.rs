//! Wire protocol of the serial FPGA miner.
//!
//! One scan cycle frames a work item into the 52-byte payload the firmware
//! expects, transmits it and polls for a fixed 8-byte response until a
//! deadline computed at cycle start. The response carries the found nonce
//! and, on telemetry-capable firmware, supply/thermal/clock readings.

use crate::device::DeviceRecord;
use crate::error::{self, ErrorKind};
use crate::hal::{
    Algorithm, DeviceChannel, MiningDriver, ScanOutcome, Solution, SolutionSink, Telemetry,
    MIDSTATE_SIZE,
};
use crate::misc::LOGGER;
use crate::work::WorkItem;

use packed_struct::prelude::*;
use packed_struct_codegen::PackedStruct;
use slog::{debug, info};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Size of the work frame consumed by the firmware
pub const WORK_FRAME_SIZE: usize = 52;

/// Every response is exactly this long
pub const RESPONSE_SIZE: usize = 8;

/// Poll deadline of one scan cycle
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Firmware-reported search speed, the basis of the displayed hash rate
const ESTIMATED_HASHES_PER_SEC: f64 = 435_000.0;

/// Temperature decode: sixteenths of a degree offset to -40 C
const TEMP_LSB_C: f32 = 0.0625;
const TEMP_OFFSET_C: f32 = -40.0;
/// All-ones raw reading means the sensor is absent
const TEMP_ABSENT: u16 = 0xffff;

/// Supply decode: 5 mV steps above 0.40 V
const VOLTAGE_BASE_V: f32 = 0.40;
const VOLTAGE_LSB_V: f32 = 0.005;

/// Core clock is a multiple of the 25 MHz reference
const BASE_CLOCK_MHZ: u32 = 25;

/// What the firmware packs behind the nonce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareVariant {
    /// Response carries the nonce only
    Bare,
    /// Response carries nonce plus telemetry
    Telemetry,
}

/// Packed status register in the last response byte
#[derive(PackedStruct, Debug, Clone, Copy)]
#[packed_struct(size_bytes = "1", bit_numbering = "lsb0")]
pub struct CoreStatus {
    #[packed_field(bits = "0:3")]
    pub clock_sel: Integer<u8, packed_bits::Bits4>,
    #[packed_field(bits = "4:7")]
    pub active_cores: Integer<u8, packed_bits::Bits4>,
}

/// Response frame layout; the nonce arrives in reverse byte order, which the
/// most-significant-byte unpacking undoes regardless of host endianness
#[derive(PackedStruct, Debug, Clone, Copy)]
#[packed_struct(endian = "msb", size_bytes = "8")]
pub struct ResponseFrame {
    pub nonce: u32,
    pub voltage: u8,
    pub temp_raw: u16,
    #[packed_field(element_size_bytes = "1")]
    pub status: CoreStatus,
}

impl ResponseFrame {
    pub fn telemetry(&self) -> Telemetry {
        let temperature = if self.temp_raw == TEMP_ABSENT {
            None
        } else {
            Some(f32::from(self.temp_raw) * TEMP_LSB_C + TEMP_OFFSET_C)
        };
        Telemetry {
            supply_voltage: Some(VOLTAGE_BASE_V + f32::from(self.voltage) * VOLTAGE_LSB_V),
            temperature,
            frequency_mhz: Some(BASE_CLOCK_MHZ * (u32::from(*self.status.clock_sel) + 1)),
            active_cores: Some(u32::from(*self.status.active_cores)),
        }
    }
}

/// Swap the byte order inside each 32-bit group
fn swap_words(buf: &mut [u8]) {
    debug_assert!(buf.len() % 4 == 0, "length not a multiple of 4");
    for group in buf.chunks_exact_mut(4) {
        group.reverse();
    }
}

/// Header prepared for the device: byte order swapped within each word
pub fn prepare_header(header: &[u8; 80]) -> [u8; 80] {
    let mut data = *header;
    swap_words(&mut data);
    data
}

/// Assemble the wire frame: midstate, the last 16 prepared-header bytes and
/// the four most-significant target bytes in reverse order, followed by the
/// reversal of the first 44 bytes and a word swap of the first 12. The layout
/// is the firmware's contract; reordering anything here breaks the device.
pub fn build_work_frame(
    midstate: &[u8; MIDSTATE_SIZE],
    prepared_header: &[u8; 80],
    target: &[u8; 32],
) -> [u8; WORK_FRAME_SIZE] {
    let mut frame = [0u8; WORK_FRAME_SIZE];
    frame[..32].copy_from_slice(midstate);
    frame[32..48].copy_from_slice(&prepared_header[64..]);
    frame[48] = target[0x1f];
    frame[49] = target[0x1e];
    frame[50] = target[0x1d];
    frame[51] = target[0x1c];

    frame[..44].reverse();
    swap_words(&mut frame[..12]);
    frame
}

/// Driver for the serial FPGA backend
pub struct FpgaDriver {
    paths: Vec<String>,
    baud: u32,
    timeout_ds: u8,
    scan_timeout: Duration,
    variant: FirmwareVariant,
    algorithm: Algorithm,
}

impl FpgaDriver {
    pub fn new(
        paths: Vec<String>,
        baud: u32,
        timeout_ds: u8,
        variant: FirmwareVariant,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            paths,
            baud,
            timeout_ds,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            variant,
            algorithm,
        }
    }

    pub fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    fn frame_for(&self, work: &WorkItem) -> [u8; WORK_FRAME_SIZE] {
        let prepared = prepare_header(&work.header);
        let midstate = work
            .midstate
            .unwrap_or_else(|| (self.algorithm.midstate)(&prepared[..64]));
        build_work_frame(&midstate, &prepared, &work.target)
    }
}

impl MiningDriver for FpgaDriver {
    fn dname(&self) -> &'static str {
        "fpga"
    }

    fn name(&self) -> &'static str {
        "FPG"
    }

    fn detect(&self) -> usize {
        self.paths
            .iter()
            .filter(|path| std::path::Path::new(path.as_str()).exists())
            .count()
    }

    fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    fn thread_prepare(&self, device: &mut DeviceRecord) -> error::Result<()> {
        if device.name.is_empty() {
            device.name = "FPGA".to_string();
        }
        if device.path.is_empty() {
            let path = self
                .paths
                .get(device.id)
                .ok_or_else(|| ErrorKind::Device(device.id, "no device path".to_string()))?;
            device.path = path.clone();
        }
        debug!(
            LOGGER,
            "Init FPGA thread for device {} ({})", device.id, device.path
        );
        Ok(())
    }

    fn thread_init(
        &self,
        device: &DeviceRecord,
    ) -> error::Result<Box<dyn crate::serial::Transport + Send>> {
        let transport = crate::serial::open(&device.path, self.baud, self.timeout_ds, true)?;
        Ok(Box::new(transport))
    }

    fn prepare_work(&self, work: &mut WorkItem) {
        let prepared = prepare_header(&work.header);
        work.midstate = Some((self.algorithm.midstate)(&prepared[..64]));
    }

    fn scan_work(
        &self,
        channel: &DeviceChannel,
        device_id: usize,
        work: &WorkItem,
        restart: &AtomicBool,
        sink: &dyn SolutionSink,
    ) -> error::Result<ScanOutcome> {
        let frame = self.frame_for(work);

        {
            let mut guard = channel.lock().expect("device channel lock");
            let port = guard
                .as_mut()
                .ok_or_else(|| ErrorKind::Comms("device channel closed".to_string()))?;
            port.write_all(&frame)
                .map_err(|e| ErrorKind::Comms(format!("serial send: {}", e)))?;
        }
        debug!(LOGGER, "FPGA {} sent: {}", device_id, hex::encode(&frame[..]));

        let started = Instant::now();
        let deadline = started + self.scan_timeout;
        let mut response = [0u8; RESPONSE_SIZE];
        let mut filled = 0;

        debug!(LOGGER, "FPGA {}: begin scan for nonces", device_id);
        let complete = loop {
            if restart.load(Ordering::Relaxed) {
                debug!(LOGGER, "FPGA {}: scan aborted for new work", device_id);
                break false;
            }
            if Instant::now() >= deadline {
                debug!(
                    LOGGER,
                    "FPGA {}: end scan for nonces after {:?}",
                    device_id,
                    started.elapsed()
                );
                break false;
            }

            // a short read is not an error, keep polling until the deadline
            let n = {
                let mut guard = channel.lock().expect("device channel lock");
                let port = guard
                    .as_mut()
                    .ok_or_else(|| ErrorKind::Comms("device channel closed".to_string()))?;
                port.recv(&mut response[filled..])
                    .map_err(|e| ErrorKind::Comms(format!("serial read: {}", e)))?
            };
            filled += n;
            if filled == RESPONSE_SIZE {
                break true;
            }
        };

        let elapsed = started.elapsed();
        let hashes = (elapsed.as_secs_f64() * ESTIMATED_HASHES_PER_SEC) as i64;

        if !complete {
            return Ok(ScanOutcome {
                hashes,
                nonce: None,
                telemetry: None,
                elapsed,
            });
        }

        let decoded = ResponseFrame::unpack(&response)
            .map_err(|e| ErrorKind::Comms(format!("malformed response: {:?}", e)))?;
        let nonce = decoded.nonce;
        info!(LOGGER, "FPGA {}: nonce found - {:08X}", device_id, nonce);
        sink.submit(
            work,
            Solution {
                device_id,
                pool_id: work.pool_id,
                nonce,
            },
        );

        let telemetry = match self.variant {
            FirmwareVariant::Bare => None,
            FirmwareVariant::Telemetry => Some(decoded.telemetry()),
        };

        Ok(ScanOutcome {
            hashes,
            nonce: Some(nonce),
            telemetry,
            elapsed,
        })
    }

    fn thread_shutdown(&self, channel: &DeviceChannel) {
        // dropping the boxed port closes the descriptor
        let _ = channel.lock().expect("device channel lock").take();
    }

    fn statline_before(&self, device: &DeviceRecord) -> String {
        let temp = device.telemetry.temperature.unwrap_or(0.0);
        match device.telemetry.supply_voltage {
            Some(volts) => format!("{:5.1}C {:5.2}V | ", temp, volts),
            None => format!("{:5.1}C        | ", temp),
        }
    }

    fn statline(&self, device: &DeviceRecord) -> String {
        if device.is_dynamic() {
            " I: D".to_string()
        } else if device.rawintensity() > 0 {
            format!(" rI:{:3}", device.rawintensity())
        } else if device.xintensity() > 0 {
            format!(" xI:{:3}", device.xintensity())
        } else {
            format!(" I:{:2}", device.intensity())
        }
    }
}
