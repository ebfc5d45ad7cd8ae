//! Shared test fixtures: a sample block with its precomputed wire bytes, a
//! scripted transport and a recording driver stub.

use crate::device::DeviceRecord;
use crate::error::{self, ErrorKind};
use crate::hal::{
    Algorithm, DeviceChannel, MiningDriver, ScanOutcome, Solution, SolutionSink,
};
use crate::serial::Transport;
use crate::work::WorkItem;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A captured block header with every intermediate of the frame assembly
pub struct SampleBlock {
    pub header: [u8; 80],
    pub target: [u8; 32],
    /// BLAKE-256 state over the first 64 prepared-header bytes
    pub midstate: [u8; 32],
    /// Expected wire frame for `header`/`target`
    pub frame: [u8; 52],
    /// Expected wire frame when the midstate is the 0xa0.. ramp
    pub frame_synthetic: [u8; 52],
}

impl SampleBlock {
    pub fn swapped_header(&self) -> [u8; 80] {
        crate::protocol::prepare_header(&self.header)
    }

    pub fn work(&self) -> WorkItem {
        WorkItem::new(self.header, self.target, 0)
    }
}

pub fn sample_block() -> SampleBlock {
    let header: [u8; 80] = [
        0x00, 0x00, 0x00, 0x20, 0x6e, 0x7e, 0x5f, 0xa2, 0x11, 0x0b, 0xa7, 0x79, 0xed, 0x8d, 0xd3,
        0x4d, 0x1f, 0xf7, 0x33, 0x21, 0x96, 0x79, 0xd3, 0x8e, 0x69, 0x0a, 0x58, 0xe1, 0xde, 0x1d,
        0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xe7, 0x7d, 0x10, 0x0c, 0x31, 0x9d, 0x75, 0x5b, 0xb9,
        0x58, 0x13, 0xd9, 0x79, 0xd7, 0x80, 0xd8, 0xbb, 0xac, 0x20, 0x5a, 0xc7, 0x33, 0x36, 0xfc,
        0xd9, 0x77, 0xea, 0xd2, 0x86, 0x09, 0xf6, 0xf1, 0x27, 0x08, 0x3f, 0x5b, 0x51, 0xc5, 0x19,
        0x1b, 0x00, 0x02, 0xe2, 0xc0,
    ];

    let mut target = [0u8; 32];
    for (i, byte) in target.iter_mut().enumerate() {
        *byte = i as u8;
    }

    let midstate: [u8; 32] = [
        0xe9, 0xee, 0x8a, 0xbf, 0xf3, 0x34, 0xc5, 0xee, 0x1c, 0x15, 0x21, 0xd6, 0x7d, 0x34, 0x05,
        0x7c, 0xc6, 0x16, 0xd2, 0x52, 0x34, 0xfa, 0xc8, 0x25, 0xed, 0xc2, 0x20, 0xe7, 0x2c, 0xef,
        0x56, 0x79,
    ];

    let frame: [u8; 52] = [
        0x1b, 0x19, 0xc5, 0x51, 0x5b, 0x3f, 0x08, 0x27, 0xf1, 0xf6, 0x09, 0x86, 0x79, 0x56, 0xef,
        0x2c, 0xe7, 0x20, 0xc2, 0xed, 0x25, 0xc8, 0xfa, 0x34, 0x52, 0xd2, 0x16, 0xc6, 0x7c, 0x05,
        0x34, 0x7d, 0xd6, 0x21, 0x15, 0x1c, 0xee, 0xc5, 0x34, 0xf3, 0xbf, 0x8a, 0xee, 0xe9, 0xc0,
        0xe2, 0x02, 0x00, 0x1f, 0x1e, 0x1d, 0x1c,
    ];

    let frame_synthetic: [u8; 52] = [
        0x1b, 0x19, 0xc5, 0x51, 0x5b, 0x3f, 0x08, 0x27, 0xf1, 0xf6, 0x09, 0x86, 0xbf, 0xbe, 0xbd,
        0xbc, 0xbb, 0xba, 0xb9, 0xb8, 0xb7, 0xb6, 0xb5, 0xb4, 0xb3, 0xb2, 0xb1, 0xb0, 0xaf, 0xae,
        0xad, 0xac, 0xab, 0xaa, 0xa9, 0xa8, 0xa7, 0xa6, 0xa5, 0xa4, 0xa3, 0xa2, 0xa1, 0xa0, 0xc0,
        0xe2, 0x02, 0x00, 0x1f, 0x1e, 0x1d, 0x1c,
    ];

    SampleBlock {
        header,
        target,
        midstate,
        frame,
        frame_synthetic,
    }
}

/// One scripted transport read
pub enum StubRead {
    Data(Vec<u8>),
    Timeout,
    Error,
}

/// Transport fed from a fixed script; every write is recorded
pub struct StubTransport {
    script: VecDeque<StubRead>,
    endless_partial: bool,
    partial_sent: bool,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl StubTransport {
    pub fn with_script(script: Vec<StubRead>) -> Self {
        Self {
            script: script.into(),
            endless_partial: false,
            partial_sent: false,
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A stuck response: two bytes arrive, then nothing ever again
    pub fn endless_partial() -> Self {
        let mut stub = Self::with_script(Vec::new());
        stub.endless_partial = true;
        stub
    }

    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }

    pub fn into_channel(self) -> DeviceChannel {
        Arc::new(Mutex::new(Some(Box::new(self) as Box<dyn Transport + Send>)))
    }

    fn idle(&self) -> error::Result<usize> {
        // emulate the character timeout of a real port
        thread::sleep(Duration::from_millis(5));
        Ok(0)
    }
}

impl Transport for StubTransport {
    fn recv(&mut self, buf: &mut [u8]) -> error::Result<usize> {
        if self.endless_partial {
            if self.partial_sent {
                return self.idle();
            }
            self.partial_sent = true;
            let n = buf.len().min(2);
            for byte in buf[..n].iter_mut() {
                *byte = 0xab;
            }
            return Ok(n);
        }
        match self.script.pop_front() {
            None | Some(StubRead::Timeout) => self.idle(),
            Some(StubRead::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Some(StubRead::Error) => Err(ErrorKind::Io("stub read failure".to_string()).into()),
        }
    }

    fn recv_until(&mut self, buf: &mut [u8], eol: u8) -> error::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.recv(&mut buf[total..total + 1])?;
            if n == 0 {
                break;
            }
            total += n;
            if buf[total - 1] == eol {
                break;
            }
        }
        Ok(total)
    }

    fn write_all(&mut self, buf: &[u8]) -> error::Result<()> {
        self.writes
            .lock()
            .expect("stub writes lock")
            .push(buf.to_vec());
        Ok(())
    }
}

/// Sink collecting every submitted solution
#[derive(Default)]
pub struct CountingSink {
    solutions: Mutex<Vec<Solution>>,
}

impl CountingSink {
    pub fn solutions(&self) -> Vec<Solution> {
        self.solutions.lock().expect("sink lock").clone()
    }
}

impl SolutionSink for CountingSink {
    fn submit(&self, _work: &WorkItem, solution: Solution) {
        self.solutions.lock().expect("sink lock").push(solution);
    }
}

/// Time span of one recorded transport initialization
#[derive(Clone, Copy, Debug)]
pub struct InitWindow {
    pub device_id: usize,
    pub start: Instant,
    pub end: Instant,
}

/// Driver stub recording detect counts and init windows, for fleet and
/// recovery tests
pub struct RecordingDriver {
    detect: AtomicUsize,
    algorithm: Algorithm,
    init_delay: Mutex<Duration>,
    fail_next_init: AtomicBool,
    windows: Mutex<Vec<InitWindow>>,
    inits: AtomicUsize,
}

impl RecordingDriver {
    pub fn new(devices: usize) -> Self {
        Self {
            detect: AtomicUsize::new(devices),
            algorithm: crate::algorithm::lyra2z(),
            init_delay: Mutex::new(Duration::from_millis(10)),
            fail_next_init: AtomicBool::new(false),
            windows: Mutex::new(Vec::new()),
            inits: AtomicUsize::new(0),
        }
    }

    pub fn set_detect(&self, devices: usize) {
        self.detect.store(devices, Ordering::Relaxed);
    }

    pub fn set_init_delay(&self, delay: Duration) {
        *self.init_delay.lock().expect("init delay lock") = delay;
    }

    pub fn fail_next_init(&self) {
        self.fail_next_init.store(true, Ordering::Relaxed);
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::Relaxed)
    }

    pub fn windows(&self) -> Vec<InitWindow> {
        self.windows.lock().expect("windows lock").clone()
    }

    pub fn clear_windows(&self) {
        self.windows.lock().expect("windows lock").clear();
    }
}

impl MiningDriver for RecordingDriver {
    fn dname(&self) -> &'static str {
        "stub"
    }

    fn name(&self) -> &'static str {
        "STB"
    }

    fn detect(&self) -> usize {
        self.detect.load(Ordering::Relaxed)
    }

    fn algorithm(&self) -> &Algorithm {
        &self.algorithm
    }

    fn thread_prepare(&self, device: &mut DeviceRecord) -> error::Result<()> {
        if device.name.is_empty() {
            device.name = "STUB".to_string();
        }
        Ok(())
    }

    fn thread_init(
        &self,
        device: &DeviceRecord,
    ) -> error::Result<Box<dyn Transport + Send>> {
        if self.fail_next_init.swap(false, Ordering::Relaxed) {
            return Err(
                ErrorKind::Device(device.id, "simulated init failure".to_string()).into(),
            );
        }
        let start = Instant::now();
        thread::sleep(*self.init_delay.lock().expect("init delay lock"));
        self.windows.lock().expect("windows lock").push(InitWindow {
            device_id: device.id,
            start,
            end: Instant::now(),
        });
        self.inits.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StubTransport::with_script(Vec::new())))
    }

    fn prepare_work(&self, _work: &mut WorkItem) {}

    fn scan_work(
        &self,
        _channel: &DeviceChannel,
        _device_id: usize,
        _work: &WorkItem,
        _restart: &std::sync::atomic::AtomicBool,
        _sink: &dyn SolutionSink,
    ) -> error::Result<ScanOutcome> {
        let elapsed = Duration::from_millis(10);
        thread::sleep(elapsed);
        Ok(ScanOutcome {
            hashes: 0,
            nonce: None,
            telemetry: None,
            elapsed,
        })
    }

    fn thread_shutdown(&self, channel: &DeviceChannel) {
        let _ = channel.lock().expect("device channel lock").take();
    }

    fn statline_before(&self, _device: &DeviceRecord) -> String {
        "        | ".to_string()
    }

    fn statline(&self, device: &DeviceRecord) -> String {
        format!(" I:{:2}", device.intensity())
    }
}
