use sfminer::algorithm;
use sfminer::device::DeviceRegistry;
use sfminer::fleet::Fleet;
use sfminer::misc::LOGGER;
use sfminer::hal::Solution;
use sfminer::protocol::{FirmwareVariant, FpgaDriver};
use sfminer::tuning;
use sfminer::work;

use clap::{self, Arg};
use crossbeam_channel::unbounded;
use slog::{error, info};

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Cadence of the built-in benchmark work feed
const WORK_FEED_INTERVAL: Duration = Duration::from_millis(500);

fn tuning_arg<'a>(name: &'a str, help: &'a str) -> Arg<'a, 'a> {
    Arg::with_name(name)
        .long(name)
        .value_name("VALUES")
        .help(help)
        .takes_value(true)
}

fn main() {
    let args = clap::App::new("sfminer")
        .arg(
            Arg::with_name("device")
                .short("S")
                .long("device")
                .value_name("PATH")
                .help("Serial device path of an FPGA board (repeatable)")
                .required(true)
                .multiple(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("baud")
                .long("baud")
                .value_name("RATE")
                .help("Serial baud rate")
                .default_value("115200")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("read-timeout")
                .long("read-timeout")
                .value_name("DECISECONDS")
                .help("Per-read character timeout")
                .default_value("10")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("telemetry")
                .long("telemetry")
                .help("Firmware embeds telemetry in responses"),
        )
        .arg(tuning_arg("intensity", "Scan intensity per device (d or -10..31)"))
        .arg(tuning_arg("xintensity", "Shader-based intensity per device"))
        .arg(tuning_arg("rawintensity", "Raw thread-count intensity per device"))
        .arg(tuning_arg("vector", "Vector width per device (1, 2 or 4)"))
        .arg(tuning_arg("worksize", "Work group size per device"))
        .arg(tuning_arg("shaders", "Shader count per device"))
        .arg(tuning_arg("lookup-gap", "Lookup gap per device"))
        .arg(tuning_arg("thread-concurrency", "Thread concurrency per device"))
        .arg(tuning_arg("device-threads", "Worker threads per device"))
        .arg(tuning_arg("device-map", "Device to logical unit map pairs (a:b)"))
        .arg(tuning_arg("engine-clock", "Engine clock range per device (min-max)"))
        .arg(tuning_arg("fan", "Fan speed range per device (min-max)"))
        .arg(tuning_arg("memclock", "Memory clock per device"))
        .arg(tuning_arg("memdiff", "Memory clock delta per device"))
        .arg(tuning_arg("powertune", "Powertune percentage per device"))
        .arg(tuning_arg("voltage", "Core voltage per device"))
        .arg(tuning_arg("temp-overheat", "Overheat temperature per device"))
        .arg(tuning_arg("temp-target", "Target temperature per device"))
        .get_matches();

    let mut registry = DeviceRegistry::new();

    let setters: &[(&str, fn(&mut DeviceRegistry, &str) -> tuning::SetResult)] = &[
        ("vector", tuning::set_vector_width),
        ("worksize", tuning::set_work_size),
        ("shaders", tuning::set_shaders),
        ("lookup-gap", tuning::set_lookup_gap),
        ("thread-concurrency", tuning::set_thread_concurrency),
        ("device-threads", tuning::set_device_threads),
        ("device-map", tuning::set_device_map),
        ("engine-clock", tuning::set_engine_clock),
        ("fan", tuning::set_fan),
        ("memclock", tuning::set_memclock),
        ("memdiff", tuning::set_memdiff),
        ("powertune", tuning::set_powertune),
        ("voltage", tuning::set_voltage),
        ("temp-overheat", tuning::set_overheat_temp),
        ("temp-target", tuning::set_target_temp),
        ("intensity", tuning::set_intensity),
        ("xintensity", tuning::set_xintensity),
        ("rawintensity", tuning::set_rawintensity),
    ];
    for (name, setter) in setters {
        if let Some(value) = args.value_of(name) {
            if let Err(message) = setter(&mut registry, value) {
                error!(LOGGER, "--{} {}: {}", name, value, message);
                process::exit(1);
            }
        }
    }

    // unwraps are ok as long as the flags are required or defaulted
    let paths: Vec<String> = args
        .values_of("device")
        .unwrap()
        .map(String::from)
        .collect();
    let baud = args
        .value_of("baud")
        .unwrap()
        .parse::<u32>()
        .unwrap_or_else(|_| {
            error!(LOGGER, "invalid baud rate");
            process::exit(1);
        });
    let read_timeout = args
        .value_of("read-timeout")
        .unwrap()
        .parse::<u8>()
        .unwrap_or_else(|_| {
            error!(LOGGER, "invalid read timeout");
            process::exit(1);
        });
    let variant = if args.is_present("telemetry") {
        FirmwareVariant::Telemetry
    } else {
        FirmwareVariant::Bare
    };

    let driver = Arc::new(FpgaDriver::new(
        paths,
        baud,
        read_timeout,
        variant,
        algorithm::lyra2z(),
    ));

    let (solution_tx, solution_rx) = unbounded::<Solution>();
    thread::Builder::new()
        .name("submit".to_string())
        .spawn(move || {
            for solution in solution_rx.iter() {
                info!(
                    LOGGER,
                    "Device {}: submitting nonce {:08x} upstream", solution.device_id, solution.nonce
                );
            }
        })
        .expect("cannot spawn submit thread");

    let fleet = Fleet::new(registry.into_shared(), driver, Arc::new(solution_tx));
    if let Err(e) = Fleet::start(&fleet) {
        error!(LOGGER, "{}", e);
        process::exit(1);
    }

    // feed placeholder work until interrupted; the pool layer replaces this
    let mut sequence = 0u64;
    loop {
        fleet.submit_work(&work::null_work(sequence));
        sequence += 1;
        thread::sleep(WORK_FEED_INTERVAL);
    }
}
