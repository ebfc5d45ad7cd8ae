//! Per-device tuning setters and the scan-batch sizing computation.
//!
//! Every setter takes a comma-separated value list assigning sequential
//! device slots and returns `Ok(())` or a human-readable message, which makes
//! them directly usable from the command line and the config file loader.
//! A single value broadcasts to the remaining slots; the broadcast range is
//! setter-specific (most cover the full table, work size and thread
//! concurrency only the detected devices) and deliberately kept that way to
//! match the behavior existing configurations rely on. A bad token fails the
//! whole call but leaves the slots assigned before it in place.

use crate::device::{
    DeviceRecord, DeviceRegistry, MAX_DEVICES, MAX_INTENSITY, MAX_RAWINTENSITY, MAX_XINTENSITY,
    MIN_INTENSITY, MIN_RAWINTENSITY, MIN_XINTENSITY,
};
use crate::hal::Algorithm;
use crate::misc::LOGGER;

use slog::debug;

pub type SetResult = Result<(), String>;

/// How far a single supplied value spreads
#[derive(Clone, Copy)]
enum Broadcast {
    /// All device slots up to the table capacity
    Capacity,
    /// Only slots detected at startup
    Detected,
}

fn tokens(arg: &str) -> impl Iterator<Item = &str> {
    arg.split(',').filter(|t| !t.is_empty())
}

fn apply_tokens<T, P, A>(
    registry: &mut DeviceRegistry,
    arg: &str,
    no_params: &str,
    broadcast: Broadcast,
    parse: P,
    mut apply: A,
) -> SetResult
where
    T: Clone,
    P: Fn(&str) -> Result<T, String>,
    A: FnMut(&mut DeviceRecord, T),
{
    let mut device = 0;
    let mut first: Option<T> = None;

    for token in tokens(arg) {
        if device == MAX_DEVICES {
            break;
        }
        let value = parse(token)?;
        if device == 0 {
            first = Some(value.clone());
        }
        apply(registry.device_mut(device), value);
        device += 1;
    }

    if device == 0 {
        return Err(no_params.to_string());
    }
    if device == 1 {
        let value = first.expect("first parsed token");
        let limit = match broadcast {
            Broadcast::Capacity => MAX_DEVICES,
            Broadcast::Detected => registry.detected(),
        };
        for id in 1..limit {
            apply(registry.device_mut(id), value.clone());
        }
    }
    Ok(())
}

fn parse_int(token: &str, invalid: &str) -> Result<i32, String> {
    token
        .trim()
        .parse::<i32>()
        .map_err(|_| invalid.to_string())
}

fn parse_int_in(token: &str, min: i32, max: i32, invalid: &str) -> Result<i32, String> {
    let value = parse_int(token, invalid)?;
    if value < min || value > max {
        return Err(invalid.to_string());
    }
    Ok(value)
}

/// Parse a `min-max` range; a bare value stands for both ends
fn parse_intrange(token: &str, min: i32, max: i32, invalid: &str) -> Result<(i32, i32), String> {
    let (lo, hi) = match token.find('-') {
        // a leading '-' belongs to a negative number, not a range
        Some(pos) if pos > 0 => {
            let lo = parse_int(&token[..pos], invalid)?;
            let hi = parse_int(&token[pos + 1..], invalid)?;
            (lo, hi)
        }
        _ => {
            let value = parse_int(token, invalid)?;
            (value, value)
        }
    };
    if lo < min || lo > max || hi < min || hi > max {
        return Err(invalid.to_string());
    }
    Ok((lo, hi))
}

pub fn set_vector_width(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set vector width";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set vector width",
        Broadcast::Capacity,
        |t| {
            let value = parse_int(t, INVALID)?;
            if value != 1 && value != 2 && value != 4 {
                return Err(INVALID.to_string());
            }
            Ok(value as u32)
        },
        |device, value| device.vector_width = value,
    )
}

pub fn set_work_size(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set work size";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set work size",
        Broadcast::Detected,
        |t| parse_int_in(t, 1, 9999, INVALID).map(|v| v as u32),
        |device, value| {
            debug!(LOGGER, "Device {} work size set to {}", device.id, value);
            device.work_size = value;
        },
    )
}

pub fn set_shaders(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set shaders",
        Broadcast::Capacity,
        |t| {
            t.trim()
                .parse::<u32>()
                .map_err(|_| "Invalid value passed to set shaders".to_string())
        },
        |device, value| device.shaders = value,
    )
}

pub fn set_lookup_gap(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set lookup gap",
        Broadcast::Capacity,
        |t| {
            t.trim()
                .parse::<u32>()
                .map_err(|_| "Invalid value passed to set lookup gap".to_string())
        },
        |device, value| device.lookup_gap = value,
    )
}

pub fn set_thread_concurrency(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    // empty value selects autodetection on every detected device
    if arg.is_empty() {
        let detected = registry.detected();
        debug!(LOGGER, "Device 0 thread concurrency set to 0");
        registry.device_mut(0).thread_concurrency = 0;
        for id in 1..detected {
            registry.device_mut(id).thread_concurrency = 0;
        }
        return Ok(());
    }
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set thread concurrency",
        Broadcast::Detected,
        |t| {
            t.trim()
                .parse::<u64>()
                .map_err(|_| "Invalid value passed to set thread concurrency".to_string())
        },
        |device, value| {
            debug!(
                LOGGER,
                "Device {} thread concurrency set to {}", device.id, value
            );
            device.thread_concurrency = value;
        },
    )
}

pub fn set_device_threads(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set device threads";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set device threads",
        Broadcast::Capacity,
        |t| parse_int_in(t, 1, 20, INVALID).map(|v| v as usize),
        |device, value| device.threads = value,
    )
}

/// Map a compute device index to the logical unit the vendor control path
/// sees, for when simple enumeration fails to match them
pub fn set_device_map(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    let mut seen = false;
    for token in tokens(arg) {
        let mut pair = token.splitn(2, ':');
        let device = pair
            .next()
            .and_then(|p| p.trim().parse::<usize>().ok())
            .ok_or_else(|| "Invalid description for map pair".to_string())?;
        let virtual_id = pair
            .next()
            .and_then(|p| p.trim().parse::<usize>().ok())
            .ok_or_else(|| "Invalid description for map pair".to_string())?;
        if device >= MAX_DEVICES || virtual_id >= MAX_DEVICES {
            return Err("Invalid value passed to set device map".to_string());
        }
        let record = registry.device_mut(device);
        record.virtual_id = virtual_id;
        record.mapped = true;
        seen = true;
    }
    if !seen {
        return Err("Invalid parameters for set device map".to_string());
    }
    Ok(())
}

pub fn set_engine_clock(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set engine clock";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set engine clock",
        Broadcast::Capacity,
        |t| parse_intrange(t, 0, 9999, INVALID),
        |device, (min, max)| {
            device.min_engine = min;
            device.gpu_engine = max;
        },
    )
}

pub fn set_fan(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set fan";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set fan",
        Broadcast::Capacity,
        |t| parse_intrange(t, 0, 100, INVALID),
        |device, (min, max)| {
            device.min_fan = min;
            device.gpu_fan = max;
        },
    )
}

pub fn set_memclock(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set memory clock";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set memory clock",
        Broadcast::Capacity,
        |t| parse_int_in(t, 0, 9998, INVALID),
        |device, value| device.memclock = value,
    )
}

pub fn set_memdiff(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set memory clock delta";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set memory clock delta",
        Broadcast::Capacity,
        |t| parse_int_in(t, -9999, 9999, INVALID),
        |device, value| device.memdiff = value,
    )
}

pub fn set_powertune(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set powertune";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set powertune",
        Broadcast::Capacity,
        |t| parse_int_in(t, -99, 99, INVALID),
        |device, value| device.powertune = value,
    )
}

pub fn set_voltage(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set voltage";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set voltage",
        Broadcast::Capacity,
        |t| {
            let value = t
                .trim()
                .parse::<f32>()
                .map_err(|_| INVALID.to_string())?;
            if value < 0.0 || value >= 9999.0 {
                return Err(INVALID.to_string());
            }
            Ok(value)
        },
        |device, value| device.voltage = value,
    )
}

pub fn set_overheat_temp(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set overheat temperature";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set overheat temperature",
        Broadcast::Capacity,
        |t| parse_int_in(t, 0, 200, INVALID),
        |device, value| device.set_overheat_temp(value),
    )
}

pub fn set_target_temp(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    const INVALID: &str = "Invalid value passed to set target temperature";
    apply_tokens(
        registry,
        arg,
        "Invalid parameters for set target temperature",
        Broadcast::Capacity,
        |t| parse_int_in(t, 0, 200, INVALID),
        |device, value| device.set_target_temp(value),
    )
}

fn apply_intensity_token(device: &mut DeviceRecord, token: &str) -> SetResult {
    if token.starts_with('d') || token.starts_with('D') {
        device.set_dynamic();
        return Ok(());
    }
    let value = parse_int(token, "Invalid value passed to set intensity")?;
    if value == 0 {
        return Err("disabled".to_string());
    }
    if value < MIN_INTENSITY || value > MAX_INTENSITY {
        return Err("Invalid value passed to set intensity".to_string());
    }
    device.set_intensity(value);
    Ok(())
}

pub fn set_intensity(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    let mut device = 0;
    for token in tokens(arg) {
        if device == MAX_DEVICES {
            break;
        }
        apply_intensity_token(registry.device_mut(device), token)?;
        device += 1;
    }
    if device == 0 {
        return Err("Invalid parameters for set intensity".to_string());
    }
    if device == 1 {
        // spread the mode of slot 0, disabling the other sizing modes
        let (dynamic, intensity) = {
            let first = registry.device(0);
            (first.is_dynamic(), first.intensity())
        };
        for id in 1..MAX_DEVICES {
            let record = registry.device_mut(id);
            record.set_intensity(intensity);
            if dynamic {
                record.set_dynamic();
            }
        }
    }
    Ok(())
}

fn apply_exclusive_tokens<F>(
    registry: &mut DeviceRegistry,
    arg: &str,
    no_params: &str,
    invalid: &str,
    min: i32,
    max: i32,
    apply: F,
) -> SetResult
where
    F: Fn(&mut DeviceRecord, i32),
{
    let mut device = 0;
    for token in tokens(arg) {
        if device == MAX_DEVICES {
            break;
        }
        let value = parse_int(token, invalid)?;
        if value == 0 {
            return Err("disabled".to_string());
        }
        if value < min || value > max {
            return Err(invalid.to_string());
        }
        apply(registry.device_mut(device), value);
        device += 1;
    }
    if device == 0 {
        return Err(no_params.to_string());
    }
    if device == 1 {
        let first = registry.device(0).clone();
        for id in 1..MAX_DEVICES {
            registry.device_mut(id).copy_intensity_mode(&first);
        }
    }
    Ok(())
}

pub fn set_xintensity(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    apply_exclusive_tokens(
        registry,
        arg,
        "Invalid parameters for shader-based intensity",
        "Invalid value passed to set shader-based intensity",
        MIN_XINTENSITY,
        MAX_XINTENSITY,
        |device, value| device.set_xintensity(value),
    )
}

pub fn set_rawintensity(registry: &mut DeviceRegistry, arg: &str) -> SetResult {
    apply_exclusive_tokens(
        registry,
        arg,
        "Invalid parameters for raw intensity",
        "Invalid value passed to set raw intensity",
        MIN_RAWINTENSITY,
        MAX_RAWINTENSITY,
        |device, value| device.set_rawintensity(value),
    )
}

/// Size the next scan batch from the device's active sizing mode.
///
/// Returns the thread count and the hash-batch size (threads scaled by the
/// vector width). When the candidate undershoots `min_threads` the standard
/// intensity is stepped up until the count suffices or `MAX_INTENSITY` is
/// reached, at which point the count is pinned to the minimum itself.
pub fn tune_threads_hashes(
    device: &mut DeviceRecord,
    min_threads: u64,
    algorithm: &Algorithm,
) -> (u64, u64) {
    let mut threads: u64 = 0;

    while threads < min_threads {
        if device.rawintensity() > 0 {
            threads = device.rawintensity() as u64;
        } else if device.xintensity() > 0 {
            let scale = if algorithm.xintensity_shift > 0 {
                1u64.checked_shl(algorithm.xintensity_shift + device.xintensity() as u32)
                    .unwrap_or(std::u64::MAX)
            } else {
                device.xintensity() as u64
            };
            threads = u64::from(device.shaders).saturating_mul(scale);
        } else {
            let shift = algorithm.intensity_shift as i32 + device.intensity();
            threads = 1u64
                .checked_shl(shift.max(0) as u32)
                .unwrap_or(std::u64::MAX);
        }

        if threads < min_threads {
            if device.intensity() < MAX_INTENSITY {
                device.bump_intensity();
            } else {
                threads = min_threads;
            }
        }
    }

    let hashes = threads.saturating_mul(u64::from(device.vector_width));
    (threads, hashes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::algorithm;

    fn registry_with(detected: usize) -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.set_detected(detected);
        registry
    }

    #[test]
    fn test_single_value_broadcasts_to_capacity() {
        let mut registry = registry_with(2);
        set_vector_width(&mut registry, "2").expect("set failed");
        for device in registry.iter() {
            assert_eq!(device.vector_width, 2);
        }
    }

    #[test]
    fn test_work_size_broadcasts_to_detected_only() {
        let mut registry = registry_with(3);
        set_work_size(&mut registry, "128").expect("set failed");
        assert_eq!(registry.device(0).work_size, 128);
        assert_eq!(registry.device(2).work_size, 128);
        // slots beyond the detected range keep their previous value
        assert_eq!(registry.device(3).work_size, 0);
    }

    #[test]
    fn test_multiple_values_leave_later_slots_untouched() {
        let mut registry = registry_with(4);
        set_work_size(&mut registry, "64,128").expect("set failed");
        assert_eq!(registry.device(0).work_size, 64);
        assert_eq!(registry.device(1).work_size, 128);
        assert_eq!(registry.device(2).work_size, 0);
    }

    #[test]
    fn test_invalid_token_keeps_assigned_prefix() {
        let mut registry = registry_with(4);
        let result = set_work_size(&mut registry, "64,128,0,32");
        assert!(result.is_err());
        // the prefix before the bad token stays committed
        assert_eq!(registry.device(0).work_size, 64);
        assert_eq!(registry.device(1).work_size, 128);
        // nothing after it was applied
        assert_eq!(registry.device(2).work_size, 0);
        assert_eq!(registry.device(3).work_size, 0);
    }

    #[test]
    fn test_malformed_token_is_an_error() {
        let mut registry = registry_with(2);
        assert!(set_vector_width(&mut registry, "2,banana").is_err());
        assert!(set_vector_width(&mut registry, "").is_err());
        assert!(set_vector_width(&mut registry, "3").is_err());
    }

    #[test]
    fn test_intensity_dynamic_and_value_mix() {
        let mut registry = registry_with(2);
        set_intensity(&mut registry, "d,5").expect("set failed");
        assert!(registry.device(0).is_dynamic());
        assert!(!registry.device(1).is_dynamic());
        assert_eq!(registry.device(1).intensity(), 5);
        assert_eq!(registry.device(1).xintensity(), 0);
        assert_eq!(registry.device(1).rawintensity(), 0);
    }

    #[test]
    fn test_intensity_broadcast_copies_mode() {
        let mut registry = registry_with(2);
        set_intensity(&mut registry, "7").expect("set failed");
        for device in registry.iter() {
            assert!(!device.is_dynamic());
            assert_eq!(device.intensity(), 7);
        }

        set_intensity(&mut registry, "d").expect("set failed");
        for device in registry.iter() {
            assert!(device.is_dynamic());
        }
    }

    #[test]
    fn test_zero_intensity_family_is_disabled() {
        let mut registry = registry_with(1);
        assert_eq!(set_intensity(&mut registry, "0"), Err("disabled".to_string()));
        assert_eq!(
            set_xintensity(&mut registry, "0"),
            Err("disabled".to_string())
        );
        assert_eq!(
            set_rawintensity(&mut registry, "0"),
            Err("disabled".to_string())
        );
        // distinct from the range error
        assert_ne!(
            set_xintensity(&mut registry, "10000"),
            Err("disabled".to_string())
        );
    }

    #[test]
    fn test_intensity_family_mutual_exclusion() {
        let mut registry = registry_with(1);
        set_intensity(&mut registry, "9").expect("set failed");
        set_xintensity(&mut registry, "3").expect("set failed");
        {
            let device = registry.device(0);
            assert_eq!(device.intensity(), 0);
            assert_eq!(device.xintensity(), 3);
        }
        set_rawintensity(&mut registry, "8192").expect("set failed");
        {
            let device = registry.device(0);
            assert_eq!(device.xintensity(), 0);
            assert_eq!(device.rawintensity(), 8192);
        }
        set_intensity(&mut registry, "9").expect("set failed");
        let device = registry.device(0);
        assert_eq!(device.rawintensity(), 0);
        assert_eq!(device.intensity(), 9);
    }

    #[test]
    fn test_engine_clock_range() {
        let mut registry = registry_with(1);
        set_engine_clock(&mut registry, "600-900").expect("set failed");
        assert_eq!(registry.device(0).min_engine, 600);
        assert_eq!(registry.device(0).gpu_engine, 900);

        set_engine_clock(&mut registry, "750").expect("set failed");
        assert_eq!(registry.device(0).min_engine, 750);
        assert_eq!(registry.device(0).gpu_engine, 750);

        assert!(set_engine_clock(&mut registry, "600-10000").is_err());
    }

    #[test]
    fn test_memdiff_accepts_negative_values() {
        let mut registry = registry_with(1);
        set_memdiff(&mut registry, "-150").expect("set failed");
        assert_eq!(registry.device(0).memdiff, -150);
        assert!(set_memdiff(&mut registry, "-10000").is_err());
    }

    #[test]
    fn test_device_map_pairs() {
        let mut registry = registry_with(2);
        set_device_map(&mut registry, "0:1,1:0").expect("set failed");
        assert_eq!(registry.device(0).virtual_id, 1);
        assert!(registry.device(0).mapped);
        assert_eq!(registry.device(1).virtual_id, 0);
        assert!(set_device_map(&mut registry, "0").is_err());
    }

    #[test]
    fn test_thread_concurrency_empty_means_autodetect() {
        let mut registry = registry_with(2);
        set_thread_concurrency(&mut registry, "8192").expect("set failed");
        assert_eq!(registry.device(1).thread_concurrency, 8192);
        set_thread_concurrency(&mut registry, "").expect("set failed");
        assert_eq!(registry.device(0).thread_concurrency, 0);
        assert_eq!(registry.device(1).thread_concurrency, 0);
    }

    #[test]
    fn test_tuner_raw_mode_uses_value_directly() {
        let mut device = DeviceRecord::new(0);
        device.set_rawintensity(12345);
        let algorithm = algorithm::lyra2z();
        let (threads, hashes) = tune_threads_hashes(&mut device, 1, &algorithm);
        assert_eq!(threads, 12345);
        assert_eq!(hashes, 12345);
    }

    #[test]
    fn test_tuner_shader_mode_without_shift() {
        let mut device = DeviceRecord::new(0);
        device.shaders = 1024;
        device.set_xintensity(3);
        device.vector_width = 2;
        let algorithm = algorithm::lyra2z();
        let (threads, hashes) = tune_threads_hashes(&mut device, 1, &algorithm);
        assert_eq!(threads, 3 * 1024);
        assert_eq!(hashes, 2 * 3 * 1024);
    }

    #[test]
    fn test_tuner_standard_mode_steps_up_to_minimum() {
        let mut device = DeviceRecord::new(0);
        device.set_intensity(1);
        let algorithm = algorithm::lyra2z();
        // 2^(8+1) = 512 undershoots, intensity has to step to 2
        let (threads, _) = tune_threads_hashes(&mut device, 1024, &algorithm);
        assert_eq!(threads, 1024);
        assert_eq!(device.intensity(), 2);
    }

    #[test]
    fn test_tuner_never_returns_below_minimum() {
        let mut device = DeviceRecord::new(0);
        device.set_rawintensity(10);
        let algorithm = algorithm::lyra2z();
        let (threads, _) = tune_threads_hashes(&mut device, 5000, &algorithm);
        assert!(threads >= 5000);
        // intensity exhausted its range along the way
        assert_eq!(device.intensity(), MAX_INTENSITY);
    }
}
