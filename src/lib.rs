pub mod algorithm;
pub mod device;
pub mod error;
pub mod fleet;
pub mod hal;
pub mod misc;
pub mod protocol;
pub mod recovery;
pub mod serial;
pub mod stats;
pub mod tuning;
pub mod work;

#[cfg(test)]
pub mod test_utils;
