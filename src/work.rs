use byteorder::{ByteOrder, LittleEndian};

/// A mining block header is 80 bytes long
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Share target is 32 bytes long
pub const TARGET_SIZE: usize = 32;

/// One candidate block header plus target, issued by the pool layer.
///
/// The engine borrows the item for the duration of one scan cycle and returns
/// it unchanged except for the nonce-range bookkeeping in `advance_nonce`.
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Raw block header bytes as delivered by the pool protocol
    pub header: [u8; BLOCK_HEADER_SIZE],
    /// Share target, most-significant byte last
    pub target: [u8; TARGET_SIZE],
    /// Identifies the pool this work originates from
    pub pool_id: usize,
    /// Start of the nonce range to be searched next cycle
    pub nonce_start: u32,
    /// Midstate cached by the driver's prepare-work hook
    pub midstate: Option<[u8; 32]>,
}

impl WorkItem {
    pub fn new(header: [u8; BLOCK_HEADER_SIZE], target: [u8; TARGET_SIZE], pool_id: usize) -> Self {
        Self {
            header,
            target,
            pool_id,
            nonce_start: 0,
            midstate: None,
        }
    }

    /// The amount of work scanned can fluctuate when intensity changes and
    /// since this runs one cycle behind, the nonce is incremented by more than
    /// enough to prevent repeating work.
    pub fn advance_nonce(&mut self, stride: u64) {
        self.nonce_start = self.nonce_start.wrapping_add(stride as u32);
    }
}

/// Generate unique placeholder work for device bring-up and benchmarking.
/// * `i` - unique identifier mixed into the header
pub fn null_work(i: u64) -> WorkItem {
    let mut header = [0u8; BLOCK_HEADER_SIZE];
    LittleEndian::write_u64(&mut header[36..44], i);
    let target = [0xffu8; TARGET_SIZE];
    WorkItem::new(header, target, 0)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_advance_nonce_wraps() {
        let mut work = null_work(0);
        work.nonce_start = 0xffff_fff0;
        work.advance_nonce(0x20);
        assert_eq!(work.nonce_start, 0x10);
    }

    #[test]
    fn test_null_work_unique() {
        assert_ne!(null_work(1).header[..], null_work(2).header[..]);
    }
}
