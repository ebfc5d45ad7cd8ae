//! BLAKE-256 compression and the lyra2z algorithm descriptor.
//!
//! The FPGA firmware expects the BLAKE-256 chaining state after the first
//! 64-byte chunk of the (word-swapped) block header; the device finishes the
//! remaining rounds itself while rolling the nonce.

use crate::hal::{Algorithm, MIDSTATE_SIZE};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

const SIGMA: [[usize; 16]; 10] = [
    [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
    [14, 10, 4, 8, 9, 15, 13, 6, 1, 12, 0, 2, 11, 7, 5, 3],
    [11, 8, 12, 0, 5, 2, 15, 13, 10, 14, 3, 6, 7, 1, 9, 4],
    [7, 9, 3, 1, 13, 12, 11, 14, 2, 6, 5, 10, 4, 0, 15, 8],
    [9, 0, 5, 7, 2, 4, 10, 15, 14, 1, 11, 12, 6, 8, 3, 13],
    [2, 12, 6, 10, 0, 11, 8, 3, 4, 13, 7, 5, 15, 14, 1, 9],
    [12, 5, 1, 15, 14, 13, 4, 10, 0, 7, 6, 3, 9, 2, 8, 11],
    [13, 11, 7, 14, 12, 1, 3, 9, 5, 0, 15, 4, 8, 6, 2, 10],
    [6, 15, 14, 9, 11, 3, 0, 8, 12, 2, 13, 7, 1, 4, 10, 5],
    [10, 2, 8, 4, 7, 6, 1, 5, 15, 11, 9, 14, 3, 12, 13, 0],
];

const CST: [u32; 16] = [
    0x243f6a88, 0x85a308d3, 0x13198a2e, 0x03707344, 0xa4093822, 0x299f31d0, 0x082efa98, 0xec4e6c89,
    0x452821e6, 0x38d01377, 0xbe5466cf, 0x34e90c6c, 0xc0ac29b7, 0xc97c50dd, 0x3f84d5b5, 0xb5470917,
];

const IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

const ROUNDS: usize = 14;

/// Run the BLAKE-256 compression function over one 64-byte block.
/// * `t` - number of message bits processed so far including this block
pub fn compress(h: &mut [u32; 8], block: &[u8; 64], t: u64) {
    let mut m = [0u32; 16];
    BigEndian::read_u32_into(block, &mut m);

    let t0 = t as u32;
    let t1 = (t >> 32) as u32;
    let mut v = [
        h[0],
        h[1],
        h[2],
        h[3],
        h[4],
        h[5],
        h[6],
        h[7],
        CST[0],
        CST[1],
        CST[2],
        CST[3],
        t0 ^ CST[4],
        t0 ^ CST[5],
        t1 ^ CST[6],
        t1 ^ CST[7],
    ];

    for round in 0..ROUNDS {
        let s = &SIGMA[round % 10];
        for (i, &(a, b, c, d)) in [
            (0, 4, 8, 12),
            (1, 5, 9, 13),
            (2, 6, 10, 14),
            (3, 7, 11, 15),
            (0, 5, 10, 15),
            (1, 6, 11, 12),
            (2, 7, 8, 13),
            (3, 4, 9, 14),
        ]
        .iter()
        .enumerate()
        {
            v[a] = v[a]
                .wrapping_add(v[b])
                .wrapping_add(m[s[2 * i]] ^ CST[s[2 * i + 1]]);
            v[d] = (v[d] ^ v[a]).rotate_right(16);
            v[c] = v[c].wrapping_add(v[d]);
            v[b] = (v[b] ^ v[c]).rotate_right(12);
            v[a] = v[a]
                .wrapping_add(v[b])
                .wrapping_add(m[s[2 * i + 1]] ^ CST[s[2 * i]]);
            v[d] = (v[d] ^ v[a]).rotate_right(8);
            v[c] = v[c].wrapping_add(v[d]);
            v[b] = (v[b] ^ v[c]).rotate_right(7);
        }
    }

    for i in 0..8 {
        h[i] ^= v[i] ^ v[i + 8];
    }
}

/// Full BLAKE-256 digest; the wire protocol only needs `midstate` but the
/// complete hash keeps the primitive verifiable against published vectors.
pub fn digest(data: &[u8]) -> [u8; 32] {
    let mut h = IV;
    let bitlen = (data.len() as u64) * 8;

    let mut chunks = data.chunks_exact(64);
    let mut t = 0u64;
    for block in &mut chunks {
        t += 512;
        let mut buf = [0u8; 64];
        buf.copy_from_slice(block);
        compress(&mut h, &buf, t);
    }

    let rest = chunks.remainder();
    let r = rest.len();
    let mut block = [0u8; 64];
    block[..r].copy_from_slice(rest);

    if r <= 54 {
        block[r] = 0x80;
        block[55] |= 0x01;
        BigEndian::write_u64(&mut block[56..], bitlen);
        // a block carrying no message bits is counted as zero
        let tf = if r == 0 { 0 } else { bitlen };
        compress(&mut h, &block, tf);
    } else if r == 55 {
        block[55] = 0x81;
        BigEndian::write_u64(&mut block[56..], bitlen);
        compress(&mut h, &block, bitlen);
    } else {
        block[r] = 0x80;
        compress(&mut h, &block, bitlen);
        let mut last = [0u8; 64];
        last[55] = 0x01;
        BigEndian::write_u64(&mut last[56..], bitlen);
        compress(&mut h, &last, 0);
    }

    let mut out = [0u8; 32];
    BigEndian::write_u32_into(&h, &mut out);
    out
}

/// Chaining state after compressing the first 64 header bytes, serialized as
/// the eight state words in little-endian order (the layout the firmware
/// consumes). `data` must hold at least 64 bytes.
pub fn midstate(data: &[u8]) -> [u8; MIDSTATE_SIZE] {
    assert!(data.len() >= 64, "midstate input shorter than one block");

    let mut block = [0u8; 64];
    block.copy_from_slice(&data[..64]);

    let mut h = IV;
    compress(&mut h, &block, 512);

    let mut out = [0u8; MIDSTATE_SIZE];
    LittleEndian::write_u32_into(&h, &mut out);
    out
}

pub fn lyra2z() -> Algorithm {
    Algorithm {
        name: "lyra2z",
        intensity_shift: 8,
        xintensity_shift: 0,
        midstate,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Vectors from the BLAKE SHA-3 submission
    #[test]
    fn test_digest_vectors() {
        assert_eq!(
            hex::encode(&digest(&[0u8])[..]),
            "0ce8d4ef4dd7cd8d62dfded9d4edb0a774ae6a41929a74da23109e8f11139c87"
        );
        assert_eq!(
            hex::encode(&digest(&[])[..]),
            "716f6e863f744b9ac22c97ec7b76ea5f5908bc5b2f67c61510bfc4751384ea7a"
        );
    }

    #[test]
    fn test_midstate_of_sample_header() {
        let block = crate::test_utils::sample_block();
        assert_eq!(
            midstate(&block.swapped_header()[..64])[..],
            block.midstate[..]
        );
    }

    #[test]
    fn test_midstate_matches_digest_state() {
        // 64 zero bytes, midstate must differ from the IV serialization
        let mut iv_bytes = [0u8; 32];
        LittleEndian::write_u32_into(&IV, &mut iv_bytes);
        assert_ne!(midstate(&[0u8; 64])[..], iv_bytes[..]);
    }
}
