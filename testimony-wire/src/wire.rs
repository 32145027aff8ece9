//! Control-protocol wire constants and big-endian frame encoding, per §6.1.
//!
//! This module only encodes/decodes fixed-size integers to/from byte
//! arrays; it does no I/O itself so it can be shared between the daemon's
//! tokio-based session and the client library's blocking socket code.

/// `0x01`, written by the daemon as the very first byte of a connection.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Geometry the daemon advertises right after the version byte: fanout
/// size, block size (bytes), block count, in that order (§6.1 steps 2-4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingGeometry {
    pub fanout_size: u32,
    pub block_size: u32,
    pub block_count: u32,
}

impl RingGeometry {
    pub fn to_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0..4].copy_from_slice(&self.fanout_size.to_be_bytes());
        buf[4..8].copy_from_slice(&self.block_size.to_be_bytes());
        buf[8..12].copy_from_slice(&self.block_count.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; 12]) -> RingGeometry {
        RingGeometry {
            fanout_size: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            block_size: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            block_count: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    /// Total mapping length a client mmaps read-only: `block_size * block_count`.
    pub fn mapping_len(self) -> usize {
        self.block_size as usize * self.block_count as usize
    }
}

#[inline]
pub fn encode_u32(v: u32) -> [u8; 4] {
    v.to_be_bytes()
}

#[inline]
pub fn decode_u32(buf: [u8; 4]) -> u32 {
    u32::from_be_bytes(buf)
}

/// Single non-meaningful data byte required alongside the ancillary
/// `SCM_RIGHTS` message carrying the capture fd (§4.4 step 4, §6.1 step 6).
pub const FD_HANDOFF_BYTE: u8 = 0x00;
