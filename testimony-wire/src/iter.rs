use crate::tpacket3::{Tpacket3Hdr, TpacketBlockDesc};

/// A single captured packet inside a block, as exposed by [`PacketCursor`].
#[derive(Debug)]
pub struct Packet<'a> {
    header: &'a Tpacket3Hdr,
    block: &'a [u8],
    offset: usize,
}

impl<'a> Packet<'a> {
    #[inline]
    pub fn header(&self) -> &'a Tpacket3Hdr {
        self.header
    }

    /// Data pointer, per §6.4: `packet + mac_offset`.
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        let start = self.offset + self.header.tp_mac as usize;
        let end = start + self.header.tp_snaplen as usize;
        &self.block[start..end]
    }

    /// Nanosecond timestamp, per §6.4: `sec * 10^9 + nsec`.
    #[inline]
    pub fn timestamp_nanos(&self) -> u64 {
        self.header.tp_sec as u64 * 1_000_000_000 + self.header.tp_nsec as u64
    }
}

/// Raised by [`PacketCursor::reset`] when the block descriptor isn't
/// tpacket-v3 (§4.5: "Rejecting a non-v3 block is explicit").
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("block descriptor is not tpacket-v3")]
pub struct NotV3;

/// Walks the packet records of one block, in the order the kernel wrote
/// them, per §4.5 / §6.2: first packet at `offset_to_first_pkt`, then each
/// packet's own `tp_next_offset` until `num_pkts` is exhausted.
///
/// Scoped to one block; call [`reset`](Self::reset) to restart over a new
/// one (`iter_reset` in the C-ABI surface).
#[derive(Debug, Default)]
pub struct PacketCursor<'a> {
    block: Option<&'a [u8]>,
    next_offset: usize,
    idx: u32,
    count: u32,
}

impl<'a> PacketCursor<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the cursor to `block`, whose first bytes are a
    /// [`TpacketBlockDesc`]. Fails without mutating the cursor if the block
    /// isn't tpacket-v3.
    pub fn reset(&mut self, block: &'a [u8]) -> Result<(), NotV3> {
        let desc = unsafe { &*(block.as_ptr() as *const TpacketBlockDesc) };
        if !desc.is_v3() {
            return Err(NotV3);
        }
        self.block = Some(block);
        self.next_offset = desc.hdr.offset_to_first_pkt as usize;
        self.idx = 0;
        self.count = desc.hdr.num_pkts;
        Ok(())
    }

    pub fn is_exhausted(&self) -> bool {
        self.idx >= self.count
    }
}

impl<'a> Iterator for PacketCursor<'a> {
    type Item = Packet<'a>;

    fn next(&mut self) -> Option<Packet<'a>> {
        let block = self.block?;
        if self.idx >= self.count {
            return None;
        }
        let offset = self.next_offset;
        let header = unsafe { &*(block[offset..].as_ptr() as *const Tpacket3Hdr) };

        self.next_offset = if self.idx + 1 < self.count {
            offset + header.tp_next_offset as usize
        } else {
            block.len()
        };
        self.idx += 1;

        Some(Packet {
            header,
            block,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpacket3::{TpacketBDHeader, TpacketBDTS, TpacketHdrVariant1};
    use std::mem::size_of;

    /// Hand-builds one block: a `TpacketBlockDesc` header followed by two
    /// packet records, the second sized so `tp_next_offset` would overrun
    /// if the cursor didn't stop at `num_pkts`.
    fn synthetic_block(num_pkts: u32) -> Vec<u8> {
        let hdr_len = size_of::<TpacketBlockDesc>();
        let pkt_len = size_of::<Tpacket3Hdr>() + 16;
        let mut buf = vec![0u8; hdr_len + pkt_len * num_pkts as usize];

        let desc = TpacketBlockDesc {
            version: crate::tpacket3::TPACKET_V3 as u32,
            offset_to_priv: 0,
            hdr: TpacketBDHeader {
                block_status: crate::tpacket3::TP_STATUS_USER,
                num_pkts,
                offset_to_first_pkt: hdr_len as u32,
                blk_len: buf.len() as u32,
                seq_num: 1,
                ts_first_pkt: TpacketBDTS { ts_sec: 0, ts_nsec: 0 },
                ts_last_pkt: TpacketBDTS { ts_sec: 0, ts_nsec: 0 },
            },
        };
        unsafe {
            std::ptr::write(buf.as_mut_ptr() as *mut TpacketBlockDesc, desc);
        }

        for i in 0..num_pkts {
            let offset = hdr_len + i as usize * pkt_len;
            let next_offset = if i + 1 < num_pkts { pkt_len as u32 } else { 0 };
            let hdr = Tpacket3Hdr {
                tp_next_offset: next_offset,
                tp_sec: 100,
                tp_nsec: i,
                tp_snaplen: 16,
                tp_len: 16,
                tp_status: crate::tpacket3::TP_STATUS_USER,
                tp_mac: size_of::<Tpacket3Hdr>() as u16,
                tp_net: size_of::<Tpacket3Hdr>() as u16,
                hv1: TpacketHdrVariant1 {
                    tp_rxhash: 0,
                    tp_vlan_tci: 0,
                    tp_vlan_tpid: 0,
                },
            };
            unsafe {
                std::ptr::write(buf[offset..].as_mut_ptr() as *mut Tpacket3Hdr, hdr);
            }
        }
        buf
    }

    #[test]
    fn walks_exactly_num_pkts_records() {
        let block = synthetic_block(2);
        let mut cursor = PacketCursor::new();
        cursor.reset(&block).unwrap();

        let packets: Vec<_> = cursor.collect();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].timestamp_nanos(), 100_000_000_000);
        assert_eq!(packets[1].timestamp_nanos(), 100_000_000_001);
    }

    #[test]
    fn rejects_non_v3_block() {
        let mut block = synthetic_block(1);
        block[0] = 0xff;
        let mut cursor = PacketCursor::new();
        assert!(cursor.reset(&block).is_err());
    }

    #[test]
    fn empty_block_yields_no_packets() {
        let block = synthetic_block(0);
        let mut cursor = PacketCursor::new();
        cursor.reset(&block).unwrap();
        assert!(cursor.next().is_none());
        assert!(cursor.is_exhausted());
    }
}
