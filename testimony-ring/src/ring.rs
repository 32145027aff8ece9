use std::io::{Error, Result};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{
    bind, c_int, c_void, mmap, poll, pollfd, sockaddr, sockaddr_ll, sockaddr_storage, AF_PACKET,
    ETH_P_ALL, MAP_LOCKED, MAP_NORESERVE, MAP_SHARED, POLLERR, POLLIN, PROT_READ, PROT_WRITE,
};

use testimony_wire::tpacket3::{self, FanoutKind};
use testimony_wire::{PacketCursor, RingErrorKind, RingGeometry, RingResult};

use crate::socket::{self, FilterProgram, Socket};

const PACKET_RX_RING: c_int = 5;
const PACKET_STATISTICS: c_int = 6;
const PACKET_VERSION: c_int = 10;
const PACKET_FANOUT: c_int = 18;

/// Everything the Ring Provider needs to open one fanout shard's socket,
/// per §3/§4.1: interface, geometry, timeout, fanout membership, optional
/// locked filter.
#[derive(Clone, Debug)]
pub struct RingConfig {
    pub if_name: String,
    pub block_size: u32,
    pub block_count: u32,
    pub block_timeout_ms: u32,
    pub fanout_id: u16,
    pub fanout_size: u32,
    pub fanout_kind: FanoutKind,
    pub filter: Option<FilterProgram>,
}

impl RingConfig {
    /// §3's invariant: block size is a power of two with exponent `k` in `[12, 32]`.
    fn validate(&self) -> RingResult<()> {
        if self.block_count == 0 {
            return Err(RingErrorKind::Configuration(
                "block_count must be >= 1".into(),
            ));
        }
        if self.fanout_size == 0 {
            return Err(RingErrorKind::Configuration(
                "fanout_size must be >= 1".into(),
            ));
        }
        let k = self.block_size.trailing_zeros();
        if !self.block_size.is_power_of_two() || !(12..=32).contains(&k) {
            return Err(RingErrorKind::Configuration(format!(
                "block_size {} must be a power of two with exponent in [12, 32]",
                self.block_size
            )));
        }
        Ok(())
    }

    pub fn geometry(&self) -> RingGeometry {
        RingGeometry {
            fanout_size: self.fanout_size,
            block_size: self.block_size,
            block_count: self.block_count,
        }
    }
}

/// Guards partially-constructed ring resources so every early-return path
/// in [`open`] releases exactly what it opened, instead of a manual
/// cleanup ladder at each `?`.
struct PartialRing {
    fd: Option<c_int>,
    mapping: Option<(*mut u8, usize)>,
}

impl Drop for PartialRing {
    fn drop(&mut self) {
        if let Some((addr, len)) = self.mapping.take() {
            unsafe {
                libc::munmap(addr as *mut c_void, len);
            }
        }
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Ring Provider operation: opens a raw capture socket, configures the
/// tpacket-v3 RX ring, mmaps it, binds to the interface, and joins the
/// configured fanout group, in the order §4.1 mandates. Cleans up
/// everything already opened before returning on any failure.
pub fn open(cfg: &RingConfig) -> RingResult<Ring> {
    cfg.validate()?;

    let mut guard = PartialRing {
        fd: None,
        mapping: None,
    };

    let mut sock = Socket::from_if_name(&cfg.if_name, socket::AF_PACKET)
        .map_err(RingErrorKind::SocketCreate)?;
    guard.fd = Some(sock.fd);

    sock.setsockopt(PACKET_VERSION, tpacket3::TPACKET_V3)
        .map_err(RingErrorKind::VersionSet)?;

    if let Some(filter) = &cfg.filter {
        sock.set_bpf_filter(filter)
            .map_err(RingErrorKind::FilterAttach)?;
        sock.lock_filter()
            .map_err(|_| RingErrorKind::FilterLockUnavailable)?;
    }

    let frame_size = cfg.block_size;
    let frame_nr = (cfg.block_size * cfg.block_count) / frame_size;
    let req = tpacket3::TpacketReq3 {
        tp_block_size: cfg.block_size,
        tp_block_nr: cfg.block_count,
        tp_frame_size: frame_size,
        tp_frame_nr: frame_nr,
        tp_retire_blk_tov: cfg.block_timeout_ms,
        tp_sizeof_priv: 0,
        tp_feature_req_word: 0,
    };
    sock.setsockopt(PACKET_RX_RING, req)
        .map_err(RingErrorKind::RingRequest)?;

    let map_len = (cfg.block_size * cfg.block_count) as usize;
    let base = unsafe {
        mmap(
            std::ptr::null_mut(),
            map_len,
            PROT_READ | PROT_WRITE,
            MAP_SHARED | MAP_LOCKED | MAP_NORESERVE,
            sock.fd,
            0,
        )
    };
    if base as isize == -1 {
        return Err(RingErrorKind::Mmap(Error::last_os_error()));
    }
    guard.mapping = Some((base as *mut u8, map_len));

    bind_to_interface(&sock).map_err(RingErrorKind::Bind)?;

    if cfg.fanout_size > 1 {
        let fanout_arg =
            (cfg.fanout_id as u32) | ((cfg.fanout_kind.as_packet_fanout() as u32) << 16);
        sock.setsockopt(PACKET_FANOUT, fanout_arg)
            .map_err(RingErrorKind::FanoutJoin)?;
    }

    let mut blocks = Vec::with_capacity(cfg.block_count as usize);
    unsafe {
        for idx in 0..cfg.block_count {
            let raw_data = (base as *mut u8).add(idx as usize * cfg.block_size as usize);
            blocks.push(RawBlock {
                desc: raw_data as *mut tpacket3::TpacketBlockDesc,
                raw_data,
                len: cfg.block_size as usize,
            });
        }
    }

    // Ownership transferred into `Ring`; disarm the cleanup guard.
    guard.fd = None;
    guard.mapping = None;

    sock.set_non_blocking().ok();

    Ok(Ring {
        socket: sock,
        blocks,
        states: vec![BlockState::Kernel; cfg.block_count as usize],
        base: base as *mut u8,
        block_size: cfg.block_size,
        block_count: cfg.block_count,
        cur_idx: 0,
    })
}

fn bind_to_interface(sock: &Socket) -> Result<()> {
    unsafe {
        let mut ss: sockaddr_storage = std::mem::zeroed();
        let sll: *mut sockaddr_ll = &mut ss as *mut sockaddr_storage as *mut sockaddr_ll;
        (*sll).sll_family = AF_PACKET as u16;
        (*sll).sll_protocol = (ETH_P_ALL as u16).to_be();
        (*sll).sll_ifindex = sock.if_index as c_int;

        let sa = (&ss as *const sockaddr_storage) as *const sockaddr;
        let res = bind(sock.fd, sa, std::mem::size_of::<sockaddr_ll>() as u32);
        if res == -1 {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

/// Per-block ownership state, per §3/§4.2. `Client` carries the owning
/// session's id and a per-assignment sequence number, per §9's
/// re-architecture note; the transition rules only ever check "is this
/// `Client(session_id, _)`", the sequence number is purely for accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockState {
    Kernel,
    Daemon,
    Client { session_id: u64, seq: u64 },
}

/// One mmapped RX ring backing one fanout shard (§3 "Ring").
#[derive(Debug)]
pub struct Ring {
    socket: Socket,
    blocks: Vec<RawBlock>,
    states: Vec<BlockState>,
    base: *mut u8,
    block_size: u32,
    block_count: u32,
    cur_idx: u32,
}

unsafe impl Send for Ring {}

impl Ring {
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn state(&self, idx: u32) -> BlockState {
        self.states[idx as usize]
    }

    /// Advances the monotonic retirement cursor (§4.2) by one block if the
    /// kernel has retired it, transitioning `Kernel -> Daemon` and
    /// returning its index. Ring order, never out of order.
    pub fn poll_retired(&mut self) -> Option<u32> {
        let idx = self.cur_idx;
        if self.blocks[idx as usize].is_ready() {
            self.states[idx as usize] = BlockState::Daemon;
            self.cur_idx = (self.cur_idx + 1) % self.block_count;
            Some(idx)
        } else {
            None
        }
    }

    /// `Daemon -> Client` when a session is registered for this shard.
    pub fn assign_to_client(&mut self, idx: u32, session_id: u64, seq: u64) {
        debug_assert_eq!(self.states[idx as usize], BlockState::Daemon);
        self.states[idx as usize] = BlockState::Client { session_id, seq };
    }

    /// `Daemon -> Kernel`, the "drop" path under absence of consumers
    /// (§4.2): no session is registered for this shard, so the block is
    /// returned right away.
    pub fn drop_to_kernel(&mut self, idx: u32) {
        self.blocks[idx as usize].mark_kernel();
        self.states[idx as usize] = BlockState::Kernel;
    }

    /// `Client -> Kernel`, only if `session_id` currently owns the block;
    /// this is the fatal-protocol-error check of §4.2/§4.4 ("a client that
    /// returns a block index it does not own").
    pub fn return_from_client(&mut self, idx: u32, session_id: u64) -> bool {
        match self.states.get(idx as usize) {
            Some(BlockState::Client { session_id: owner, .. }) if *owner == session_id => {
                self.blocks[idx as usize].mark_kernel();
                self.states[idx as usize] = BlockState::Kernel;
                true
            }
            _ => false,
        }
    }

    fn wait_for_block(&self, timeout_ms: i32) {
        let mut pfd = pollfd {
            fd: self.socket.fd,
            events: POLLIN | POLLERR,
            revents: 0,
        };
        unsafe {
            poll(&mut pfd, 1, timeout_ms);
        }
    }

    /// Blocks up to `timeout_ms` for the kernel to retire the next
    /// ring-order block, then checks it. Returns `None` on a plain
    /// timeout; callers loop as needed.
    pub fn recv_block(&mut self, timeout_ms: i32) -> Option<u32> {
        if let Some(idx) = self.poll_retired() {
            return Some(idx);
        }
        self.wait_for_block(timeout_ms);
        self.poll_retired()
    }

    /// A borrowed, read-only view over block `idx`'s bytes, for iterating
    /// packets without giving up the daemon's write access to the rest of
    /// the mapping.
    pub fn block_bytes(&self, idx: u32) -> &[u8] {
        let block = &self.blocks[idx as usize];
        unsafe { std::slice::from_raw_parts(block.raw_data, block.len) }
    }

    pub fn packets(&self, idx: u32) -> PacketCursor<'_> {
        let mut cursor = PacketCursor::new();
        let _ = cursor.reset(self.block_bytes(idx));
        cursor
    }
}

impl AsRawFd for Ring {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        let map_len = self.block_size as usize * self.block_count as usize;
        unsafe {
            libc::munmap(self.base as *mut c_void, map_len);
            libc::close(self.socket.fd);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RawBlock {
    desc: *mut tpacket3::TpacketBlockDesc,
    raw_data: *mut u8,
    len: usize,
}

impl RawBlock {
    fn desc(&self) -> &tpacket3::TpacketBlockDesc {
        unsafe { self.desc.as_ref().unwrap() }
    }

    fn is_ready(&self) -> bool {
        (self.desc().hdr.block_status & tpacket3::TP_STATUS_USER) != 0
    }

    fn mark_kernel(&mut self) {
        unsafe {
            (*self.desc).hdr.block_status = tpacket3::TP_STATUS_KERNEL;
        }
    }

    #[cfg(test)]
    fn desc_mut(&mut self) -> &mut tpacket3::TpacketBlockDesc {
        unsafe { self.desc.as_mut().unwrap() }
    }
}

/// Reads the kernel's packet/drop counters for a capture socket (`PACKET_STATISTICS`).
pub fn get_rx_statistics(fd: RawFd) -> Result<tpacket3::TpacketStatsV3> {
    let mut stats = tpacket3::TpacketStatsV3 {
        tp_packets: 0,
        tp_drops: 0,
        tp_freeze_q_cnt: 0,
    };
    let ptr = &mut stats as *mut _ as *mut c_void;
    socket::get_sock_opt(fd, PACKET_STATISTICS, &ptr)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a `Ring` over a plain heap buffer standing in for the mmap
    /// region, so `BlockState`/cursor logic can be exercised without a
    /// real `AF_PACKET` socket or `CAP_NET_RAW`. The backing socket fd is
    /// a throwaway end of a `socketpair`, just so `Ring`'s `Drop` has
    /// something harmless to close.
    fn test_ring(block_count: u32, block_size: u32) -> Ring {
        let mut fds = [0 as c_int; 2];
        unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr());
        }
        let socket = Socket {
            fd: fds[0],
            if_name: String::new(),
            if_index: 0,
            sock_type: libc::SOCK_RAW,
        };
        unsafe {
            libc::close(fds[1]);
        }

        let map_len = block_size as usize * block_count as usize;
        let buf = vec![0u8; map_len].into_boxed_slice();
        let base = Box::leak(buf).as_mut_ptr();

        let mut blocks = Vec::with_capacity(block_count as usize);
        for idx in 0..block_count {
            let raw_data = unsafe { base.add(idx as usize * block_size as usize) };
            blocks.push(RawBlock {
                desc: raw_data as *mut tpacket3::TpacketBlockDesc,
                raw_data,
                len: block_size as usize,
            });
        }

        Ring {
            socket,
            blocks,
            states: vec![BlockState::Kernel; block_count as usize],
            base,
            block_size,
            block_count,
            cur_idx: 0,
        }
    }

    fn mark_ready(ring: &mut Ring, idx: u32) {
        ring.blocks[idx as usize].desc_mut().hdr.block_status = tpacket3::TP_STATUS_USER;
    }

    #[test]
    fn poll_retired_only_advances_on_ready_blocks_in_ring_order() {
        let mut ring = test_ring(4, 4096);
        assert_eq!(ring.poll_retired(), None, "nothing retired yet");

        mark_ready(&mut ring, 0);
        assert_eq!(ring.poll_retired(), Some(0));
        assert_eq!(ring.state(0), BlockState::Daemon);
        // cursor moved past 0; block 2 being ready doesn't let it jump ahead.
        mark_ready(&mut ring, 2);
        assert_eq!(ring.poll_retired(), None);

        mark_ready(&mut ring, 1);
        assert_eq!(ring.poll_retired(), Some(1));
        assert_eq!(ring.poll_retired(), Some(2));
    }

    #[test]
    fn block_ownership_follows_kernel_daemon_client_kernel() {
        let mut ring = test_ring(2, 4096);
        mark_ready(&mut ring, 0);
        assert_eq!(ring.poll_retired(), Some(0));
        assert_eq!(ring.state(0), BlockState::Daemon);

        ring.assign_to_client(0, 7, 1);
        assert_eq!(ring.state(0), BlockState::Client { session_id: 7, seq: 1 });

        assert!(!ring.return_from_client(0, 8), "wrong session must not reclaim");
        assert!(ring.return_from_client(0, 7));
        assert_eq!(ring.state(0), BlockState::Kernel);
    }

    #[test]
    fn drop_to_kernel_reclaims_an_unclaimed_block() {
        let mut ring = test_ring(1, 4096);
        mark_ready(&mut ring, 0);
        assert_eq!(ring.poll_retired(), Some(0));
        ring.drop_to_kernel(0);
        assert_eq!(ring.state(0), BlockState::Kernel);
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        let cfg = RingConfig {
            if_name: "lo".into(),
            block_size: 1000,
            block_count: 4,
            block_timeout_ms: 100,
            fanout_id: 1,
            fanout_size: 1,
            fanout_kind: FanoutKind::Hash,
            filter: None,
        };
        assert!(matches!(cfg.validate(), Err(RingErrorKind::Configuration(_))));
    }

    #[test]
    fn rejects_zero_block_count() {
        let cfg = RingConfig {
            if_name: "lo".into(),
            block_size: 4096,
            block_count: 0,
            block_timeout_ms: 100,
            fanout_id: 1,
            fanout_size: 1,
            fanout_kind: FanoutKind::Hash,
            filter: None,
        };
        assert!(matches!(cfg.validate(), Err(RingErrorKind::Configuration(_))));
    }

    #[test]
    fn accepts_valid_geometry() {
        let cfg = RingConfig {
            if_name: "lo".into(),
            block_size: 65536,
            block_count: 8,
            block_timeout_ms: 100,
            fanout_id: 1,
            fanout_size: 1,
            fanout_kind: FanoutKind::Hash,
            filter: None,
        };
        assert!(cfg.validate().is_ok());
    }
}
