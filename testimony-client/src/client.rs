//! Reference client library (§4.5): connects to a Testimony control
//! socket, negotiates a shard, mmaps the shared ring read-only, and hands
//! out blocks as they retire.

use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use libc::{c_void, mmap, munmap, poll, pollfd, MAP_SHARED, POLLIN, PROT_READ};

use testimony_wire::{wire, ClientErrorKind, ClientResult, PacketCursor, RingGeometry, PROTOCOL_VERSION};

use crate::fdpass;

/// One block of packets on loan from the daemon. Holds no data of its
/// own; `bytes()` borrows straight out of the client's mmap.
#[derive(Debug)]
pub struct Block<'a> {
    index: u32,
    bytes: &'a [u8],
}

impl<'a> Block<'a> {
    /// Wraps a raw block slice handed back across the C ABI, where the
    /// real index isn't tracked on the caller's side; `return_block`
    /// recomputes it from the pointer so `index` here is a placeholder.
    pub(crate) fn from_raw_parts(bytes: &'a [u8]) -> Block<'a> {
        Block { index: u32::MAX, bytes }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Packet iterator scoped to this block (§6.4 `iter_reset` + `iter_next`).
    pub fn packets(&self) -> ClientResult<PacketCursor<'a>> {
        let mut cursor = PacketCursor::new();
        cursor.reset(self.bytes).map_err(|_| ClientErrorKind::NotV3)?;
        Ok(cursor)
    }
}

/// A live connection to one Testimony control socket, bound to one shard.
pub struct Client {
    sock: UnixStream,
    afpacket_fd: RawFd,
    base: *mut u8,
    geometry: RingGeometry,
}

// The mapping is read-only and `base` is only ever read through `&self`;
// `Client` is not `Clone`, so there is exactly one owner of the pointer.
unsafe impl Send for Client {}

fn read_exact(sock: &UnixStream, buf: &mut [u8]) -> ClientResult<()> {
    match (&*sock).read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ClientErrorKind::ConnectionClosed)
        }
        Err(e) => Err(ClientErrorKind::Io(e)),
    }
}

impl Client {
    /// Connects to `socket_path` and negotiates `shard` (§6.1 steps 1-6).
    pub fn connect<P: AsRef<Path>>(socket_path: P, shard: u32) -> ClientResult<Client> {
        let sock = UnixStream::connect(socket_path).map_err(ClientErrorKind::Connect)?;

        let mut version = [0u8; 1];
        read_exact(&sock, &mut version)?;
        if version[0] != PROTOCOL_VERSION {
            return Err(ClientErrorKind::UnsupportedVersion(version[0]));
        }

        let mut geom_buf = [0u8; 12];
        read_exact(&sock, &mut geom_buf)?;
        let geometry = RingGeometry::from_bytes(geom_buf);
        if shard >= geometry.fanout_size {
            return Err(ClientErrorKind::ShardOutOfRange(shard));
        }

        (&sock)
            .write_all(&wire::encode_u32(shard))
            .map_err(ClientErrorKind::Io)?;

        let afpacket_fd = fdpass::recv_fd(&sock).map_err(ClientErrorKind::FdPassing)?;

        let map_len = geometry.mapping_len();
        let base = unsafe {
            mmap(
                std::ptr::null_mut(),
                map_len,
                PROT_READ,
                MAP_SHARED,
                afpacket_fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(afpacket_fd) };
            return Err(ClientErrorKind::Mmap(err));
        }

        Ok(Client {
            sock,
            afpacket_fd,
            base: base as *mut u8,
            geometry,
        })
    }

    pub fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    /// Blocks for up to `timeout_ms` waiting for the next retired block.
    /// `timeout_ms < 0` blocks forever; `0` polls without waiting, per the
    /// reference client's `get_block` contract.
    pub fn get_block(&mut self, timeout_ms: i32) -> ClientResult<Option<Block<'_>>> {
        if timeout_ms >= 0 {
            let mut pfd = pollfd {
                fd: self.sock.as_raw_fd(),
                events: POLLIN,
                revents: 0,
            };
            let r = unsafe { poll(&mut pfd, 1, timeout_ms) };
            if r < 0 {
                return Err(ClientErrorKind::Io(std::io::Error::last_os_error()));
            }
            if r == 0 {
                return Ok(None);
            }
        }

        let mut buf = [0u8; 4];
        read_exact(&self.sock, &mut buf)?;
        let index = wire::decode_u32(buf);
        if index >= self.geometry.block_count {
            return Err(ClientErrorKind::UnknownBlockIndex(index));
        }

        let block_size = self.geometry.block_size as usize;
        let start = index as usize * block_size;
        let bytes = unsafe { std::slice::from_raw_parts(self.base.add(start), block_size) };
        Ok(Some(Block { index, bytes }))
    }

    /// Hands a block back to the daemon (§6.1 final step). The index is
    /// recomputed from the block's own pointer, mirroring the original
    /// client's pointer-arithmetic approach rather than trusting a stored
    /// field the caller could have mutated.
    pub fn return_block(&mut self, block: Block<'_>) -> ClientResult<()> {
        let block_size = self.geometry.block_size as usize;
        let offset = (block.bytes.as_ptr() as usize)
            .checked_sub(self.base as usize)
            .ok_or(ClientErrorKind::BlockPointerInvalid)?;
        if offset % block_size != 0 || offset / block_size >= self.geometry.block_count as usize {
            return Err(ClientErrorKind::BlockPointerInvalid);
        }
        let index = (offset / block_size) as u32;

        (&self.sock)
            .write_all(&wire::encode_u32(index))
            .map_err(ClientErrorKind::Io)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        unsafe {
            munmap(self.base as *mut c_void, self.geometry.mapping_len());
            libc::close(self.afpacket_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Drives a minimal fake daemon over a socketpair: sends version,
    /// geometry, reads back the shard request, passes a throwaway fd, then
    /// serves one block index.
    fn fake_daemon(mut server: UnixStream, geometry: RingGeometry, block_index: u32) {
        server.write_all(&[PROTOCOL_VERSION]).unwrap();
        server.write_all(&geometry.to_bytes()).unwrap();

        let mut shard_buf = [0u8; 4];
        server.read_exact(&mut shard_buf).unwrap();

        let (ring_a, _ring_b) = UnixStream::pair().unwrap();
        let ring_fd = ring_a.as_raw_fd();
        std::mem::forget(ring_a);
        send_fd(&server, ring_fd);

        server.write_all(&wire::encode_u32(block_index)).unwrap();
    }

    fn send_fd(stream: &UnixStream, fd: RawFd) {
        use std::mem;
        let mut data = [0u8];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr() as *mut libc::c_void,
            iov_len: data.len(),
        };
        let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len();
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
            std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
            libc::sendmsg(stream.as_raw_fd(), &msg, 0);
        }
    }

    fn listener_path() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testimony.sock");
        (dir, path)
    }

    #[test]
    fn get_block_returns_the_index_the_daemon_sent() {
        let (_dir, path) = listener_path();
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let geometry = RingGeometry {
            fanout_size: 1,
            block_size: 4096,
            block_count: 4,
        };

        let handle = thread::spawn(move || {
            let (server, _addr) = listener.accept().unwrap();
            fake_daemon(server, geometry, 2);
        });

        let mut client = Client::connect(&path, 0).unwrap();
        assert_eq!(client.geometry(), geometry);

        let block = client.get_block(1000).unwrap().expect("block was sent");
        assert_eq!(block.index(), 2);
        client.return_block(block).unwrap();

        handle.join().unwrap();
    }

    #[test]
    fn connect_reports_unsupported_version() {
        let (_dir, path) = listener_path();
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let handle = thread::spawn(move || {
            let (mut server, _addr) = listener.accept().unwrap();
            server.write_all(&[0xFF]).unwrap();
        });

        let err = Client::connect(&path, 0).unwrap_err();
        assert!(matches!(err, ClientErrorKind::UnsupportedVersion(0xFF)));

        handle.join().unwrap();
    }

    #[test]
    fn connect_rejects_shard_out_of_range() {
        let (_dir, path) = listener_path();
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let geometry = RingGeometry {
            fanout_size: 2,
            block_size: 4096,
            block_count: 4,
        };
        let handle = thread::spawn(move || {
            let (mut server, _addr) = listener.accept().unwrap();
            server.write_all(&[PROTOCOL_VERSION]).unwrap();
            server.write_all(&geometry.to_bytes()).unwrap();
        });

        let err = Client::connect(&path, 9).unwrap_err();
        assert!(matches!(err, ClientErrorKind::ShardOutOfRange(9)));

        handle.join().unwrap();
    }

    #[test]
    fn get_block_times_out_without_a_block() {
        let (_dir, path) = listener_path();
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let geometry = RingGeometry {
            fanout_size: 1,
            block_size: 4096,
            block_count: 4,
        };

        let handle = thread::spawn(move || {
            let (mut server, _addr) = listener.accept().unwrap();
            server.write_all(&[PROTOCOL_VERSION]).unwrap();
            server.write_all(&geometry.to_bytes()).unwrap();
            let mut shard_buf = [0u8; 4];
            server.read_exact(&mut shard_buf).unwrap();
            let (ring_a, _ring_b) = UnixStream::pair().unwrap();
            let ring_fd = ring_a.as_raw_fd();
            std::mem::forget(ring_a);
            send_fd(&server, ring_fd);
            thread::sleep(std::time::Duration::from_millis(200));
        });

        let mut client = Client::connect(&path, 0).unwrap();
        let block = client.get_block(50).unwrap();
        assert!(block.is_none(), "no block was sent within the timeout");

        handle.join().unwrap();
    }
}
