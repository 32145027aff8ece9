//! `SCM_RIGHTS` ancillary fd hand-off (§4.4 step 4, §6.1 step 6).
//!
//! The control protocol's fd passing can't be expressed through generic
//! stream I/O (§9); it needs the platform's raw ancillary-data API. This
//! mirrors the `sendmsg`/`cmsg` construction used to hand PTY fds between
//! processes over a Unix socket, adapted to drive the syscall from a
//! tokio-owned fd via readiness polling instead of a blocking call.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use libc::{c_void, cmsghdr, iovec, msghdr};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Sends `fd` as an `SCM_RIGHTS` ancillary message alongside one data
/// byte, as the OS requires for fd passing to be observable at all.
pub async fn send_fd(stream: &UnixStream, fd: RawFd, byte: u8) -> io::Result<()> {
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || send_fd_once(stream, fd, byte)) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn send_fd_once(stream: &UnixStream, fd: RawFd, byte: u8) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut data = [byte];
    let mut iov = iovec {
        iov_base: data.as_mut_ptr() as *mut c_void,
        iov_len: data.len(),
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_buf.len();

    unsafe {
        let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::write(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }

    let res = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receives one fd passed via [`send_fd`]. Exists for `testimony-daemon`'s
/// own tests and its integration tests; the reference client library
/// receives fds over a blocking socket instead (see `testimony-client`).
pub async fn recv_fd(stream: &UnixStream) -> io::Result<RawFd> {
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || recv_fd_once(stream)) {
            Ok(fd) => return Ok(fd),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn recv_fd_once(stream: &UnixStream) -> io::Result<RawFd> {
    use std::os::unix::io::AsRawFd;

    let mut data = [0u8];
    let mut iov = iovec {
        iov_base: data.as_mut_ptr() as *mut c_void,
        iov_len: data.len(),
    };

    let cmsg_space = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = cmsg_buf.len();

    let res = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, 0) };
    if res == -1 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::other("no SCM_RIGHTS ancillary data in message"));
        }
        Ok(std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream as StdUnixStream;

    #[tokio::test]
    async fn fd_survives_the_round_trip() {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        let a = UnixStream::from_std(a).unwrap();
        let b = UnixStream::from_std(b).unwrap();

        let passed = StdUnixStream::pair().unwrap().0;
        let passed_fd = passed.as_raw_fd();

        send_fd(&a, passed_fd, 0x00).await.unwrap();
        let received = recv_fd(&b).await.unwrap();
        assert_ne!(received, passed_fd, "recvmsg must hand back a distinct duplicate fd");

        unsafe {
            libc::close(received);
        }
    }
}
