//! Blocking `SCM_RIGHTS` fd receive, mirroring the daemon's async version
//! in `testimony-daemon::fdpass` but over a plain blocking socket, since a
//! reference client has no reactor of its own to register with.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use libc::{c_void, cmsghdr, iovec, msghdr};

/// Receives the capture ring fd handed over alongside the one-byte
/// `FD_HANDOFF_BYTE` payload (§6.1 step 6).
pub fn recv_fd(stream: &UnixStream) -> io::Result<RawFd> {
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
    if res == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed connection before passing fd"));
    }

    unsafe {
        let cmsg: *mut cmsghdr = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() || (*cmsg).cmsg_type != libc::SCM_RIGHTS {
            return Err(io::Error::other("no SCM_RIGHTS ancillary data in message"));
        }
        Ok(std::ptr::read(libc::CMSG_DATA(cmsg) as *const RawFd))
    }
}
