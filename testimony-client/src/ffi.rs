//! C ABI surface (§6.4), for non-Rust consumers of the reference client.
//! Mirrors the original `testimony.h`: an opaque handle per connection, an
//! opaque handle per packet iterator, and functions returning 0 on success
//! or a negative code from [`ClientErrorKind::code`] on failure. The last
//! error message for a handle is retrievable with [`testimony_error`].

use std::ffi::{c_char, c_int, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use testimony_wire::{ClientErrorKind, Packet};

use crate::client::{Block, Client};

/// Opaque connection handle, analogous to `testimony` in the original C API.
pub struct TestimonyHandle {
    client: Client,
    last_error: Option<CString>,
}

/// Opaque iterator handle, analogous to `testimony_iter`.
pub struct TestimonyIter {
    cursor: testimony_wire::PacketCursor<'static>,
}

fn set_error(handle: *mut TestimonyHandle, err: ClientErrorKind) -> c_int {
    let code = err.code();
    if !handle.is_null() {
        let msg = CString::new(err.to_string()).unwrap_or_else(|_| CString::new("").unwrap());
        unsafe {
            (*handle).last_error = Some(msg);
        }
    }
    code
}

/// Connects to `socket_path` and requests `shard`. On success, `*out`
/// receives a heap-allocated handle the caller owns until it passes it to
/// [`testimony_close`].
///
/// # Safety
/// `socket_path` must be a valid, NUL-terminated C string. `out` must be a
/// valid pointer to a location that can hold one `*mut TestimonyHandle`.
#[no_mangle]
pub unsafe extern "C" fn testimony_connect(
    socket_path: *const c_char,
    shard: u32,
    out: *mut *mut TestimonyHandle,
) -> c_int {
    if socket_path.is_null() || out.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    let path_bytes = std::ffi::CStr::from_ptr(socket_path).to_bytes();
    let path = Path::new(std::ffi::OsStr::from_bytes(path_bytes));

    match Client::connect(path, shard) {
        Ok(client) => {
            let handle = Box::new(TestimonyHandle {
                client,
                last_error: None,
            });
            *out = Box::into_raw(handle);
            0
        }
        Err(err) => {
            *out = ptr::null_mut();
            err.code()
        }
    }
}

/// Returns the fanout size negotiated for this connection.
///
/// # Safety
/// `handle` must be a live pointer returned by [`testimony_connect`].
#[no_mangle]
pub unsafe extern "C" fn testimony_fanout_size(handle: *const TestimonyHandle) -> i32 {
    if handle.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    (*handle).client.geometry().fanout_size as i32
}

/// Returns the configured block size in bytes.
///
/// # Safety
/// `handle` must be a live pointer returned by [`testimony_connect`].
#[no_mangle]
pub unsafe extern "C" fn testimony_block_size(handle: *const TestimonyHandle) -> i64 {
    if handle.is_null() {
        return ClientErrorKind::WrongState.code() as i64;
    }
    (*handle).client.geometry().block_size as i64
}

/// Returns the configured block count.
///
/// # Safety
/// `handle` must be a live pointer returned by [`testimony_connect`].
#[no_mangle]
pub unsafe extern "C" fn testimony_block_count(handle: *const TestimonyHandle) -> i64 {
    if handle.is_null() {
        return ClientErrorKind::WrongState.code() as i64;
    }
    (*handle).client.geometry().block_count as i64
}

/// Gets the next retired block, waiting up to `timeout_millis`
/// (negative blocks forever, zero polls). On success with a block ready,
/// `*block_out` is set to its base address and 0 is returned. If the
/// timeout elapses with nothing ready, `*block_out` is set to null and 0
/// is still returned, mirroring the original `testimony_get_block`.
///
/// # Safety
/// `handle` must be a live pointer; `block_out` must be a valid pointer to
/// a location that can hold one `*mut u8`.
#[no_mangle]
pub unsafe extern "C" fn testimony_get_block(
    handle: *mut TestimonyHandle,
    timeout_millis: c_int,
    block_out: *mut *mut u8,
) -> c_int {
    if handle.is_null() || block_out.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    match (*handle).client.get_block(timeout_millis) {
        Ok(Some(block)) => {
            *block_out = block.bytes().as_ptr() as *mut u8;
            0
        }
        Ok(None) => {
            *block_out = ptr::null_mut();
            0
        }
        Err(err) => set_error(handle, err),
    }
}

/// Returns a block previously handed out by [`testimony_get_block`].
///
/// # Safety
/// `handle` must be a live pointer; `block` must be a pointer this handle
/// previously returned via `testimony_get_block` and not yet returned.
#[no_mangle]
pub unsafe extern "C" fn testimony_return_block(
    handle: *mut TestimonyHandle,
    block: *mut u8,
) -> c_int {
    if handle.is_null() || block.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    let client = &mut (*handle).client;
    let block_size = client.geometry().block_size as usize;
    let bytes = std::slice::from_raw_parts(block as *const u8, block_size);
    let owned = Block::from_raw_parts(bytes);
    match client.return_block(owned) {
        Ok(()) => 0,
        Err(err) => set_error(handle, err),
    }
}

/// Returns the most recent error message recorded for `handle`, or an
/// empty string if none. The returned pointer is valid until the next
/// call that records a new error on this handle, or until the handle is
/// closed.
///
/// # Safety
/// `handle` must be a live pointer returned by [`testimony_connect`].
#[no_mangle]
pub unsafe extern "C" fn testimony_error(handle: *const TestimonyHandle) -> *const c_char {
    if handle.is_null() {
        return ptr::null();
    }
    match &(*handle).last_error {
        Some(msg) => msg.as_ptr(),
        None => ptr::null(),
    }
}

/// Closes a connection. `handle` must not be used after this call.
///
/// # Safety
/// `handle` must be a pointer returned by [`testimony_connect`] that has
/// not already been closed.
#[no_mangle]
pub unsafe extern "C" fn testimony_close(handle: *mut TestimonyHandle) -> c_int {
    if handle.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    drop(Box::from_raw(handle));
    0
}

/// Allocates a new packet iterator.
///
/// # Safety
/// `out` must be a valid pointer to a location that can hold one
/// `*mut TestimonyIter`.
#[no_mangle]
pub unsafe extern "C" fn testimony_iter_init(out: *mut *mut TestimonyIter) -> c_int {
    if out.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    let iter = Box::new(TestimonyIter {
        cursor: testimony_wire::PacketCursor::new(),
    });
    *out = Box::into_raw(iter);
    0
}

/// Resets `iter` to walk the packets of `block`, a pointer previously
/// handed out by [`testimony_get_block`].
///
/// # Safety
/// `iter` must be a live pointer from [`testimony_iter_init`]; `block`
/// must point to `block_size` valid bytes for at least the lifetime of
/// this iterator's subsequent use.
#[no_mangle]
pub unsafe extern "C" fn testimony_iter_reset(
    iter: *mut TestimonyIter,
    block: *const u8,
    block_size: usize,
) -> c_int {
    if iter.is_null() || block.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    let bytes: &'static [u8] = std::slice::from_raw_parts(block, block_size);
    match (*iter).cursor.reset(bytes) {
        Ok(()) => 0,
        Err(_) => ClientErrorKind::NotV3.code(),
    }
}

/// Returns the next packet header in the block, or null if exhausted.
///
/// # Safety
/// `iter` must be a live pointer previously reset onto a still-valid block.
#[no_mangle]
pub unsafe extern "C" fn testimony_iter_next(iter: *mut TestimonyIter) -> *const u8 {
    if iter.is_null() {
        return ptr::null();
    }
    match (*iter).cursor.next() {
        Some(packet) => packet_header_ptr(&packet),
        None => ptr::null(),
    }
}

fn packet_header_ptr(packet: &Packet<'_>) -> *const u8 {
    packet.header() as *const _ as *const u8
}

/// Frees an iterator. `iter` must not be used after this call.
///
/// # Safety
/// `iter` must be a pointer returned by [`testimony_iter_init`] that has
/// not already been closed.
#[no_mangle]
pub unsafe extern "C" fn testimony_iter_close(iter: *mut TestimonyIter) -> c_int {
    if iter.is_null() {
        return ClientErrorKind::WrongState.code();
    }
    drop(Box::from_raw(iter));
    0
}
