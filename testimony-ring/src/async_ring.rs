use std::io::Result;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::Poll;

use tokio::io::unix::AsyncFd;
use futures_lite::{ready, FutureExt};

use testimony_wire::PacketCursor;

use crate::ring::{open, BlockState, Ring, RingConfig};
use testimony_wire::RingResult;

/// Async counterpart to [`Ring`], used by the daemon's one-task-per-shard
/// polling loop (§5): awaits kernel retirement instead of blocking a
/// worker thread on `poll(2)`.
#[derive(Debug)]
pub struct AsyncRing {
    inner: Ring,
    waiter: AsyncWaiter,
}

impl AsyncRing {
    pub fn open(cfg: &RingConfig) -> RingResult<Self> {
        let inner = open(cfg)?;
        let fd = inner.as_raw_fd();
        let waiter =
            AsyncWaiter(AsyncFd::new(fd).map_err(testimony_wire::RingErrorKind::AsyncRegistration)?);
        Ok(Self { inner, waiter })
    }

    pub fn block_count(&self) -> u32 {
        self.inner.block_count()
    }

    pub fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    pub fn state(&self, idx: u32) -> BlockState {
        self.inner.state(idx)
    }

    pub fn assign_to_client(&mut self, idx: u32, session_id: u64, seq: u64) {
        self.inner.assign_to_client(idx, session_id, seq)
    }

    pub fn drop_to_kernel(&mut self, idx: u32) {
        self.inner.drop_to_kernel(idx)
    }

    pub fn return_from_client(&mut self, idx: u32, session_id: u64) -> bool {
        self.inner.return_from_client(idx, session_id)
    }

    pub fn block_bytes(&self, idx: u32) -> &[u8] {
        self.inner.block_bytes(idx)
    }

    pub fn packets(&self, idx: u32) -> PacketCursor<'_> {
        self.inner.packets(idx)
    }

    /// Waits for the kernel to retire the next ring-order block (§4.2),
    /// transitioning it `Kernel -> Daemon`, and returns its index.
    pub async fn recv_block(&mut self) -> Result<u32> {
        loop {
            if let Some(idx) = self.inner.poll_retired() {
                return Ok(idx);
            }
            (&mut self.waiter).await?;
        }
    }
}

impl AsRawFd for AsyncRing {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

#[derive(Debug)]
struct AsyncWaiter(AsyncFd<RawFd>);

impl futures_lite::Future for AsyncWaiter {
    type Output = Result<()>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.0;
        let mut guard = ready!(inner.poll_read_ready(cx))?;
        guard.clear_ready();
        Poll::Ready(Ok(()))
    }
}
