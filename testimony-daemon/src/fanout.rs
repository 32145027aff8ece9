//! Fanout Group & Block Ownership (§4.2).
//!
//! Each shard runs its own task owning one [`AsyncRing`]; the Fanout Group
//! itself is just a thin handle holding one command channel per shard.
//! Sessions never touch ring state directly, only message-pass through the
//! shard task that owns it (§5, §9).

use std::os::unix::io::RawFd;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use testimony_ring::{AsyncRing, BlockState};
use testimony_wire::{RingGeometry, RingResult};

use crate::config::SocketConfig;

enum ShardCommand {
    Register {
        session_id: u64,
        blocks: mpsc::Sender<u32>,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        session_id: u64,
    },
    ReturnBlock {
        session_id: u64,
        index: u32,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Clone)]
struct ShardHandle {
    commands: mpsc::Sender<ShardCommand>,
}

/// The Session-facing surface of a Fanout Group: negotiate a shard,
/// release it, return a block. Kept as a trait so [`crate::session::Session`]
/// can be driven in tests against a fake group with no real capture ring
/// (see `tests/protocol.rs`).
pub trait ShardGroup: Send + Sync + 'static {
    fn geometry(&self) -> RingGeometry;
    fn shard_fd(&self, shard: u32) -> Option<RawFd>;
    fn register(
        &self,
        shard: u32,
        session_id: u64,
        blocks: mpsc::Sender<u32>,
    ) -> impl std::future::Future<Output = bool> + Send;
    fn unregister(&self, shard: u32, session_id: u64) -> impl std::future::Future<Output = ()> + Send;
    fn return_block(
        &self,
        shard: u32,
        session_id: u64,
        index: u32,
    ) -> impl std::future::Future<Output = bool> + Send;
}

/// One Fanout Group: all shards of one configured socket path, keyed
/// implicitly by (interface, fanout id) through the [`SocketConfig`] it
/// was opened from.
pub struct FanoutGroup {
    shards: Vec<ShardHandle>,
    shard_fds: Vec<RawFd>,
    geometry: RingGeometry,
}

impl FanoutGroup {
    pub fn open(cfg: &SocketConfig) -> RingResult<FanoutGroup> {
        let mut shards = Vec::with_capacity(cfg.fanout_size as usize);
        let mut shard_fds = Vec::with_capacity(cfg.fanout_size as usize);

        for _ in 0..cfg.fanout_size {
            let ring_cfg = cfg.ring_config(cfg.fanout_id)?;
            let ring = AsyncRing::open(&ring_cfg)?;
            shard_fds.push(std::os::unix::io::AsRawFd::as_raw_fd(&ring));

            let (tx, rx) = mpsc::channel(32);
            tokio::spawn(run_shard(ring, rx));
            shards.push(ShardHandle { commands: tx });
        }

        Ok(FanoutGroup {
            shards,
            shard_fds,
            geometry: cfg.geometry(),
        })
    }
}

impl ShardGroup for FanoutGroup {
    fn geometry(&self) -> RingGeometry {
        self.geometry
    }

    fn shard_fd(&self, shard: u32) -> Option<RawFd> {
        self.shard_fds.get(shard as usize).copied()
    }

    /// Attempts to register `session_id` on `shard`. Fails (returns
    /// `false`) if another Session already holds it (§4.2 single-reader
    /// invariant, §8 scenario 4).
    async fn register(&self, shard: u32, session_id: u64, blocks: mpsc::Sender<u32>) -> bool {
        let Some(handle) = self.shards.get(shard as usize) else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle
            .commands
            .send(ShardCommand::Register {
                session_id,
                blocks,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Releases `session_id`'s registration and reclaims any blocks it
    /// still held (§4.2, §8 scenario 5).
    async fn unregister(&self, shard: u32, session_id: u64) {
        if let Some(handle) = self.shards.get(shard as usize) {
            let _ = handle
                .commands
                .send(ShardCommand::Unregister { session_id })
                .await;
        }
    }

    /// Returns block `index`, failing if `session_id` doesn't currently
    /// own it (§4.4 step 6, §8 "bad return index").
    async fn return_block(&self, shard: u32, session_id: u64, index: u32) -> bool {
        let Some(handle) = self.shards.get(shard as usize) else {
            return false;
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle
            .commands
            .send(ShardCommand::ReturnBlock {
                session_id,
                index,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}

/// One shard's lifetime: poll the ring for retirements, dispatch to the
/// registered Session if any, otherwise drop straight back to KERNEL
/// (§4.2's "drop path under absence of consumers").
async fn run_shard(mut ring: AsyncRing, mut commands: mpsc::Receiver<ShardCommand>) {
    let mut registration: Option<(u64, mpsc::Sender<u32>)> = None;
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            retired = ring.recv_block() => {
                let idx = match retired {
                    Ok(idx) => idx,
                    Err(err) => {
                        warn!(error = %err, "capture socket error, shard task exiting");
                        break;
                    }
                };
                match &registration {
                    Some((session_id, tx)) => {
                        seq += 1;
                        ring.assign_to_client(idx, *session_id, seq);
                        if tx.send(idx).await.is_err() {
                            debug!(block = idx, "session dropped its receiver, reclaiming block");
                            ring.return_from_client(idx, *session_id);
                            registration = None;
                        }
                    }
                    None => ring.drop_to_kernel(idx),
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(ShardCommand::Register { session_id, blocks, reply }) => {
                        let ok = registration.is_none();
                        if ok {
                            registration = Some((session_id, blocks));
                        }
                        let _ = reply.send(ok);
                    }
                    Some(ShardCommand::Unregister { session_id }) => {
                        if matches!(&registration, Some((id, _)) if *id == session_id) {
                            registration = None;
                        }
                        reclaim_session_blocks(&mut ring, session_id);
                    }
                    Some(ShardCommand::ReturnBlock { session_id, index, reply }) => {
                        let ok = index < ring.block_count() && ring.return_from_client(index, session_id);
                        let _ = reply.send(ok);
                    }
                    None => {
                        info!("shard command channel closed, exiting");
                        break;
                    }
                }
            }
        }
    }
}

/// Returns every block still owned by `session_id` to KERNEL, in
/// ascending ring order (§4.2, §8 scenario 5).
fn reclaim_session_blocks(ring: &mut AsyncRing, session_id: u64) {
    for idx in 0..ring.block_count() {
        if let BlockState::Client { session_id: owner, .. } = ring.state(idx) {
            if owner == session_id {
                ring.drop_to_kernel(idx);
            }
        }
    }
}
