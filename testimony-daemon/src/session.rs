//! Client Session (§4.4): the wire-protocol state machine terminating one
//! accepted connection. States `AWAIT_VERSION_ACK -> AWAIT_SHARD ->
//! AWAIT_FD_ACK -> STREAMING -> CLOSED` are implicit in the control flow
//! below rather than an explicit enum, mirroring how short-lived the
//! earlier states are (each is exactly one wire exchange).

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use testimony_wire::{ProtocolErrorKind, ProtocolResult, PROTOCOL_VERSION};

use crate::fanout::ShardGroup;
use crate::fdpass;

pub struct Session<G: ShardGroup> {
    stream: UnixStream,
    group: Arc<G>,
    session_id: u64,
    blocks_rx: Option<mpsc::Receiver<u32>>,
}

impl<G: ShardGroup> Session<G> {
    pub fn new(stream: UnixStream, group: Arc<G>, session_id: u64) -> Session<G> {
        Session {
            stream,
            group,
            session_id,
            blocks_rx: None,
        }
    }

    /// Drives the Session to completion. Every exit path, including
    /// protocol errors, goes through a single `unregister` so outstanding
    /// blocks are always reclaimed (§4.2, §8's accounting invariant).
    pub async fn run(mut self) {
        let shard = match self.negotiate().await {
            Ok(shard) => shard,
            Err(err) => {
                warn!(session_id = self.session_id, error = %err, "session negotiation failed");
                return;
            }
        };

        let outcome = self.stream_blocks(shard).await;
        self.group.unregister(shard, self.session_id).await;
        if let Err(err) = outcome {
            info!(session_id = self.session_id, shard, error = %err, "session closed");
        }
    }

    /// Steps 1-4 of §6.1.
    async fn negotiate(&mut self) -> ProtocolResult<u32> {
        self.stream.write_u8(PROTOCOL_VERSION).await?;

        let geometry = self.group.geometry();
        self.stream.write_all(&geometry.to_bytes()).await?;

        let shard = self.stream.read_u32().await?;
        if shard >= geometry.fanout_size {
            return Err(ProtocolErrorKind::ShardOutOfRange {
                index: shard,
                fanout_size: geometry.fanout_size,
            });
        }

        let (blocks_tx, blocks_rx) = mpsc::channel(geometry.block_count.max(1) as usize);
        if !self.group.register(shard, self.session_id, blocks_tx).await {
            return Err(ProtocolErrorKind::ShardAlreadyTaken(shard));
        }

        let fd = self
            .group
            .shard_fd(shard)
            .expect("shard index was just validated against fanout_size");
        fdpass::send_fd(&self.stream, fd, testimony_wire::FD_HANDOFF_BYTE)
            .await
            .map_err(ProtocolErrorKind::FdPassing)?;

        self.blocks_rx = Some(blocks_rx);
        Ok(shard)
    }

    /// Steady-state loop (§4.4 step 5): forward each retired block to the
    /// client, require the matching echo before moving on.
    async fn stream_blocks(&mut self, shard: u32) -> ProtocolResult<()> {
        let mut blocks_rx = self
            .blocks_rx
            .take()
            .expect("negotiate() populates blocks_rx before returning Ok");

        loop {
            let idx = match blocks_rx.recv().await {
                Some(idx) => idx,
                None => return Ok(()),
            };

            self.stream.write_u32(idx).await?;
            let echoed = self.stream.read_u32().await?;
            if echoed != idx {
                return Err(ProtocolErrorKind::MalformedFrame(format!(
                    "expected ack for block {idx}, client echoed {echoed}"
                )));
            }
            if !self.group.return_block(shard, self.session_id, echoed).await {
                return Err(ProtocolErrorKind::BlockNotOwned(echoed));
            }
        }
    }
}
