//! The Ring Provider (§4.1): opens and configures one `AF_PACKET`/tpacket-v3
//! RX ring per fanout shard, and tracks each block's ownership state as it
//! moves between the kernel, the daemon, and a connected client (§4.2).

pub mod ring;
pub mod socket;

#[cfg(feature = "async-tokio")]
pub mod async_ring;

pub use ring::{get_rx_statistics, open, BlockState, Ring, RingConfig};
pub use socket::{FilterInstruction, FilterProgram, Socket};

#[cfg(feature = "async-tokio")]
pub use async_ring::AsyncRing;
