//! Shared, dependency-light pieces of Testimony: the kernel's tpacket-v3
//! struct layouts, the control-protocol's wire framing, the packet
//! iterator, and the error taxonomies both the daemon and the client
//! library report through.

pub mod error;
pub mod iter;
pub mod tpacket3;
pub mod wire;

pub use error::{ClientErrorKind, ClientResult, ProtocolErrorKind, ProtocolResult, RingErrorKind, RingResult};
pub use iter::{NotV3, Packet, PacketCursor};
pub use wire::{RingGeometry, FD_HANDOFF_BYTE, PROTOCOL_VERSION};
