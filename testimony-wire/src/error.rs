use thiserror::Error;

/// Categorized failures from [`crate`]'s Ring Provider `open()`, per §4.1/§7.
///
/// A `Configuration` failure is fatal for the affected socket path at
/// startup; a `Resource` failure may leave the daemon running in a
/// degraded state (other fanout groups keep serving).
#[derive(Debug, Error)]
pub enum RingErrorKind {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unknown interface: {0}")]
    InterfaceUnknown(String),

    #[error("unsupported fanout kind: {0}")]
    UnsupportedFanoutKind(String),

    #[error("failed to create capture socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    #[error("failed to set tpacket version: {0}")]
    VersionSet(#[source] std::io::Error),

    #[error("failed to attach packet filter: {0}")]
    FilterAttach(#[source] std::io::Error),

    #[error("host kernel cannot lock the attached filter")]
    FilterLockUnavailable,

    #[error("failed to request RX ring: {0}")]
    RingRequest(#[source] std::io::Error),

    #[error("failed to mmap ring: {0}")]
    Mmap(#[source] std::io::Error),

    #[error("failed to bind to interface: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to join fanout group: {0}")]
    FanoutJoin(#[source] std::io::Error),

    #[error("failed to register ring fd with the async reactor: {0}")]
    AsyncRegistration(#[source] std::io::Error),
}

pub type RingResult<T> = Result<T, RingErrorKind>;

/// Per-session protocol failures, per §4.4/§7. Fatal for the one Session;
/// the daemon process and its other Sessions are unaffected.
#[derive(Debug, Error)]
pub enum ProtocolErrorKind {
    #[error("unsupported protocol version {0:#x}")]
    UnsupportedVersion(u8),

    #[error("shard index {index} out of range (fanout size {fanout_size})")]
    ShardOutOfRange { index: u32, fanout_size: u32 },

    #[error("shard {0} already has a registered session")]
    ShardAlreadyTaken(u32),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("block index {index} out of range (block count {block_count})")]
    UnknownBlockIndex { index: u32, block_count: u32 },

    #[error("returned block {0} is not owned by this session")]
    BlockNotOwned(u32),

    #[error("fd-passing failed: {0}")]
    FdPassing(#[source] std::io::Error),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolErrorKind>;

/// Error taxonomy surfaced by `testimony-client`, mapped to the negative
/// integer convention of §6.4 (`ffi::error_code`).
#[derive(Debug, Error)]
pub enum ClientErrorKind {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("unsupported protocol version advertised by daemon: {0:#x}")]
    UnsupportedVersion(u8),

    #[error("shard index {0} out of range")]
    ShardOutOfRange(u32),

    #[error("connection closed by daemon")]
    ConnectionClosed,

    #[error("fd-passing failed: {0}")]
    FdPassing(#[source] std::io::Error),

    #[error("mmap failed: {0}")]
    Mmap(#[source] std::io::Error),

    #[error("block pointer is not a block-aligned address within the mapping")]
    BlockPointerInvalid,

    #[error("daemon handed back block index {0}, outside the negotiated mapping")]
    UnknownBlockIndex(u32),

    #[error("block is not tpacket-v3")]
    NotV3,

    #[error("protocol/io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("operation attempted on a handle in the wrong state")]
    WrongState,
}

pub type ClientResult<T> = Result<T, ClientErrorKind>;

impl ClientErrorKind {
    /// Negative conventional error code for the §6.4 C ABI; 0 is reserved
    /// for success and never produced here.
    pub fn code(&self) -> i32 {
        match self {
            ClientErrorKind::Connect(_) => -1,
            ClientErrorKind::UnsupportedVersion(_) => -2,
            ClientErrorKind::ShardOutOfRange(_) => -3,
            ClientErrorKind::ConnectionClosed => -4,
            ClientErrorKind::FdPassing(_) => -5,
            ClientErrorKind::Mmap(_) => -6,
            ClientErrorKind::BlockPointerInvalid => -7,
            ClientErrorKind::NotV3 => -8,
            ClientErrorKind::Io(_) => -9,
            ClientErrorKind::WrongState => -10,
            ClientErrorKind::UnknownBlockIndex(_) => -11,
        }
    }
}
