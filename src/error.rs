//! Core error taxonomy.
//!
//! `NetError` groups every failure the core can report into the six kinds
//! the design distinguishes; each kind carries a finer-grained `Reason` for
//! logging without multiplying the match surface user-facing call sites see.

use core::fmt;

/// Fine-grained cause, carried inside a [`NetError`] for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    ShortFrame,
    BadChecksum,
    BadHeader,
    UnknownOption,
    WrongMagic,
    NoFreeSlot,
    NoBuffer,
    NoEphemeralPort,
    NoRoute,
    AddressInUse,
    NotBound,
    NotConnected,
    ArpTimeout,
    DnsTimeout,
    DhcpTimeout,
    ConnectTimeout,
    RecvTimeout,
    PeerRst,
    BadAck,
    UnexpectedFlags,
    FeaturesRejected,
    InvalidUsedId,
    Stopping,
}

/// The six error kinds the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Malformed header, short frame, bad checksum, unknown option. Never
    /// escapes the receive path; only observed via counters/logs.
    BadPacket(Reason),
    /// No free slot, no buffer, no ephemeral port.
    Resource(Reason),
    /// Per-operation deadline elapsed.
    Timeout(Reason),
    /// RST observed on the connection.
    PeerReset,
    /// Bad ACK in SynSent, unexpected flags outside an established flow.
    Protocol(Reason),
    /// The calling task's `stopping` flag was observed at a sleep point.
    Cancelled,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::BadPacket(r) => write!(f, "bad packet: {:?}", r),
            NetError::Resource(r) => write!(f, "resource exhausted: {:?}", r),
            NetError::Timeout(r) => write!(f, "timeout: {:?}", r),
            NetError::PeerReset => write!(f, "connection reset by peer"),
            NetError::Protocol(r) => write!(f, "protocol error: {:?}", r),
            NetError::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
