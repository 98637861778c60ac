//! Error taxonomy (§7). Kinds, not layers of wrapping: every variant here
//! carries the local-recovery policy in its doc comment so call sites don't
//! have to re-derive it.

use thiserror::Error;

/// L0 frame codec failures. Always recovered by dropping the datagram and
/// incrementing a counter; never propagated past the receive loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {len} bytes, header needs {min}")]
    TooShort { len: usize, min: usize },
    #[error("frameTotalLength {declared} below minimum header size {min}")]
    LengthBelowHeader { declared: u32, min: u32 },
    #[error("frameTotalLength {declared} does not match buffer length {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("sequence {sequence} out of range for total {total}")]
    SequenceOutOfRange { sequence: u32, total: u32 },
    #[error("unknown frame type byte {0}")]
    UnknownFrameType(u8),
    #[error("ack frame must have total=1, sequence=0")]
    MalformedAck,
}

/// L1 reassembly / retransmit failures.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("global timeout expired for dataId {0}")]
    TimedOut(u64),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// L2 flow/congestion failures. Surfaced to the caller only; never close
/// the connection by themselves.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlowError {
    #[error("permit acquisition timed out before a send slot was available")]
    Backpressured,
    #[error("frame pool or global flow cap exhausted")]
    ResourceExhausted,
}

/// L3 connection manager failures.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("handshake rejected: {0}")]
    HandshakeRejected(&'static str),
    #[error("peer unreachable: retransmit budget exhausted")]
    PeerUnreachable,
    #[error("no connection for id {0}")]
    NotFound(u64),
    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// L4 envelope / dispatch failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("senderId must be 32 bytes, got {0}")]
    BadSenderId(usize),
    #[error("messageId must be 16 bytes, got {0}")]
    BadMessageId(usize),
    #[error("requestId must be 16 bytes, got {0}")]
    BadRequestId(usize),
    #[error("version must be >= 1, got {0}")]
    BadVersion(u16),
    #[error("declared length {declared} does not match payload length {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("unknown protocol code {0}")]
    UnknownProtocol(u32),
    #[error("encode/decode failure: {0}")]
    Codec(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for protocol code {0}")]
    NoHandler(u32),
    #[error("protocol {0} declares a response but a void handler was registered")]
    HandlerKindMismatch(u32),
    #[error("request {0:x?} timed out before a response arrived")]
    RequestTimeout([u8; 16]),
    #[error("result handler for protocol {0} returned an empty response")]
    EmptyResponse(u32),
}

/// Crate-wide error used at the few call sites (the event loop in
/// [`crate::node`]) that need one `Result` type across layers. Nothing in
/// this taxonomy is process-fatal; the event loop logs and continues.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    Flow(#[from] FlowError),
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
