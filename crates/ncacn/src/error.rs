use bytes::Bytes;
use thiserror::Error;

/// Result type for RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

/// DCE fault status: unspecified failure.
pub const FAULT_OTHER: u32 = 0x0000_0001;
/// DCE fault status: caller was denied access.
pub const FAULT_ACCESS_DENIED: u32 = 0x0000_0005;
/// DCE fault status: server cannot perform the call.
pub const FAULT_CANT_PERFORM: u32 = 0x0000_06d8;
/// DCE fault status: stub data could not be parsed.
pub const FAULT_NDR: u32 = 0x0000_06f7;
/// DCE fault status: operation number out of range.
pub const FAULT_OP_RNG_ERROR: u32 = 0x1c01_0002;
/// DCE fault status: unknown interface.
pub const FAULT_UNK_IF: u32 = 0x1c01_0003;
/// DCE fault status: protocol error.
pub const FAULT_PROTO_ERROR: u32 = 0x1c01_000b;
/// DCE fault status: call was cancelled.
pub const FAULT_CALL_CANCELLED: u32 = 0x1c00_000d;
/// DCE fault status: presentation context mismatch.
pub const FAULT_CONTEXT_MISMATCH: u32 = 0x1c00_001a;

/// Human-readable name for a DCE fault status code.
pub fn fault_string(code: u32) -> &'static str {
    match code {
        FAULT_OTHER => "unspecified fault",
        FAULT_ACCESS_DENIED => "access denied",
        FAULT_CANT_PERFORM => "cannot perform operation",
        FAULT_NDR => "bad stub data",
        FAULT_OP_RNG_ERROR => "operation number out of range",
        FAULT_UNK_IF => "unknown interface",
        FAULT_PROTO_ERROR => "protocol error",
        FAULT_CALL_CANCELLED => "call cancelled",
        FAULT_CONTEXT_MISMATCH => "presentation context mismatch",
        _ => "unknown fault code",
    }
}

/// Errors that can occur during RPC operations
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unsupported RPC version: {major}.{minor}")]
    RpcVersionMismatch { major: u8, minor: u8 },

    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("PDU too large: {size} bytes (max {max})")]
    PduTooLarge { size: usize, max: usize },

    #[error("Auth trailer too long: {auth_length} credential bytes in a {frag_length} byte fragment")]
    AuthTrailerTooLong { auth_length: usize, frag_length: usize },

    #[error("Transfer syntax not supported by server")]
    UnsupportedTransferSyntax,

    #[error("Bind rejected by server: reason {0}")]
    Rejected(u16),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(&'static str),

    #[error("fault 0x{:08x} ({})", .0, fault_string(*.0))]
    Fault(u32),

    #[error("Access denied")]
    AccessDenied,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Marshalling validation failed ({context}): {} bytes pushed, {} bytes after round trip", original.len(), replayed.len())]
    ValidationFailed {
        context: &'static str,
        original: Bytes,
        replayed: Bytes,
    },

    #[error("Reply carried {0} undrained bytes")]
    TrailingBytes(usize),

    #[error("Interface already registered: {0}")]
    AlreadyRegistered(&'static str),
}

impl RpcError {
    /// Fault status carried by this error, if it maps onto one.
    pub fn fault_code(&self) -> Option<u32> {
        match self {
            RpcError::Fault(code) => Some(*code),
            RpcError::AccessDenied => Some(FAULT_ACCESS_DENIED),
            RpcError::Cancelled => Some(FAULT_CALL_CANCELLED),
            _ => None,
        }
    }
}

/// Clones an error well enough to hand one copy to every waiter.
///
/// `std::io::Error` is not `Clone`, so transport failures are rebuilt from
/// their kind and message.
pub(crate) fn dup_error(err: &RpcError) -> RpcError {
    match err {
        RpcError::Io(e) => RpcError::Io(std::io::Error::new(e.kind(), e.to_string())),
        RpcError::ConnectionClosed => RpcError::ConnectionClosed,
        RpcError::PduTooLarge { size, max } => RpcError::PduTooLarge {
            size: *size,
            max: *max,
        },
        RpcError::InvalidPdu(msg) => RpcError::InvalidPdu(msg.clone()),
        RpcError::Fault(code) => RpcError::Fault(*code),
        RpcError::AccessDenied => RpcError::AccessDenied,
        RpcError::Cancelled => RpcError::Cancelled,
        _ => RpcError::ConnectionClosed,
    }
}
