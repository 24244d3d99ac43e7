use std::io;

use thiserror::Error;

use crate::data::DataType;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("type {data_type:?} is not supported by protocol version {version}")]
    UnsupportedTypeForVersion { data_type: DataType, version: u32 },
    #[error("payload of type {0:?} has no flat wire layout")]
    UnsupportedPayload(DataType),
    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: i32 },
    #[error("{what} of {count} elements exceeds the limit of {limit}")]
    AllocationTooLarge {
        what: &'static str,
        count: u64,
        limit: u64,
    },
    #[error("failed to allocate {0} elements")]
    AllocationFailed(usize),
    #[error("protocol version {version} carries exactly one {what}, got {count}")]
    BatchNotSupported {
        what: &'static str,
        count: usize,
        version: u32,
    },
    #[error("server version changed from {expected} to {found}, the server may have restarted")]
    ServerVersionChanged { expected: u32, found: u32 },
    #[error("{what} holds {found} elements, header declares {declared}")]
    LengthMismatch {
        what: &'static str,
        declared: usize,
        found: usize,
    },
    #[error("invalid payload: {0}")]
    Invalid(String),
}

impl ProtocolError {
    /// True for failures of the underlying socket rather than of message content.
    pub fn is_io(&self) -> bool {
        match self {
            ProtocolError::Io(_) => true,
            ProtocolError::Serialize(bincode::error::EncodeError::Io { .. }) => true,
            ProtocolError::Deserialize(bincode::error::DecodeError::Io { .. }) => true,
            _ => false,
        }
    }

    /// True when only the message in flight is lost and the stream stays in step.
    pub fn is_message_level(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnsupportedTypeForVersion { .. } | ProtocolError::UnsupportedPayload(_)
        )
    }

    /// OS error number, when the failure came from the socket.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ProtocolError::Io(e) => e.raw_os_error(),
            ProtocolError::Serialize(bincode::error::EncodeError::Io { inner, .. }) => {
                inner.raw_os_error()
            }
            ProtocolError::Deserialize(bincode::error::DecodeError::Io { inner, .. }) => {
                inner.raw_os_error()
            }
            _ => None,
        }
    }
}
