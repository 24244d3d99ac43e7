use thiserror::Error;

use crate::{
    connection::ConnectionError,
    data::{
        CLIENT_LOGIC_ERROR, ErrorRecord, ErrorType, INVALID_HANDLE, NO_SOCKET_CONNECTION,
        PROTOCOL_ERROR, RequestError,
    },
    protocol::{ProtocolError, VERSION_OS_NAME},
};

use super::PropertyError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },
    #[error("invalid request: {0}")]
    Request(#[from] RequestError),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error("no data block for handle {0}")]
    InvalidHandle(usize),
    #[error("no socket is open")]
    NotConnected,
    #[error("writing data needs protocol version {min}, this connection uses {version}", min = VERSION_OS_NAME)]
    PutNotSupported { version: u32 },
    #[error("expected {expected}, received {found}")]
    UnexpectedMessage {
        expected: &'static str,
        found: String,
    },
}

impl ClientError {
    /// Negative status reported to the caller.
    pub fn code(&self) -> i32 {
        match self {
            ClientError::Connection(e) => e.raw_os_error().map_or(NO_SOCKET_CONNECTION, |c| -c),
            ClientError::NotConnected => NO_SOCKET_CONNECTION,
            ClientError::Protocol(e) => e.raw_os_error().map_or(PROTOCOL_ERROR, |c| -c),
            ClientError::UnexpectedMessage { .. } | ClientError::PutNotSupported { .. } => {
                PROTOCOL_ERROR
            }
            ClientError::Server { code, .. } if *code < 0 => *code,
            ClientError::Server { code, .. } => -code.abs().max(1),
            ClientError::Request(_) | ClientError::Property(_) => CLIENT_LOGIC_ERROR,
            ClientError::InvalidHandle(_) => INVALID_HANDLE,
        }
    }

    /// Socket-level and framing failures leave the stream in an unknown position.
    ///
    /// A type the negotiated version cannot carry only loses the message in flight.
    pub fn closes_connection(&self) -> bool {
        match self {
            ClientError::Protocol(e) => !e.is_message_level(),
            ClientError::Connection(_)
            | ClientError::NotConnected
            | ClientError::UnexpectedMessage { .. } => true,
            _ => false,
        }
    }

    /// Record for the error stack; server errors are already there.
    pub fn to_record(&self, location: &str) -> Option<ErrorRecord> {
        let (error_type, code) = match self {
            ClientError::Server { .. } => return None,
            ClientError::Connection(e) => (
                ErrorType::System,
                e.raw_os_error().unwrap_or(NO_SOCKET_CONNECTION),
            ),
            ClientError::Protocol(e) if e.is_io() => (
                ErrorType::System,
                e.raw_os_error().unwrap_or(PROTOCOL_ERROR),
            ),
            ClientError::NotConnected => (ErrorType::System, NO_SOCKET_CONNECTION),
            ClientError::Protocol(_)
            | ClientError::UnexpectedMessage { .. }
            | ClientError::PutNotSupported { .. } => (ErrorType::Protocol, PROTOCOL_ERROR),
            _ => (ErrorType::Client, self.code()),
        };
        Some(ErrorRecord::new(error_type, code, location, self.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::data::DataType;

    #[test]
    fn codes_are_negative() {
        let server = ClientError::Server {
            code: 7,
            message: "no such signal".to_string(),
        };
        assert_eq!(server.code(), -7);
        assert!(server.to_record("get").is_none());
        assert!(!server.closes_connection());

        let refused = ClientError::Protocol(ProtocolError::Io(io::Error::from_raw_os_error(111)));
        assert_eq!(refused.code(), -111);
        assert!(refused.closes_connection());
        let record = refused.to_record("get").unwrap();
        assert_eq!(record.error_type, ErrorType::System);
        assert_eq!(record.code, 111);

        let framing = ClientError::Protocol(ProtocolError::Invalid("bad".to_string()));
        assert_eq!(framing.code(), PROTOCOL_ERROR);
        assert_eq!(
            framing.to_record("get").unwrap().error_type,
            ErrorType::Protocol
        );

        assert_eq!(ClientError::InvalidHandle(4).code(), INVALID_HANDLE);
    }

    #[test]
    fn version_rejections_keep_the_socket() {
        let unsupported = ClientError::Protocol(ProtocolError::UnsupportedTypeForVersion {
            data_type: DataType::UnsignedShort,
            version: 2,
        });
        assert!(!unsupported.closes_connection());
        assert_eq!(unsupported.code(), PROTOCOL_ERROR);

        let payload = ClientError::Protocol(ProtocolError::UnsupportedPayload(DataType::Compound));
        assert!(!payload.closes_connection());

        let put = ClientError::PutNotSupported { version: 6 };
        assert!(!put.closes_connection());
        assert_eq!(put.to_record("put").unwrap().error_type, ErrorType::Protocol);

        let changed = ClientError::Protocol(ProtocolError::ServerVersionChanged {
            expected: 8,
            found: 9,
        });
        assert!(changed.closes_connection());
        assert!(ClientError::NotConnected.closes_connection());
    }
}
