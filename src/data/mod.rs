//! Data model shared by the wire codec, the connection layer and the client.
//!
//! # Key Components
//!
//! - [`DataType`] / [`Values`]: element type tags and owned typed arrays.
//! - [`DataBlock`] / [`Dim`]: a result and its axes.
//! - [`RequestData`]: one signal and source request.
//! - [`ClientBlock`] / [`ServerBlock`]: negotiation state.
//! - [`ErrorStack`]: errors gathered during a request.
mod blocks;
mod error;
mod request;
mod state;
mod types;

pub use blocks::{
    Compression, DataBlock, DataObject, DataSource, DataSystem, Dim, MetaData, PutDataBlock,
    Signal, SignalDesc, SystemConfig,
};
pub use error::{
    CLIENT_LOGIC_ERROR, DATA_STATUS_BAD, DEFAULT_STATUS, ErrorRecord, ErrorStack, ErrorType,
    INVALID_HANDLE, MIN_STATUS, NO_SOCKET_CONNECTION, PROTOCOL_ERROR,
};
pub use request::{
    DEFAULT_DELIMITER, MAX_SIGNAL_LENGTH, MAX_SOURCE_LENGTH, NameValue, RequestData,
    RequestDefaults, RequestError, RequestKind,
};
pub use state::{
    CLIENT_PROTOCOL_VERSION, ClientBlock, ClientFlags, DEFAULT_TIMEOUT, PrivateFlags, Properties,
    ServerBlock,
};
pub use types::{Complex32, Complex64, DataType, OpaqueType, Values};

pub(crate) use types::with_values;
