//! Client-server communication protocol.
//!
//! This module defines how requests, negotiation state and results are laid out on the
//! wire, and the transport that moves them over a socket.
//!
//! # Overview
//!
//! A connection carries a sequence of records. The client writes one record per request
//! (its [`ClientBlock`](crate::data::ClientBlock), the request list and any data to put)
//! and the server answers with one record (a [`ServerBlock`](crate::data::ServerBlock),
//! optional metadata, the data block list and any structured payloads).
//!
//! Every field is encoded big-endian and fixed width. Which fields are present depends on
//! the protocol version agreed during the handshake, so the same structure may be written
//! differently on two connections.
//!
//! # Key Components
//!
//! - [`Message`]: one variant per message kind, dispatched exhaustively by the transport.
//! - [`ProtocolTransport`]: record-framed reader and writer with the connection's
//!   [`ProtocolContext`].
//! - [`StructuredCodec`]: hook for payloads the codec does not lay out itself.
//! - [`DataServer`]: a small threaded server answering requests from a [`SignalHandler`].
//!
//! # Binary Format
//!
//! - Records are split into fragments of at most [`MAX_FRAGMENT`] bytes, each preceded by a
//!   4-byte big-endian header whose top bit marks the last fragment.
//! - Arrays whose length is carried by an earlier header field have no length prefix.
//! - Lists of requests and data blocks carry a count only from [`VERSION_BATCH`] onward.
//!
//! # See Also
//!
//! - [`data`](crate::data): the structures being encoded.
//! - [`compress`](crate::compress): axis compression applied by the codec.
mod codec;
mod error;
mod message;
mod record;
mod server;
mod structured;
mod thread;
mod transport;

use thread::ThreadPool;

pub use codec::{
    MAX_ELEMENTS, VERSION_BATCH, VERSION_CLIENT_FLAGS, VERSION_OS_NAME, VERSION_PRIVATE_FLAGS,
    VERSION_UNSIGNED_TYPES,
};
pub use error::ProtocolError;
pub use message::{Direction, Message, MessageKind, ProtocolContext};
pub use record::MAX_FRAGMENT;
pub use server::{DataServer, ShutdownHandle, SignalHandler, demo_signal};
pub use structured::{OpaquePassthrough, StructuredCodec};
pub use transport::{ProtocolTransport, TcpTransport};
