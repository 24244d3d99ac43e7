use crate::data::{
    ClientBlock, DataBlock, DataObject, DataSource, DataSystem, OpaqueType, PutDataBlock,
    RequestData, ServerBlock, Signal, SignalDesc, SystemConfig,
};

use super::ProtocolError;

/// A message exchanged with the server, one variant per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RequestBlock(Vec<RequestData>),
    ClientBlock(ClientBlock),
    ServerBlock(ServerBlock),
    DataBlockList(Vec<DataBlock>),
    PutDataBlockList(Vec<PutDataBlock>),
    /// Exchange token; sending it ends the record, receiving it starts a new one.
    NextProtocol(i32),
    DataSystem(DataSystem),
    SystemConfig(SystemConfig),
    DataSource(DataSource),
    Signal(Signal),
    SignalDesc(SignalDesc),
    DataObject(DataObject),
    /// Hierarchical payload marshalled by the structure codec.
    Structure(OpaqueType, Vec<u8>),
}

/// Tag of a [`Message`], used to ask for a message on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    RequestBlock,
    ClientBlock,
    ServerBlock,
    DataBlockList,
    PutDataBlockList,
    NextProtocol,
    DataSystem,
    SystemConfig,
    DataSource,
    Signal,
    SignalDesc,
    DataObject,
    Structure(OpaqueType),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::RequestBlock(_) => MessageKind::RequestBlock,
            Message::ClientBlock(_) => MessageKind::ClientBlock,
            Message::ServerBlock(_) => MessageKind::ServerBlock,
            Message::DataBlockList(_) => MessageKind::DataBlockList,
            Message::PutDataBlockList(_) => MessageKind::PutDataBlockList,
            Message::NextProtocol(_) => MessageKind::NextProtocol,
            Message::DataSystem(_) => MessageKind::DataSystem,
            Message::SystemConfig(_) => MessageKind::SystemConfig,
            Message::DataSource(_) => MessageKind::DataSource,
            Message::Signal(_) => MessageKind::Signal,
            Message::SignalDesc(_) => MessageKind::SignalDesc,
            Message::DataObject(_) => MessageKind::DataObject,
            Message::Structure(t, _) => MessageKind::Structure(*t),
        }
    }

    /// An empty message of the given kind.
    pub fn empty(kind: MessageKind) -> Self {
        match kind {
            MessageKind::RequestBlock => Message::RequestBlock(Vec::new()),
            MessageKind::ClientBlock => Message::ClientBlock(ClientBlock::default()),
            MessageKind::ServerBlock => Message::ServerBlock(ServerBlock::default()),
            MessageKind::DataBlockList => Message::DataBlockList(Vec::new()),
            MessageKind::PutDataBlockList => Message::PutDataBlockList(Vec::new()),
            MessageKind::NextProtocol => Message::NextProtocol(0),
            MessageKind::DataSystem => Message::DataSystem(DataSystem::default()),
            MessageKind::SystemConfig => Message::SystemConfig(SystemConfig::default()),
            MessageKind::DataSource => Message::DataSource(DataSource::default()),
            MessageKind::Signal => Message::Signal(Signal::default()),
            MessageKind::SignalDesc => Message::SignalDesc(SignalDesc::default()),
            MessageKind::DataObject => Message::DataObject(DataObject::default()),
            MessageKind::Structure(t) => Message::Structure(t, Vec::new()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
    /// Release the payload without touching the wire.
    Free,
}

/// Protocol state owned by one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolContext {
    /// Version used to gate fields and element types.
    pub version: u32,
    server_version: Option<u32>,
}

impl ProtocolContext {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            server_version: None,
        }
    }

    /// Settle on the lower of the two versions.
    pub fn negotiate(&mut self, client_version: u32, server_version: u32) -> u32 {
        self.version = client_version.min(server_version);
        self.version
    }

    pub fn server_version(&self) -> Option<u32> {
        self.server_version
    }

    /// Remember the first server version seen and refuse a different one later.
    pub(crate) fn observe_server(&mut self, version: u32) -> Result<(), ProtocolError> {
        match self.server_version {
            None => {
                self.server_version = Some(version);
                Ok(())
            }
            Some(expected) if expected == version => Ok(()),
            Some(expected) => Err(ProtocolError::ServerVersionChanged {
                expected,
                found: version,
            }),
        }
    }
}
