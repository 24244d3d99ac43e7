//! Request orchestration.
//!
//! # Overview
//!
//! A [`Client`] turns a signal and source into data. Each call walks the same sequence:
//! make sure a socket is open (reusing or replacing it as its age dictates), handshake if
//! the socket is new, write the request record, then read the server's reply and store
//! every returned block under a [`Handle`].
//!
//! ```text
//! Idle -> EnsuringConnection -> Handshaking -> Sending(..) -> Flush -> Receiving(..)
//!      -> AssemblingResults -> Idle
//! ```
//!
//! Errors raised anywhere on the way are gathered in an [`ErrorStack`]. Socket and framing
//! failures close the current socket so the next call starts clean; errors reported by the
//! server leave it open.
//!
//! # Key Components
//!
//! - [`Client`]: the session, its properties and its stored results.
//! - [`ClientConfig`]: endpoint, timeouts and request defaults.
//! - [`PropertySet`]: named switches such as `get_meta` or `timeout=N`.
//! - [`ResultCache`]: store offered each fetched block when caching is enabled.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): socket pool and failover.
//! - [`protocol`](crate::protocol): the messages exchanged.
mod cache;
mod config;
mod error;
mod properties;

use std::{fmt, sync::Arc, time::Duration};

use log::{Level, debug, info, log, warn};

use crate::{
    connection::{Authenticator, CloseDown, Connection, ConnectionError, HostList, SocketId},
    data::{
        CLIENT_PROTOCOL_VERSION, ClientBlock, ClientFlags, DATA_STATUS_BAD, DataBlock, DataType,
        ErrorRecord, ErrorStack, ErrorType, MIN_STATUS, MetaData, OpaqueType, PrivateFlags,
        Properties, PutDataBlock, RequestData, ServerBlock,
    },
    protocol::{
        Message, MessageKind, OpaquePassthrough, StructuredCodec, TcpTransport,
        VERSION_OS_NAME,
    },
};

pub use cache::{MemoryCache, ResultCache};
pub use config::ClientConfig;
pub use error::ClientError;
pub use properties::{PropertyError, PropertySet};

/// Index of a data block held by a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    EnsuringConnection,
    Handshaking,
    Sending(MessageKind),
    Flush,
    Receiving(MessageKind),
    AssemblingResults,
    Failed,
}

struct Reply {
    blocks: Vec<DataBlock>,
    meta: Option<MetaData>,
}

/// Receive one message of a kind whose variant holds a single value.
macro_rules! receive {
    ($client:expr, $kind:ident) => {{
        $client.transition(SessionState::Receiving(MessageKind::$kind));
        match $client.transport()?.receive(MessageKind::$kind)? {
            Message::$kind(value) => value,
            other => return Err(unexpected(stringify!($kind), &other)),
        }
    }};
}

pub struct Client {
    config: ClientConfig,
    connection: Connection,
    settings: PropertySet,
    client_block: ClientBlock,
    server_block: ServerBlock,
    errors: ErrorStack,
    blocks: Vec<Option<DataBlock>>,
    last_handle: Option<usize>,
    memory_cache: Option<Box<dyn ResultCache>>,
    file_cache: Option<Box<dyn ResultCache>>,
    structures: Arc<dyn StructuredCodec>,
    state: SessionState,
}

impl Client {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let host_list = match &config.hosts_file {
            Some(path) => HostList::load_or_default(path).map_err(ConnectionError::from)?,
            None => HostList::new(),
        };
        let mut connection =
            Connection::new(config.connection_config(), host_list, &config.host, config.port);
        if let Some((host, port)) = &config.failover {
            connection.set_failover(host, *port);
        }

        let client_block = ClientBlock {
            version: config.protocol_version.min(CLIENT_PROTOCOL_VERSION),
            timeout: config.timeout,
            ..ClientBlock::default()
        };
        Ok(Self {
            settings: PropertySet::new(config.timeout),
            config,
            connection,
            client_block,
            server_block: ServerBlock::default(),
            errors: ErrorStack::new(),
            blocks: Vec::new(),
            last_handle: None,
            memory_cache: None,
            file_cache: None,
            structures: Arc::new(OpaquePassthrough),
            state: SessionState::Idle,
        })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn get_host(&self) -> &str {
        self.connection.host()
    }

    pub fn get_port(&self) -> u16 {
        self.connection.port()
    }

    pub fn set_host(&mut self, host: &str) {
        self.connection.set_host(host);
    }

    pub fn set_port(&mut self, port: u16) {
        self.connection.set_port(port);
    }

    pub fn set_failover(&mut self, host: &str, port: u16) {
        self.connection.set_failover(host, port);
    }

    pub fn set_authenticator(&mut self, authenticator: Box<dyn Authenticator>) {
        self.connection.set_authenticator(authenticator);
    }

    pub fn set_structured_codec(&mut self, structures: Arc<dyn StructuredCodec>) {
        self.structures = Arc::clone(&structures);
        if let Some(transport) = self.connection.transport_mut() {
            transport.set_structured_codec(structures);
        }
    }

    pub fn set_memory_cache(&mut self, cache: Box<dyn ResultCache>) {
        self.memory_cache = Some(cache);
    }

    pub fn set_file_cache(&mut self, cache: Box<dyn ResultCache>) {
        self.file_cache = Some(cache);
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn current_socket_id(&self) -> Option<SocketId> {
        self.connection.current_socket_id()
    }

    /// Version in force on the current socket, or the offered one before any handshake.
    pub fn protocol_version(&self) -> u32 {
        self.connection
            .current_socket()
            .filter(|s| s.handshaken)
            .and_then(|s| s.protocol_version())
            .unwrap_or(self.client_block.version)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_property(&mut self, property: &str) -> Result<(), ClientError> {
        Ok(self.settings.set(property)?)
    }

    pub fn get_property(&self, property: &str) -> Result<i64, ClientError> {
        Ok(self.settings.get(property)?)
    }

    pub fn reset_property(&mut self, property: &str) -> Result<(), ClientError> {
        Ok(self.settings.reset(property)?)
    }

    pub fn reset_properties(&mut self) {
        self.settings.reset_all();
    }

    pub fn properties(&self) -> &PropertySet {
        &self.settings
    }

    pub fn set_flag(&mut self, flag: ClientFlags) {
        self.settings.flags.insert(flag);
    }

    pub fn reset_flag(&mut self, flag: ClientFlags) {
        self.settings.flags.remove(flag);
    }

    pub fn set_private_flag(&mut self, flag: PrivateFlags) {
        self.settings.private_flags.insert(flag);
    }

    pub fn reset_private_flag(&mut self, flag: PrivateFlags) {
        self.settings.private_flags.remove(flag);
    }

    pub fn client_block(&self) -> &ClientBlock {
        &self.client_block
    }

    pub fn server_block(&self) -> &ServerBlock {
        &self.server_block
    }

    /// Errors gathered by the most recent request.
    pub fn error_stack(&self) -> &ErrorStack {
        &self.errors
    }

    pub fn data_block(&self, handle: Handle) -> Option<&DataBlock> {
        self.blocks.get(handle.0).and_then(Option::as_ref)
    }

    pub fn free_handle(&mut self, handle: Handle) -> Result<(), ClientError> {
        match self.blocks.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(ClientError::InvalidHandle(handle.0)),
        }
    }

    /// Drop every stored block and error.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.last_handle = None;
        self.errors.clear();
    }

    pub fn close_down(&mut self, scope: CloseDown) {
        self.connection.close_down(scope);
    }

    pub fn get(&mut self, signal: &str, source: &str) -> Result<Handle, ClientError> {
        let request = RequestData::parse(signal, source, &self.config.request_defaults)?;
        self.single(request)
    }

    /// One handle per `(signal, source)` pair, in order.
    pub fn get_batch(&mut self, pairs: &[(&str, &str)]) -> Result<Vec<Handle>, ClientError> {
        let requests = pairs
            .iter()
            .map(|(signal, source)| {
                RequestData::parse(signal, source, &self.config.request_defaults)
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.get_requests(requests)
    }

    /// Write `blocks` to the server under `instruction`.
    pub fn put(
        &mut self,
        instruction: &str,
        blocks: Vec<PutDataBlock>,
    ) -> Result<Handle, ClientError> {
        let request = RequestData::parse("", instruction, &self.config.request_defaults)?
            .with_put_data(blocks);
        self.single(request)
    }

    fn single(&mut self, request: RequestData) -> Result<Handle, ClientError> {
        self.get_requests(vec![request])?
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::UnexpectedMessage {
                expected: "one data block",
                found: "none".to_string(),
            })
    }

    /// Send `requests` in one record and store the returned blocks in request order.
    pub fn get_requests(&mut self, requests: Vec<RequestData>) -> Result<Vec<Handle>, ClientError> {
        self.errors.clear();
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        self.settings.apply(&mut self.client_block);

        if let Some(handle) = self.from_cache(&requests) {
            return Ok(vec![handle]);
        }

        match self.exchange(&requests) {
            Ok(reply) => {
                self.transition(SessionState::AssemblingResults);
                let handles = self.assemble(&requests, reply);
                self.transition(SessionState::Idle);
                Ok(handles)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn from_cache(&mut self, requests: &[RequestData]) -> Option<Handle> {
        if !self.settings.flags.contains(ClientFlags::CACHE) {
            return None;
        }
        let [request] = requests else {
            return None;
        };
        if request.put {
            return None;
        }
        let block = self.memory_cache.as_ref()?.read(request)?;
        debug!("{} served from the memory cache", request.signal);
        Some(self.store(block))
    }

    fn exchange(&mut self, requests: &[RequestData]) -> Result<Reply, ClientError> {
        self.ensure_connection()?;
        if self.connection.startup_state() {
            self.perform_handshake()?;
        }

        let version = self.transport()?.version();
        if version < VERSION_OS_NAME && requests.iter().any(|r| r.put) {
            return Err(ClientError::PutNotSupported { version });
        }

        self.transition(SessionState::Sending(MessageKind::ClientBlock));
        let client_block = Message::ClientBlock(self.client_block.clone());
        self.transport()?.send(&client_block)?;

        self.transition(SessionState::Sending(MessageKind::RequestBlock));
        self.transport()?
            .send(&Message::RequestBlock(requests.to_vec()))?;

        for request in requests.iter().filter(|r| r.put) {
            self.transition(SessionState::Sending(MessageKind::PutDataBlockList));
            self.transport()?
                .send(&Message::PutDataBlockList(request.put_data.clone()))?;
        }

        self.transition(SessionState::Flush);
        self.transport()?.flush()?;

        self.server_block = receive!(self, ServerBlock);
        self.check_server_errors()?;

        let meta = if self.client_block.properties.contains(Properties::GET_META) {
            Some(MetaData {
                data_system: receive!(self, DataSystem),
                system_config: receive!(self, SystemConfig),
                data_source: receive!(self, DataSource),
                signal: receive!(self, Signal),
                signal_desc: receive!(self, SignalDesc),
            })
        } else {
            None
        };

        let mut blocks = receive!(self, DataBlockList);
        if blocks.len() != requests.len() {
            warn!(
                "{} request(s) sent, {} data block(s) received",
                requests.len(),
                blocks.len()
            );
        }

        for block in blocks
            .iter_mut()
            .filter(|b| b.data_type == DataType::Compound && b.opaque_type != OpaqueType::Unknown)
        {
            let kind = MessageKind::Structure(block.opaque_type);
            self.transition(SessionState::Receiving(kind));
            match self.transport()?.receive(kind)? {
                Message::Structure(_, payload) => block.opaque = Some(payload),
                other => return Err(unexpected("Structure", &other)),
            }
        }

        Ok(Reply { blocks, meta })
    }

    fn ensure_connection(&mut self) -> Result<(), ClientError> {
        self.transition(SessionState::EnsuringConnection);
        self.connection
            .set_user_timeout(Duration::from_secs(self.settings.user_timeout as u64));

        if self.connection.is_open() && self.connection.current_socket_timeout() {
            info!(
                "socket to {} exceeded its {}s timeout",
                self.connection.endpoint(),
                self.settings.user_timeout
            );
            self.connection.close_down(CloseDown::CloseSockets);
        }
        if self.connection.reconnect_required() {
            self.connection.maybe_reuse_existing_socket();
        }

        if !self.connection.is_open() {
            self.connection.create()?;
            let version = self.client_block.version;
            let structures = Arc::clone(&self.structures);
            let transport = self.transport()?;
            transport.context_mut().version = version;
            transport.set_structured_codec(structures);
            return Ok(());
        }

        let stale = self.transport()?.discard_pending()?;
        if stale > 0 {
            warn!("discarded {stale} unread bytes from the previous reply");
        }
        Ok(())
    }

    fn perform_handshake(&mut self) -> Result<(), ClientError> {
        self.transition(SessionState::Handshaking);
        let client_block = Message::ClientBlock(self.client_block.clone());
        let transport = self.transport()?;
        transport.send(&client_block)?;
        transport.flush()?;

        self.server_block = receive!(self, ServerBlock);
        let (offered, server_version) = (self.client_block.version, self.server_block.version);
        let version = self
            .transport()?
            .context_mut()
            .negotiate(offered, server_version);
        info!(
            "server at {} speaks protocol version {server_version}, using {version}",
            self.connection.endpoint()
        );

        self.check_server_errors()?;
        self.connection.handshake_complete();
        Ok(())
    }

    /// Fail with the first server error, after adding them all to the stack.
    fn check_server_errors(&mut self) -> Result<(), ClientError> {
        let block = &self.server_block;
        if block.errors.is_empty() && block.error == 0 {
            return Ok(());
        }

        let stack = if block.errors.is_empty() {
            ErrorStack::from(vec![ErrorRecord::new(
                ErrorType::Server,
                block.error,
                "server",
                block.msg.clone(),
            )])
        } else {
            block.errors.clone()
        };
        self.errors.concat(&stack);

        let (code, message) = stack
            .first()
            .map(|r| (r.code, r.message.clone()))
            .unwrap_or((block.error, block.msg.clone()));
        Err(ClientError::Server { code, message })
    }

    fn assemble(&mut self, requests: &[RequestData], reply: Reply) -> Vec<Handle> {
        let accept_bad = self.client_block.properties.contains(Properties::GET_BAD);
        let mut handles = Vec::with_capacity(reply.blocks.len());
        let mut first_erroring = None;

        for (i, mut block) in reply.blocks.into_iter().enumerate() {
            block.client_block = self.client_block.clone();
            if reply.meta.is_some() {
                block.meta = reply.meta.clone();
            }
            self.errors.extend(block.errors.drain(..));
            if let Some(request) = requests.get(i) {
                self.offer_to_caches(request, &block);
            }
            if let Some(record) = apply_status_rule(&mut block, accept_bad) {
                self.errors.push(record);
            }

            let erroring = block.errcode != 0;
            let handle = self.store(block);
            if erroring && first_erroring.is_none() {
                first_erroring = Some(handle);
            }
            handles.push(handle);
        }

        if let Some(handle) = first_erroring {
            if let Some(block) = self.blocks.get_mut(handle.0).and_then(Option::as_mut) {
                block.errors = self.errors.records().to_vec();
                if let (true, Some(first)) = (block.error_msg.is_empty(), self.errors.first()) {
                    block.error_msg = first.message.clone();
                }
            }
        }

        log!(
            self.settings.log_level(),
            "{} block(s) stored, {} error(s), handles {:?}",
            handles.len(),
            self.errors.len(),
            handles
        );
        handles
    }

    fn offer_to_caches(&mut self, request: &RequestData, block: &DataBlock) {
        let flags = self.client_block.flags;
        if flags.contains(ClientFlags::CACHE) {
            if let Some(cache) = self.memory_cache.as_mut() {
                cache.write(request, block);
            }
        }
        if flags.contains(ClientFlags::FILE_CACHE) {
            if let Some(cache) = self.file_cache.as_mut() {
                cache.write(request, block);
            }
        }
    }

    fn store(&mut self, block: DataBlock) -> Handle {
        let reuse = self.settings.flags.contains(ClientFlags::REUSE_LAST_HANDLE)
            || self
                .settings
                .flags
                .contains(ClientFlags::FREE_REUSE_LAST_HANDLE);
        if let (true, Some(index)) = (reuse, self.last_handle) {
            if let Some(slot) = self.blocks.get_mut(index) {
                *slot = Some(block);
                return Handle(index);
            }
        }
        self.blocks.push(Some(block));
        let index = self.blocks.len() - 1;
        self.last_handle = Some(index);
        Handle(index)
    }

    fn fail(&mut self, error: ClientError) -> ClientError {
        self.transition(SessionState::Failed);
        let pending = self.connection.take_errors();
        if pending.is_empty() {
            if let Some(record) = error.to_record("get_requests") {
                self.errors.push(record);
            }
        } else {
            self.errors.concat(&pending);
        }

        if error.closes_connection() {
            warn!("request failed, closing socket: {error}");
            self.connection.close_down(CloseDown::CloseSockets);
        } else if let Some(transport) = self.connection.transport_mut() {
            match transport.abandon_message() {
                Ok(0) => {}
                Ok(n) => debug!("discarded {n} bytes of the failed reply"),
                Err(e) => {
                    warn!("could not resynchronise after a failed request, closing socket: {e}");
                    self.connection.close_down(CloseDown::CloseSockets);
                }
            }
        }
        self.transition(SessionState::Idle);
        error
    }

    fn transport(&mut self) -> Result<&mut TcpTransport, ClientError> {
        self.connection
            .transport_mut()
            .ok_or(ClientError::NotConnected)
    }

    fn transition(&mut self, next: SessionState) {
        let level = self.settings.log_level().max(Level::Debug);
        log!(level, "session {:?} -> {next:?}", self.state);
        self.state = next;
    }
}

/// Flag a block whose effective status is bad, unless bad data was asked for.
///
/// A server-side error code already on the block is kept.
pub fn apply_status_rule(block: &mut DataBlock, accept_bad: bool) -> Option<ErrorRecord> {
    if accept_bad || block.effective_status() != MIN_STATUS {
        return None;
    }
    let record = ErrorRecord::new(
        ErrorType::Client,
        DATA_STATUS_BAD,
        "get_requests",
        "data status is bad, the data are not usable",
    );
    if block.errcode == 0 {
        block.errcode = DATA_STATUS_BAD;
        block.error_msg = record.message.clone();
    }
    Some(record)
}

fn unexpected(expected: &'static str, found: &Message) -> ClientError {
    ClientError::UnexpectedMessage {
        expected,
        found: format!("{:?}", found.kind()),
    }
}
