use std::{
    f64::consts::PI,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};

use crate::data::{
    CLIENT_PROTOCOL_VERSION, ClientBlock, DataBlock, DataSource, DataSystem, DataType, Dim,
    ErrorRecord, ErrorType, MIN_STATUS, MetaData, OpaqueType, Properties, PutDataBlock,
    RequestData, ServerBlock, Signal, SignalDesc, SystemConfig, Values,
};

use super::{Message, MessageKind, ProtocolError, ProtocolTransport, ThreadPool};

/// Produces the data block for one request, or the error to report instead.
pub type SignalHandler =
    dyn Fn(&RequestData, &ClientBlock) -> Result<DataBlock, ErrorRecord> + Send + Sync;

const DEFAULT_WORKERS: usize = 8;
const SERVER_ERROR: i32 = -1;

/// Answers handshakes and data requests with blocks produced by a [`SignalHandler`].
pub struct DataServer {
    listener: TcpListener,
    handler: Arc<SignalHandler>,
    version: u32,
    min_client_version: u32,
    pool: ThreadPool,
    shutdown: Arc<AtomicBool>,
}

/// Stops a running [`DataServer`] from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    address: SocketAddr,
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the flag.
        let _ = TcpStream::connect(self.address);
    }
}

impl DataServer {
    pub fn bind<F>(address: SocketAddr, handler: F) -> Result<Self, ProtocolError>
    where
        F: Fn(&RequestData, &ClientBlock) -> Result<DataBlock, ErrorRecord> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(address)?;
        Ok(Self {
            listener,
            handler: Arc::new(handler),
            version: CLIENT_PROTOCOL_VERSION,
            min_client_version: 0,
            pool: ThreadPool::new(DEFAULT_WORKERS),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Advertise an older protocol version than the one this crate speaks.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version.min(CLIENT_PROTOCOL_VERSION);
        self
    }

    /// Refuse handshakes from clients offering less than `version`.
    ///
    /// A refused client gets a server block carrying the error and may try again on the
    /// same connection.
    pub fn with_min_client_version(mut self, version: u32) -> Self {
        self.min_client_version = version;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool = ThreadPool::new(workers);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            address: self.listener.local_addr()?,
            flag: Arc::clone(&self.shutdown),
        })
    }

    pub fn listen(self) -> Result<(), ProtocolError> {
        info!(
            "listening at {} with protocol version {}",
            self.listener.local_addr()?,
            self.version
        );

        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("shutting down");
                break;
            }
            match stream {
                Ok(stream) => {
                    let handler = Arc::clone(&self.handler);
                    let versions = (self.version, self.min_client_version);
                    self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, handler, versions) {
                            warn!("connection closed with error: {e}");
                        }
                    });
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

fn handle_connection(
    stream: TcpStream,
    handler: Arc<SignalHandler>,
    (server_version, min_client_version): (u32, u32),
) -> Result<(), ProtocolError> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    // The context starts at the highest version so the client block is read in full.
    let mut transport = ProtocolTransport::from_stream(&stream)?;

    let client = loop {
        transport.skip_record()?;
        let Some(client) = receive_client_block(&mut transport)? else {
            return Ok(());
        };
        let version = transport
            .context_mut()
            .negotiate(client.version, server_version);
        if client.version >= min_client_version {
            info!(
                "client {peer} (pid {}, {}) speaks version {}, using {version}",
                client.pid, client.os_name, client.version
            );
            break client;
        }

        warn!(
            "client {peer} speaks version {}, at least {min_client_version} is required",
            client.version
        );
        let mut refusal = ServerBlock::new(server_version);
        refusal.push_error(ErrorRecord::new(
            ErrorType::Server,
            SERVER_ERROR,
            "handshake",
            format!(
                "protocol version {} is no longer served, upgrade to {min_client_version} or later",
                client.version
            ),
        ));
        transport.send(&Message::ServerBlock(refusal))?;
        transport.end_record()?;
    };
    if client.timeout > 0 {
        stream.set_read_timeout(Some(Duration::from_secs(client.timeout as u64)))?;
    }
    transport.send(&Message::ServerBlock(ServerBlock::new(server_version)))?;
    transport.end_record()?;

    loop {
        transport.skip_record()?;
        let Some(client) = receive_client_block(&mut transport)? else {
            return Ok(());
        };
        let mut requests = match transport.receive(MessageKind::RequestBlock)? {
            Message::RequestBlock(requests) => requests,
            other => return Err(unexpected(MessageKind::RequestBlock, &other)),
        };
        for request in requests.iter_mut().filter(|r| r.put) {
            request.put_data = match transport.receive(MessageKind::PutDataBlockList)? {
                Message::PutDataBlockList(blocks) => blocks,
                other => return Err(unexpected(MessageKind::PutDataBlockList, &other)),
            };
        }
        debug!("client {peer} requested {} signal(s)", requests.len());

        let mut reply = ServerBlock::new(server_version);
        let mut blocks = Vec::with_capacity(requests.len());
        for request in &requests {
            match handler(request, &client) {
                Ok(block) => blocks.push(block),
                Err(error) => {
                    warn!("request for {} failed: {error}", request.signal);
                    reply.push_error(error);
                }
            }
        }

        if !reply.errors.is_empty() {
            transport.send(&Message::ServerBlock(reply))?;
            transport.end_record()?;
            continue;
        }

        transport.send(&Message::ServerBlock(reply))?;
        if client.properties.contains(Properties::GET_META) {
            let meta = blocks
                .first()
                .and_then(|b| b.meta.clone())
                .unwrap_or_default();
            transport.send(&Message::DataSystem(meta.data_system))?;
            transport.send(&Message::SystemConfig(meta.system_config))?;
            transport.send(&Message::DataSource(meta.data_source))?;
            transport.send(&Message::Signal(meta.signal))?;
            transport.send(&Message::SignalDesc(meta.signal_desc))?;
        }

        let structures: Vec<(OpaqueType, Vec<u8>)> = blocks
            .iter()
            .filter(|b| b.data_type == DataType::Compound && b.opaque_type != OpaqueType::Unknown)
            .map(|b| (b.opaque_type, b.opaque.clone().unwrap_or_default()))
            .collect();
        transport.send(&Message::DataBlockList(blocks))?;
        for (opaque_type, payload) in structures {
            transport.send(&Message::Structure(opaque_type, payload))?;
        }
        transport.end_record()?;
    }
}

/// `None` once the client has gone away.
fn receive_client_block<R: io::Read, W: io::Write>(
    transport: &mut ProtocolTransport<R, W>,
) -> Result<Option<ClientBlock>, ProtocolError> {
    match transport.receive(MessageKind::ClientBlock) {
        Ok(Message::ClientBlock(block)) => Ok(Some(block)),
        Ok(other) => Err(unexpected(MessageKind::ClientBlock, &other)),
        Err(e) if e.is_io() => {
            debug!("client disconnected: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn unexpected(expected: MessageKind, found: &Message) -> ProtocolError {
    ProtocolError::Invalid(format!("expected {expected:?}, received {:?}", found.kind()))
}

/// Synthetic signals served by the bundled server.
///
/// - `ramp`: `n` doubles counting up from zero (default 10).
/// - `sine`: one period of a sine wave over `n` floats, on a time axis in seconds.
/// - `status_bad`: a ramp flagged with bad signal status.
/// - `irregular`: a ramp on an axis whose spacing grows.
/// - `put`: echoes the first block written by the client.
///
/// `n` is read from a function argument, e.g. `ramp(n=5)`.
pub fn demo_signal(request: &RequestData, client: &ClientBlock) -> Result<DataBlock, ErrorRecord> {
    let name = if request.function.is_empty() {
        request.signal.as_str()
    } else {
        request.function.as_str()
    };
    let n = match request.name_value("n") {
        Some(n) => n.parse::<usize>().map_err(|_| {
            ErrorRecord::new(
                ErrorType::Server,
                SERVER_ERROR,
                "demo_signal",
                format!("invalid element count {n}"),
            )
        })?,
        None => 10,
    };

    let mut block = match name.to_ascii_lowercase().as_str() {
        "ramp" | "signal_a" => ramp(n),
        "sine" => {
            let step = 1.0 / n.max(1) as f64;
            let values = (0..n).map(|i| (2.0 * PI * i as f64 * step).sin() as f32);
            DataBlock::new(Values::Float(values.collect()))
                .with_label("sine", "V")
                .with_dim(
                    Dim::new(Values::Double((0..n).map(|i| i as f64 * step).collect()))
                        .with_label("time", "s"),
                )
        }
        "status_bad" => {
            let mut block = ramp(n);
            block.signal_status = MIN_STATUS;
            block
        }
        "irregular" => DataBlock::new(Values::Double((0..n).map(|i| i as f64).collect()))
            .with_dim(Dim::new(Values::Double(
                (0..n).map(|i| (i * i) as f64).collect(),
            ))),
        "put" => {
            let first = request.put_data.first().ok_or_else(|| {
                ErrorRecord::new(
                    ErrorType::Server,
                    SERVER_ERROR,
                    "demo_signal",
                    "nothing was written",
                )
            })?;
            echo(first)
        }
        _ => {
            return Err(ErrorRecord::new(
                ErrorType::Server,
                SERVER_ERROR,
                "demo_signal",
                format!("unknown signal {}", request.signal),
            ));
        }
    };

    block.data_desc = format!("{} from {}", request.signal, request.source);
    if client.properties.contains(Properties::GET_META) {
        block.meta = Some(describe(request, &block));
    }
    Ok(block)
}

fn ramp(n: usize) -> DataBlock {
    DataBlock::new(Values::Double((0..n).map(|i| i as f64).collect()))
        .with_label("ramp", "")
        .with_dim(Dim::new(Values::Int((0..n as i32).collect())).with_label("index", ""))
}

fn echo(block: &PutDataBlock) -> DataBlock {
    match &block.data {
        Some(values) => DataBlock::new(values.clone()).with_label(&block.block_name, ""),
        None => DataBlock {
            data_type: DataType::Compound,
            data_n: 1,
            opaque_type: block.opaque_type,
            opaque_count: block.opaque_count,
            opaque: block.opaque.clone(),
            data_label: block.block_name.clone(),
            ..DataBlock::default()
        },
    }
}

fn describe(request: &RequestData, block: &DataBlock) -> MetaData {
    MetaData {
        data_system: DataSystem {
            device_name: request.device_name.clone(),
            system_name: "synthetic".to_string(),
            ..DataSystem::default()
        },
        system_config: SystemConfig {
            config_name: "demo".to_string(),
            ..SystemConfig::default()
        },
        data_source: DataSource {
            exp_number: request.exp_number,
            pass: request.pass,
            archive: request.archive.clone(),
            device_name: request.device_name.clone(),
            path: request.path.clone(),
            ..DataSource::default()
        },
        signal: Signal {
            status: block.signal_status,
            ..Signal::default()
        },
        signal_desc: SignalDesc {
            signal_name: request.signal.clone(),
            rank: block.rank as i32,
            description: block.data_desc.clone(),
            ..SignalDesc::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::data::RequestDefaults;

    fn request(signal: &str, source: &str) -> RequestData {
        RequestData::parse(signal, source, &RequestDefaults::default()).unwrap()
    }

    #[test]
    fn ramp_has_a_regular_axis() {
        let block = demo_signal(&request("signal_A", "device::source_B"), &ClientBlock::default())
            .unwrap();
        assert_eq!(block.data_n, 10);
        assert_eq!(block.rank, 1);
        assert_eq!(block.dims[0].values, Some(Values::Int((0..10).collect())));
        assert!(block.meta.is_none());
    }

    #[test]
    fn function_arguments_size_the_signal() {
        let mut client = ClientBlock::default();
        client.properties.insert(Properties::GET_META);

        let block = demo_signal(&request("x", "sine(n=4)"), &client).unwrap();
        assert_eq!(block.data_n, 4);
        assert_eq!(block.data_type, DataType::Float);
        assert_eq!(block.meta.unwrap().signal_desc.signal_name, "x");
    }

    #[test]
    fn unknown_signal_is_a_server_error() {
        let err = demo_signal(&request("nope", "1"), &ClientBlock::default()).unwrap_err();
        assert_eq!(err.error_type, ErrorType::Server);
        assert!(err.message.contains("nope"));
    }

    #[test]
    fn shutdown_stops_the_accept_loop() {
        let server = DataServer::bind("127.0.0.1:0".parse().unwrap(), demo_signal)
            .unwrap()
            .with_workers(1);
        let handle = server.shutdown_handle().unwrap();
        let running = thread::spawn(move || server.listen());

        handle.shutdown();
        assert!(running.join().unwrap().is_ok());
    }
}
