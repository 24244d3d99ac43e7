//! Sockets to data servers.
//!
//! # Overview
//!
//! A [`Connection`] owns a pool of sockets and tracks which one is current. The current
//! endpoint is named by the caller, optionally through a [`HostList`] alias, and a single
//! failover endpoint may be configured. When the primary refuses every attempt the
//! failover is tried, and on success the two swap roles for the rest of the session.
//!
//! Sockets age: each carries a user timeout after which the client closes it and opens a
//! fresh one before the next request. Closed sockets are marked closed but remain in the
//! pool.
//!
//! # Key Components
//!
//! - [`Connection`]: endpoint bookkeeping, socket creation, reuse and teardown.
//! - [`HostList`]: alias table loaded from a host list file.
//! - [`Authenticator`]: hook run on each new socket to a secure endpoint.
//!
//! # See Also
//!
//! - [`client`](crate::client): drives a [`Connection`] for each request.
mod host_list;
mod socket;

use std::{
    io,
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use rand::Rng;
use thiserror::Error;

use crate::{
    data::{DEFAULT_TIMEOUT, ErrorRecord, ErrorStack, ErrorType, NO_SOCKET_CONNECTION},
    protocol::TcpTransport,
};

pub use host_list::{Endpoint, HostEntry, HostList, HostListError};
pub use socket::{SOCKET_BUFFER_SIZE, Socket, SocketId};

use host_list::{split_port, strip_ssl};

pub const DEFAULT_PORT: u16 = 56565;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("unable to connect to {endpoint}: {source}")]
    NoConnection {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("unable to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    HostList(#[from] HostListError),
    #[error("authentication with {endpoint} failed: {reason}")]
    Authentication { endpoint: Endpoint, reason: String },
}

impl ConnectionError {
    /// OS error number of the underlying failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ConnectionError::NoConnection { source, .. }
            | ConnectionError::Resolve { source, .. } => source.raw_os_error(),
            ConnectionError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

/// Establishes a secure session on a freshly connected socket, before first use.
pub trait Authenticator: Send {
    fn authenticate(&mut self, stream: &TcpStream, endpoint: &Endpoint) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDown {
    /// Close the current socket only.
    CloseSockets,
    /// Close every socket in the pool.
    CloseAll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Retries after the first failed connect, per endpoint.
    pub max_socket_attempts: u32,
    /// Upper bound of the random wait between connect attempts.
    pub max_socket_delay: Duration,
    pub connect_timeout: Duration,
    /// Read and write timeout applied to every socket. `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
    pub user_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_socket_attempts: 3,
            max_socket_delay: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            io_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT as u64)),
            user_timeout: Duration::from_secs(DEFAULT_TIMEOUT as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    endpoint: Endpoint,
    secure: bool,
}

pub struct Connection {
    config: ConnectionConfig,
    host_list: HostList,
    primary: Target,
    failover: Option<Target>,
    sockets: Vec<Socket>,
    current: Option<usize>,
    next_id: u64,
    reconnect_required: bool,
    authenticator: Option<Box<dyn Authenticator>>,
    errors: ErrorStack,
}

impl Connection {
    pub fn new(config: ConnectionConfig, host_list: HostList, host: &str, port: u16) -> Self {
        let mut connection = Self {
            config,
            host_list,
            primary: Target {
                endpoint: Endpoint::new(host, port),
                secure: false,
            },
            failover: None,
            sockets: Vec::new(),
            current: None,
            next_id: 0,
            reconnect_required: false,
            authenticator: None,
            errors: ErrorStack::new(),
        };
        connection.primary = connection.resolve_target(host, port);
        connection
    }

    pub fn host(&self) -> &str {
        &self.primary.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.primary.endpoint.port
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.primary.endpoint
    }

    pub fn failover(&self) -> Option<&Endpoint> {
        self.failover.as_ref().map(|t| &t.endpoint)
    }

    pub fn is_secure(&self) -> bool {
        self.primary.secure
    }

    pub fn host_list(&self) -> &HostList {
        &self.host_list
    }

    pub fn set_authenticator(&mut self, authenticator: Box<dyn Authenticator>) {
        self.authenticator = Some(authenticator);
    }

    /// Point at `name`, resolved through the host list.
    pub fn set_host(&mut self, name: &str) {
        let target = self.resolve_target(name, self.primary.endpoint.port);
        self.retarget(target);
    }

    pub fn set_port(&mut self, port: u16) {
        let target = Target {
            endpoint: Endpoint::new(&self.primary.endpoint.host, port),
            secure: self.primary.secure,
        };
        self.retarget(target);
    }

    pub fn set_failover(&mut self, name: &str, port: u16) {
        self.failover = Some(self.resolve_target(name, port));
    }

    fn retarget(&mut self, target: Target) {
        if target.endpoint != self.primary.endpoint {
            debug!("endpoint changed to {}", target.endpoint);
            self.reconnect_required = true;
            // The old socket stays open in the pool for a later switch back.
            self.current = None;
        }
        self.primary = target;
    }

    fn resolve_target(&self, name: &str, default_port: u16) -> Target {
        if let Some(entry) = self.host_list.resolve(name) {
            return Target {
                endpoint: Endpoint::new(&entry.host, entry.port.unwrap_or(default_port)),
                secure: entry.secure,
            };
        }
        let (host, secure) = strip_ssl(name.trim());
        let (host, port) = split_port(host);
        Target {
            endpoint: Endpoint::new(host, port.unwrap_or(default_port)),
            secure,
        }
    }

    pub fn reconnect_required(&self) -> bool {
        self.reconnect_required
    }

    /// True until a handshake has completed on the current socket.
    pub fn startup_state(&self) -> bool {
        !self.current_socket().is_some_and(|s| s.handshaken)
    }

    pub fn handshake_complete(&mut self) {
        if let Some(socket) = self.current.and_then(|i| self.sockets.get_mut(i)) {
            socket.handshaken = true;
        }
    }

    pub fn is_open(&self) -> bool {
        self.current_socket().is_some_and(|s| s.open)
    }

    pub fn current_socket(&self) -> Option<&Socket> {
        self.current.and_then(|i| self.sockets.get(i))
    }

    pub fn current_socket_id(&self) -> Option<SocketId> {
        self.current_socket().map(|s| s.id)
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.sockets
    }

    pub fn transport_mut(&mut self) -> Option<&mut TcpTransport> {
        let index = self.current?;
        self.sockets.get_mut(index).and_then(Socket::transport_mut)
    }

    /// Adopt an open pooled socket to the current endpoint, if one has not timed out.
    pub fn maybe_reuse_existing_socket(&mut self) -> bool {
        let found = self
            .sockets
            .iter()
            .position(|s| s.open && s.endpoint == self.primary.endpoint);

        let Some(index) = found else {
            return false;
        };
        if self.sockets[index].timed_out() {
            info!(
                "pooled socket {} to {} has timed out",
                self.sockets[index].id, self.primary.endpoint
            );
            self.sockets[index].close();
            if self.current == Some(index) {
                self.current = None;
            }
            return false;
        }

        debug!("reusing socket {}", self.sockets[index].id);
        self.current = Some(index);
        self.reconnect_required = false;
        true
    }

    /// Open a socket to the current endpoint unless one is already current.
    pub fn create(&mut self) -> Result<(), ConnectionError> {
        if self.is_open() {
            return Ok(());
        }

        let (stream, target) = match self.connect_with_retries(&self.primary.endpoint) {
            Ok(stream) => (stream, self.primary.clone()),
            Err(primary_error) => match self.failover.clone() {
                Some(failover) if failover.endpoint != self.primary.endpoint => {
                    warn!(
                        "unable to connect to {}, trying {}",
                        self.primary.endpoint, failover.endpoint
                    );
                    match self.connect_with_retries(&failover.endpoint) {
                        Ok(stream) => {
                            let old = std::mem::replace(&mut self.primary, failover.clone());
                            self.failover = Some(old);
                            (stream, failover)
                        }
                        Err(e) => return Err(self.record(e)),
                    }
                }
                _ => return Err(self.record(primary_error)),
            },
        };

        if let Err(e) = socket::configure(&stream, self.config.io_timeout) {
            return Err(self.record(ConnectionError::Io(e)));
        }

        if target.secure {
            let Some(authenticator) = self.authenticator.as_mut() else {
                return Err(self.record(ConnectionError::Authentication {
                    endpoint: target.endpoint,
                    reason: "no authenticator installed".to_string(),
                }));
            };
            if let Err(e) = authenticator.authenticate(&stream, &target.endpoint) {
                return Err(self.record(ConnectionError::Authentication {
                    endpoint: target.endpoint,
                    reason: e.to_string(),
                }));
            }
        }

        let id = SocketId(self.next_id);
        self.next_id += 1;
        let socket = match Socket::new(id, target.endpoint, stream, self.config.user_timeout) {
            Ok(socket) => socket,
            Err(e) => return Err(self.record(ConnectionError::Io(e))),
        };
        info!("opened socket {id} to {}", socket.endpoint);

        self.sockets.push(socket);
        self.current = Some(self.sockets.len() - 1);
        self.reconnect_required = false;
        Ok(())
    }

    fn connect_with_retries(&self, endpoint: &Endpoint) -> Result<TcpStream, ConnectionError> {
        let addresses = resolve(endpoint).map_err(|source| ConnectionError::Resolve {
            host: endpoint.host.clone(),
            source,
        })?;

        let mut last_error = io::Error::from(io::ErrorKind::AddrNotAvailable);
        for attempt in 0..=self.config.max_socket_attempts {
            if attempt > 0 {
                let delay = self.random_delay();
                debug!("retrying {endpoint} in {delay:?} (attempt {attempt})");
                thread::sleep(delay);
            }
            for address in &addresses {
                match TcpStream::connect_timeout(address, self.config.connect_timeout) {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_error = e,
                }
            }
            warn!("connect to {endpoint} failed: {last_error}");
        }

        Err(ConnectionError::NoConnection {
            endpoint: endpoint.clone(),
            source: last_error,
        })
    }

    fn random_delay(&self) -> Duration {
        let max = self.config.max_socket_delay.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max))
    }

    fn record(&mut self, error: ConnectionError) -> ConnectionError {
        let code = error.raw_os_error().unwrap_or(NO_SOCKET_CONNECTION);
        self.errors.push(ErrorRecord::new(
            ErrorType::System,
            code,
            "create",
            error.to_string(),
        ));
        error
    }

    /// True once the current socket has outlived its user timeout.
    pub fn current_socket_timeout(&self) -> bool {
        self.current_socket().is_some_and(Socket::timed_out)
    }

    pub fn get_current_socket_age(&self) -> Option<Duration> {
        self.current_socket().map(Socket::age)
    }

    /// Timeout for new sockets and the current one.
    pub fn set_user_timeout(&mut self, timeout: Duration) {
        self.config.user_timeout = timeout;
        if let Some(socket) = self.current.and_then(|i| self.sockets.get_mut(i)) {
            socket.user_timeout = timeout;
        }
    }

    pub fn close_down(&mut self, scope: CloseDown) {
        match scope {
            CloseDown::CloseSockets => {
                if let Some(socket) = self.current.and_then(|i| self.sockets.get_mut(i)) {
                    socket.close();
                }
            }
            CloseDown::CloseAll => self.sockets.iter_mut().for_each(Socket::close),
        }
        self.current = None;
    }

    /// Drain the system errors recorded since the last call.
    pub fn take_errors(&mut self) -> ErrorStack {
        std::mem::take(&mut self.errors)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close_down(CloseDown::CloseAll);
    }
}

/// Addresses for `endpoint`. Numeric hosts skip the resolver; `localhost` prefers IPv4.
fn resolve(endpoint: &Endpoint) -> io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = endpoint.host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, endpoint.port)]);
    }

    let mut addresses: Vec<SocketAddr> =
        (endpoint.host.as_str(), endpoint.port).to_socket_addrs()?.collect();
    if endpoint.host.eq_ignore_ascii_case("localhost") {
        addresses.sort_by_key(|a| !a.is_ipv4());
    }
    if addresses.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}", endpoint.host),
        ));
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn quick() -> ConnectionConfig {
        ConnectionConfig {
            max_socket_attempts: 1,
            max_socket_delay: Duration::ZERO,
            connect_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        }
    }

    fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    /// A port nothing listens on.
    fn refused_port() -> u16 {
        let (listener, port) = listener();
        drop(listener);
        port
    }

    #[test]
    fn failover_becomes_primary() {
        let dead = refused_port();
        let (_live, live) = listener();

        let mut connection = Connection::new(quick(), HostList::new(), "127.0.0.1", dead);
        connection.set_failover("127.0.0.1", live);
        connection.create().unwrap();

        assert!(connection.is_open());
        assert_eq!(connection.host(), "127.0.0.1");
        assert_eq!(connection.port(), live);
        assert_eq!(connection.failover().unwrap().port, dead);
        assert!(connection.startup_state());
    }

    #[test]
    fn refused_everywhere_records_a_system_error() {
        let mut connection = Connection::new(quick(), HostList::new(), "127.0.0.1", refused_port());
        let err = connection.create().unwrap_err();

        assert!(matches!(err, ConnectionError::NoConnection { .. }));
        assert!(!connection.is_open());
        let errors = connection.take_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.first().unwrap().error_type, ErrorType::System);
        assert!(connection.take_errors().is_empty());
    }

    #[test]
    fn pooled_socket_is_reused_until_it_times_out() {
        let (_a, port_a) = listener();
        let (_b, port_b) = listener();
        let mut connection = Connection::new(quick(), HostList::new(), "127.0.0.1", port_a);

        connection.create().unwrap();
        let first = connection.current_socket_id().unwrap();
        connection.create().unwrap();
        assert_eq!(connection.current_socket_id(), Some(first));

        connection.set_port(port_b);
        assert!(connection.reconnect_required());
        assert!(!connection.maybe_reuse_existing_socket());
        connection.create().unwrap();
        let second = connection.current_socket_id().unwrap();
        assert_ne!(first, second);

        connection.set_port(port_a);
        assert!(connection.maybe_reuse_existing_socket());
        assert_eq!(connection.current_socket_id(), Some(first));
        assert!(!connection.reconnect_required());

        connection.set_user_timeout(Duration::ZERO);
        assert!(connection.current_socket_timeout());
        connection.set_port(port_b);
        connection.set_port(port_a);
        assert!(!connection.maybe_reuse_existing_socket());
        assert!(!connection.sockets()[0].open);
        assert_eq!(connection.sockets().len(), 2);
    }

    #[test]
    fn close_down_keeps_records() {
        let (_a, port) = listener();
        let mut connection = Connection::new(quick(), HostList::new(), "localhost", port);
        connection.create().unwrap();
        connection.handshake_complete();
        assert!(connection.get_current_socket_age().is_some());

        connection.close_down(CloseDown::CloseAll);
        assert!(!connection.is_open());
        assert!(connection.startup_state());
        assert_eq!(connection.sockets().len(), 1);
        assert!(connection.sockets().iter().all(|s| !s.open));
        assert!(connection.transport_mut().is_none());
    }

    #[test]
    fn host_resolution_through_aliases() {
        let list = HostList::parse("host_name 127.0.0.1\nhost_alias local\nport 4000\n").unwrap();
        let mut connection = Connection::new(quick(), list, "127.0.0.1", 4000);
        assert!(!connection.reconnect_required());

        connection.set_host("LOCAL");
        assert_eq!(connection.endpoint(), &Endpoint::new("127.0.0.1", 4000));
        assert!(!connection.reconnect_required());

        connection.set_host("SSL://other:4100");
        assert_eq!(connection.endpoint(), &Endpoint::new("other", 4100));
        assert!(connection.is_secure());
        assert!(connection.reconnect_required());
    }

    #[test]
    fn secure_endpoint_needs_an_authenticator() {
        struct Accept;
        impl Authenticator for Accept {
            fn authenticate(&mut self, _: &TcpStream, _: &Endpoint) -> io::Result<()> {
                Ok(())
            }
        }

        let (_l, port) = listener();
        let mut connection =
            Connection::new(quick(), HostList::new(), &format!("SSL://127.0.0.1:{port}"), 1);
        assert_eq!(connection.port(), port);

        let err = connection.create().unwrap_err();
        assert!(matches!(err, ConnectionError::Authentication { .. }));

        connection.set_authenticator(Box::new(Accept));
        connection.create().unwrap();
        assert!(connection.is_open());
    }
}
