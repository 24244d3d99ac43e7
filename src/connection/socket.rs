use std::{
    fmt, io,
    net::{Shutdown, TcpStream},
    time::{Duration, Instant},
};

use log::debug;

use crate::protocol::TcpTransport;

use super::Endpoint;

/// Send and receive buffer size requested for every socket.
pub const SOCKET_BUFFER_SIZE: usize = 128 * 1024;

/// Identifies a socket for the lifetime of its [`Connection`](super::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u64);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One pooled socket. Closed records stay in the pool.
pub struct Socket {
    pub id: SocketId,
    pub endpoint: Endpoint,
    pub open: bool,
    pub created_at: Instant,
    pub user_timeout: Duration,
    /// Set once a handshake has completed on this socket.
    pub handshaken: bool,
    stream: Option<TcpStream>,
    transport: Option<TcpTransport>,
}

impl Socket {
    pub(crate) fn new(
        id: SocketId,
        endpoint: Endpoint,
        stream: TcpStream,
        user_timeout: Duration,
    ) -> io::Result<Self> {
        let transport = TcpTransport::from_stream(&stream)?;
        Ok(Self {
            id,
            endpoint,
            open: true,
            created_at: Instant::now(),
            user_timeout,
            handshaken: false,
            stream: Some(stream),
            transport: Some(transport),
        })
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn timed_out(&self) -> bool {
        self.age() >= self.user_timeout
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Protocol version in force on this socket's stream.
    pub fn protocol_version(&self) -> Option<u32> {
        self.transport.as_ref().map(TcpTransport::version)
    }

    pub(crate) fn transport_mut(&mut self) -> Option<&mut TcpTransport> {
        self.transport.as_mut()
    }

    /// Release the OS handle and the streams built on it.
    pub(crate) fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("closing socket {} to {}", self.id, self.endpoint);
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.transport = None;
        self.open = false;
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("open", &self.open)
            .field("age", &self.age())
            .field("user_timeout", &self.user_timeout)
            .field("handshaken", &self.handshaken)
            .finish()
    }
}

/// Apply no-delay, I/O timeouts, buffer sizes and keepalive.
pub(crate) fn configure(stream: &TcpStream, io_timeout: Option<Duration>) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(io_timeout)?;
    stream.set_write_timeout(io_timeout)?;

    #[cfg(unix)]
    {
        let size = SOCKET_BUFFER_SIZE as libc::c_int;
        set_option(stream, libc::SO_SNDBUF, size)?;
        set_option(stream, libc::SO_RCVBUF, size)?;
        set_option(stream, libc::SO_KEEPALIVE, 1)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_option(stream: &TcpStream, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `stream` for the duration of the call and `value`
    // outlives it; the length matches the pointed-to type.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn close_releases_streams_but_keeps_identity() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let stream = TcpStream::connect(address).unwrap();
        configure(&stream, Some(Duration::from_secs(5))).unwrap();
        assert!(stream.nodelay().unwrap());

        let endpoint = Endpoint::new("127.0.0.1", address.port());
        let mut socket = Socket::new(SocketId(3), endpoint.clone(), stream, Duration::ZERO).unwrap();
        assert!(socket.open);
        assert!(socket.timed_out());

        socket.close();
        assert!(!socket.open);
        assert!(socket.stream().is_none());
        assert!(socket.transport_mut().is_none());
        assert_eq!(socket.endpoint, endpoint);
        assert_eq!(socket.id, SocketId(3));
    }
}
