//! TCP transport with length-prefixed JSON framing.

use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::codec::{read_frame, read_frame_sized, write_encoded, write_frame};
use crate::error::{BridgeError, Result};

/// Default TCP port of the command bridge.
pub const DEFAULT_PORT: u16 = 55558;

/// A TCP connection wrapper with frame-level send and receive.
///
/// Reads are buffered; writes go straight to the socket one whole frame at
/// a time so a write timeout can tell whether any byte left.
#[derive(Debug)]
pub struct TcpConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    peer_addr: SocketAddr,
}

impl TcpConnection {
    /// Create a new connection from a TcpStream.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
            peer_addr,
        })
    }

    /// Connect to the first reachable address, applying `timeout` to the
    /// connect and to every subsequent read and write.
    pub fn connect(addrs: &[SocketAddr], timeout: Duration) -> Result<Self> {
        let mut last_err = None;

        for addr in addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    // Commands are small request/reply pairs.
                    stream.set_nodelay(true)?;
                    return Ok(Self::new(stream)?);
                }
                Err(source) => {
                    last_err = Some(BridgeError::ConnectFailed {
                        addr: *addr,
                        source,
                    })
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            BridgeError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "No address provided",
            ))
        }))
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.writer.local_addr()
    }

    /// Read one frame from the connection.
    pub fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T> {
        read_frame(&mut self.reader)
    }

    /// Read one frame, also returning its size on the wire.
    pub fn read_frame_sized<T: DeserializeOwned>(&mut self) -> Result<(T, usize)> {
        read_frame_sized(&mut self.reader)
    }

    /// Write one frame to the connection, returning the bytes written.
    pub fn write_frame<T: Serialize + ?Sized>(&mut self, payload: &T) -> Result<usize> {
        write_frame(&mut self.writer, payload)
    }

    /// Write a frame previously produced by [`crate::codec::encode`].
    pub fn write_encoded(&mut self, frame: &[u8]) -> Result<()> {
        write_encoded(&mut self.writer, frame)
    }

    /// Shutdown the connection.
    pub fn shutdown(&self) -> io::Result<()> {
        self.writer.shutdown(Shutdown::Both)
    }
}

/// A framed TCP listener, for peers speaking the bridge protocol.
#[derive(Debug)]
pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// Bind to an address and start listening.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept a new connection.
    pub fn accept(&self) -> Result<(TcpConnection, SocketAddr)> {
        let (stream, addr) = self.listener.accept()?;
        let connection = TcpConnection::new(stream)?;
        Ok((connection, addr))
    }

    /// Set non-blocking mode for the listener.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.listener.set_nonblocking(nonblocking)
    }

    /// Get an iterator over incoming connections.
    pub fn incoming(&self) -> impl Iterator<Item = Result<TcpConnection>> + '_ {
        self.listener.incoming().map(|result| {
            result
                .map_err(BridgeError::from)
                .and_then(|stream| TcpConnection::new(stream).map_err(BridgeError::from))
        })
    }
}
