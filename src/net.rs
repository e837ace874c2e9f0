//! # Dial and Accept Helpers
//!
//! Thin wrappers that produce handshaken [`Connection`]s. They configure the
//! socket for low latency, run the role-distinct handshake under its timer
//! and hand the stream to the connection runtime. Anything beyond that (a
//! server's connection bookkeeping, retry policy) belongs to the embedding
//! application.

use crate::connection::Connection;
use crate::defaults;
use crate::error::TransportError;
use crate::params::Parameters;
use crate::wire::handshake::{self, Role};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

/// Apply the socket options both roles use
fn configure_socket(stream: TcpStream, params: &Parameters) -> Result<TcpStream, TransportError> {
    let std_stream = stream.into_std()?;
    let socket = socket2::Socket::from(std_stream.try_clone()?);
    socket.set_nodelay(true)?;
    let buffer = params.parcel_size().max(64 * 1024);
    socket.set_recv_buffer_size(buffer)?;
    socket.set_send_buffer_size(buffer)?;
    Ok(TcpStream::from_std(std_stream)?)
}

/// Connect to a peer and bring up a connection in the client role
pub async fn dial(
    addr: impl ToSocketAddrs,
    params: Parameters,
) -> Result<Connection, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    debug!(remote = %stream.peer_addr()?, "dialing");
    let mut stream = configure_socket(stream, &params)?;

    let requested = params.alive_period().as_millis() as u32;
    let peer_alive =
        handshake::exchange(&mut stream, Role::Client, requested, defaults::HANDSHAKE_TIMEOUT)
            .await?;
    Connection::start(stream, params, peer_alive)
}

/// Accepts inbound connections in the server role
pub struct Acceptor {
    listener: TcpListener,
    params: Parameters,
}

impl Acceptor {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        params: Parameters,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        debug!(local = %listener.local_addr()?, "listening");
        Ok(Self { listener, params })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one peer and bring up a connection. A failed handshake only
    /// fails this accept; the listener stays usable.
    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, remote) = self.listener.accept().await?;
        debug!(%remote, "inbound connection");
        let mut stream = configure_socket(stream, &self.params)?;

        let requested = self.params.alive_period().as_millis() as u32;
        let peer_alive =
            handshake::exchange(&mut stream, Role::Server, requested, defaults::HANDSHAKE_TIMEOUT)
                .await?;
        Connection::start(stream, self.params.clone(), peer_alive)
    }
}
