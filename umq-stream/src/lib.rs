#![deny(unsafe_code)]

//! Byte-stream transport for UMQ peers.
//!
//! Wraps any `AsyncRead + AsyncWrite` stream in length-prefixed framing
//! (see [`framing`]) and exposes it as the [`umq_peer::Connection`]
//! capability, plus TCP entry points:
//!
//! ```no_run
//! use umq_peer::Peer;
//!
//! async fn client() -> std::io::Result<()> {
//!     let conn = umq_stream::connect("127.0.0.1:9301").await?;
//!     let (peer, welcome) = Peer::start_client(conn, "hi", Vec::new());
//!     let welcome = welcome.await.expect("rejected");
//!     println!("connected: {}", welcome.text);
//!     # let _ = peer;
//!     Ok(())
//! }
//! ```

pub mod framing;

mod connection;
pub use connection::StreamConnection;

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::debug;

/// Connect to a UMQ peer over TCP.
pub async fn connect(addr: impl ToSocketAddrs) -> io::Result<StreamConnection> {
    let stream = TcpStream::connect(addr).await?;
    let _ = stream.set_nodelay(true);
    debug!(peer = ?stream.peer_addr().ok(), "connected");
    Ok(StreamConnection::new(stream))
}

/// A TCP listener producing [`StreamConnection`]s.
pub struct StreamListener {
    inner: TcpListener,
}

impl StreamListener {
    /// Bind a listening socket.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<StreamListener> {
        let inner = TcpListener::bind(addr).await?;
        Ok(StreamListener { inner })
    }

    /// The bound address (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept one connection.
    pub async fn accept(&self) -> io::Result<(StreamConnection, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        let _ = stream.set_nodelay(true);
        debug!(%addr, "accepted");
        Ok((StreamConnection::new(stream), addr))
    }
}
