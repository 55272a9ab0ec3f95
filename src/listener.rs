// ABOUTME: Binds a TCP socket and produces one server-mode Connection per accepted peer
// ABOUTME: Tracks close handles for every connection it has produced so Listener::close() reaches all of them

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::info;

use crate::config::ConnectionConfig;
use crate::connection::{CloseHandle, Connection};
use crate::error::ConnectionError;

/// Binds a TCP socket and accepts incoming connections, producing a
/// server-mode `Connection` (data transfer disabled until the peer sends
/// `STARTDT_ACT`) per accepted peer.
pub struct Listener {
    listener: TcpListener,
    config: ConnectionConfig,
    handles: StdMutex<Vec<CloseHandle>>,
}

impl Listener {
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: ConnectionConfig) -> Result<Listener, ConnectionError> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        info!(local_addr = ?listener.local_addr().ok(), "listening");
        Ok(Listener {
            listener,
            config,
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// Accepts one TCP stream and constructs a server-mode `Connection` for
    /// it.
    pub async fn accept(&self) -> Result<(Connection, SocketAddr), ConnectionError> {
        let (socket, peer) = self.listener.accept().await?;
        let _ = socket.set_nodelay(true);
        let connection = Connection::new(socket, false, self.config);
        self.handles.lock().unwrap().push(connection.close_handle());
        Ok((connection, peer))
    }

    /// The local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ConnectionError> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Closes every `Connection` this listener has produced so far. Does not
    /// itself stop the listener from accepting further connections.
    pub fn close(&self) {
        for handle in self.handles.lock().unwrap().iter() {
            handle.close();
        }
    }
}
