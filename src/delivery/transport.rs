use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeromq::util::PeerIdentity;
use zeromq::{DealerSocket, Socket, SocketOptions, SocketRecv, SocketSend, ZmqMessage};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("could not connect to any of {0:?}")]
    NoServers(Vec<String>),

    #[error("not connected")]
    NotConnected,

    #[error("empty message")]
    EmptyMessage,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Multipart message channel to the broker.
///
/// `recv` must be cancellation safe: the delivery client races it against a
/// response deadline and, between requests, against the next request.
#[async_trait]
pub trait BrokerTransport: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Drop the connection; the next `connect` starts from scratch.
    async fn disconnect(&mut self);

    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()>;

    async fn recv(&mut self) -> Result<Vec<Vec<u8>>>;
}

/// DEALER socket connected to every configured broker endpoint.
pub struct ZmqTransport {
    servers: Vec<String>,
    identity: String,
    socket: Option<DealerSocket>,
}

impl ZmqTransport {
    pub fn new(servers: Vec<String>, identity: String) -> Self {
        Self {
            servers,
            identity,
            socket: None,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }
}

#[async_trait]
impl BrokerTransport for ZmqTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut options = SocketOptions::default();
        options.peer_identity(PeerIdentity::try_from(self.identity.as_bytes().to_vec())?);
        let mut socket = DealerSocket::with_options(options);

        let mut connected = 0;
        for server in &self.servers {
            match socket.connect(server).await {
                Ok(()) => {
                    info!(server = %server, identity = %self.identity, "connected to broker");
                    connected += 1;
                }
                Err(e) => warn!(server = %server, error = %e, "failed to connect to broker"),
            }
        }

        if connected == 0 {
            return Err(TransportError::NoServers(self.servers.clone()));
        }
        self.socket = Some(socket);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            for e in socket.close().await {
                debug!(error = %e, "error while closing socket");
            }
        }
    }

    async fn send(&mut self, frames: Vec<Vec<u8>>) -> Result<()> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;

        let mut frames = frames.into_iter();
        let first = frames.next().ok_or(TransportError::EmptyMessage)?;
        let mut message = ZmqMessage::from(first);
        for frame in frames {
            message.push_back(frame.into());
        }
        socket.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<Vec<u8>>> {
        let socket = self.socket.as_mut().ok_or(TransportError::NotConnected)?;
        let message = socket.recv().await?;
        Ok(message.into_vec().into_iter().map(|b| b.to_vec()).collect())
    }
}
