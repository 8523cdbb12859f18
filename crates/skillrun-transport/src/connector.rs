use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::mpsc;

use skillrun_core::protocol::Frame;

use crate::error::ConnectionError;

/// An open link to the execution service.
///
/// Dropping `outbound` closes the link; `inbound` yields `None` once the
/// remote side (or the transport) has gone away.
pub struct Link {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

/// Opens authenticated links. The seam between the connection manager and the wire.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link, presenting `token` during the handshake.
    /// `send_queue` bounds the outbound buffer.
    async fn open(&self, token: &SecretString, send_queue: usize) -> Result<Link, ConnectionError>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> &str;
}
