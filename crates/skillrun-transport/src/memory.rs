//! In-process connector. Each `open` hands the server side of a fresh link to a
//! [`MemoryServer`], which plays the execution service in tests and demos.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;

use skillrun_core::protocol::Frame;

use crate::connector::{Connector, Link};
use crate::error::ConnectionError;

const INBOUND_QUEUE: usize = 256;

struct Peer {
    token: String,
    from_client: mpsc::Receiver<Frame>,
    to_client: mpsc::Sender<Frame>,
}

pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<Peer>,
    refuse: AtomicU32,
    opened: AtomicU32,
}

/// Server end of a [`MemoryConnector`].
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<Peer>,
    peer: Option<Peer>,
}

impl MemoryConnector {
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: AtomicU32::new(0),
                opened: AtomicU32::new(0),
            },
            MemoryServer {
                accept_rx,
                peer: None,
            },
        )
    }

    /// Fail the next `n` handshakes.
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Handshakes attempted so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, token: &SecretString, send_queue: usize) -> Result<Link, ConnectionError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::Handshake("refused".into()));
        }

        let (out_tx, out_rx) = mpsc::channel(send_queue);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        let peer = Peer {
            token: token.expose_secret().to_string(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| ConnectionError::Handshake("server gone".into()))?;

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn endpoint(&self) -> &str {
        "memory"
    }
}

impl MemoryServer {
    /// Wait for the next link and make it current. Returns the presented token.
    pub async fn accept(&mut self) -> Option<String> {
        let peer = self.accept_rx.recv().await?;
        let token = peer.token.clone();
        self.peer = Some(peer);
        Some(token)
    }

    /// Next frame the client sent on the current link.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.peer.as_mut()?.from_client.recv().await
    }

    /// A frame already queued by the client, without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.peer.as_mut()?.from_client.try_recv().ok()
    }

    /// Push an event to the client. Returns `false` when no link is open.
    pub async fn emit(&self, event: &str, data: serde_json::Value) -> bool {
        match &self.peer {
            Some(peer) => peer.to_client.send(Frame::new(event, data)).await.is_ok(),
            None => false,
        }
    }

    /// Drop the current link as if the network went away.
    pub fn drop_link(&mut self) {
        self.peer = None;
    }

    pub fn is_linked(&self) -> bool {
        self.peer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token() -> SecretString {
        SecretString::from("secret".to_string())
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut server) = MemoryConnector::pair();
        let mut link = connector.open(&token(), 4).await.unwrap();
        assert_eq!(server.accept().await.as_deref(), Some("secret"));

        link.outbound
            .send(Frame::new("skill:execute", json!({"skillId": "s1"})))
            .await
            .unwrap();
        let frame = server.recv().await.unwrap();
        assert_eq!(frame.event, "skill:execute");

        assert!(server.emit("response:chunk", json!({"chunk": "hi"})).await);
        let frame = link.inbound.recv().await.unwrap();
        assert_eq!(frame.data["chunk"], "hi");
    }

    #[tokio::test]
    async fn refused_handshakes_count_as_attempts() {
        let (connector, _server) = MemoryConnector::pair();
        connector.refuse_next(2);
        assert!(connector.open(&token(), 4).await.is_err());
        assert!(connector.open(&token(), 4).await.is_err());
        assert!(connector.open(&token(), 4).await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn dropping_the_link_closes_client_inbound() {
        let (connector, mut server) = MemoryConnector::pair();
        let mut link = connector.open(&token(), 4).await.unwrap();
        server.accept().await.unwrap();
        server.drop_link();
        assert!(link.inbound.recv().await.is_none());
        assert!(!server.emit("response:chunk", json!({})).await);
    }
}
