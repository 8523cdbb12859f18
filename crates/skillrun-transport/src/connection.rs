//! The single duplex connection shared by every execution surface.
//!
//! Handlers are keyed by event name. Dispatch copies the matching handlers out
//! of the registry (dropping one-shot entries first) and runs them with no lock
//! held, so a handler may subscribe or unsubscribe freely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skillrun_core::protocol::{DisconnectNotice, Frame, DISCONNECT, RECONNECT};
use skillrun_settings::ConnectionSettings;

use crate::connector::{Connector, Link};
use crate::error::ConnectionError;

/// Callback for one event name. Receives the raw payload.
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by `subscribe`, used to remove exactly that handler later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub send_queue: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        Self {
            reconnect_attempts: settings.reconnect_attempts,
            reconnect_delay: settings.reconnect_delay(),
            send_queue: settings.send_queue.max(1),
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    outbound: RwLock<Option<mpsc::Sender<Frame>>>,
    handlers: DashMap<String, Vec<Subscription>>,
    next_id: AtomicU64,
    /// Bumped every time a link is installed.
    link_epoch: AtomicU64,
    /// Serializes connect/disconnect.
    lifecycle: tokio::sync::Mutex<()>,
    session: Mutex<Option<CancellationToken>>,
}

/// Owns the authenticated link, the handler registry and the reconnect supervisor.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                state,
                outbound: RwLock::new(None),
                handlers: DashMap::new(),
                next_id: AtomicU64::new(1),
                link_epoch: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                session: Mutex::new(None),
            }),
        }
    }

    /// Open the link. A no-op while already connected (or reconnecting).
    pub async fn connect(&self, token: SecretString) -> Result<(), ConnectionError> {
        let _guard = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != ConnectionState::Disconnected {
            debug!(?state, "connect ignored, link already active");
            return Ok(());
        }

        let endpoint = self.inner.connector.endpoint().to_string();
        self.inner.set_state(ConnectionState::Connecting);
        let link = match self
            .inner
            .connector
            .open(&token, self.inner.config.send_queue)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                self.inner.set_state(ConnectionState::Disconnected);
                warn!(endpoint = %endpoint, error = %e, "connect failed");
                return Err(e);
            }
        };

        let Link { outbound, inbound } = link;
        self.inner.install(outbound);

        let cancel = CancellationToken::new();
        if let Some(previous) = self.inner.session.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            inbound,
            token,
            cancel,
        ));
        info!(endpoint = %endpoint, "connected");
        Ok(())
    }

    /// Close the link and stop reconnecting. Raises `disconnect` with reason
    /// `client disconnect`. A no-op when nothing is open.
    pub async fn disconnect(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        let session = self.inner.session.lock().take();
        if let Some(cancel) = session {
            cancel.cancel();
        }
        let had_link = self.inner.outbound.write().take().is_some();
        if self.state() == ConnectionState::Disconnected && !had_link {
            return;
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("disconnected by client");
        self.inner.raise(
            DISCONNECT,
            &DisconnectNotice {
                reason: "client disconnect".into(),
            },
        );
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of links opened so far, reconnects included. Anything the server
    /// held for an older epoch died with that link.
    pub fn link_epoch(&self) -> u64 {
        self.inner.link_epoch.load(Ordering::Acquire)
    }

    /// Queue one event. Never waits: a full queue is reported, not awaited.
    pub fn send<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let frame = Frame::encode(event, payload).map_err(|e| ConnectionError::Encode {
            event: event.to_string(),
            reason: e.to_string(),
        })?;
        let outbound = self
            .inner
            .outbound
            .read()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;

        match outbound.try_send(frame) {
            Ok(()) => {
                debug!(event, "frame queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(event, "send queue full");
                Err(ConnectionError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Register a persistent handler for `event`.
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.register(event, false, Arc::new(handler))
    }

    /// Register a handler removed right before its first invocation.
    pub fn subscribe_once(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.register(event, true, Arc::new(handler))
    }

    /// Remove one handler by id, or every handler for `event` when `id` is `None`.
    /// Returns how many were removed.
    pub fn unsubscribe(&self, event: &str, id: Option<SubscriptionId>) -> usize {
        match id {
            None => self
                .inner
                .handlers
                .remove(event)
                .map(|(_, subs)| subs.len())
                .unwrap_or(0),
            Some(id) => {
                let Some(mut subs) = self.inner.handlers.get_mut(event) else {
                    return 0;
                };
                let before = subs.len();
                subs.retain(|s| s.id != id);
                before - subs.len()
            }
        }
    }

    /// Number of live handlers for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner.handlers.get(event).map(|s| s.len()).unwrap_or(0)
    }
}

impl Inner {
    fn install(&self, outbound: mpsc::Sender<Frame>) {
        *self.outbound.write() = Some(outbound);
        self.link_epoch.fetch_add(1, Ordering::AcqRel);
        self.set_state(ConnectionState::Connected);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    fn register(&self, event: &str, once: bool, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push(Subscription { id, once, handler });
        id
    }

    fn dispatch(&self, frame: &Frame) {
        let handlers: Vec<Handler> = {
            let Some(mut subs) = self.handlers.get_mut(&frame.event) else {
                debug!(event = %frame.event, "no handlers for event");
                return;
            };
            let handlers = subs.iter().map(|s| Arc::clone(&s.handler)).collect();
            subs.retain(|s| !s.once);
            handlers
        };
        for handler in handlers {
            handler(&frame.data);
        }
    }

    /// Dispatch a locally generated event.
    fn raise<T: Serialize>(&self, event: &str, payload: &T) {
        match Frame::encode(event, payload) {
            Ok(frame) => self.dispatch(&frame),
            Err(e) => error!(event, error = %e, "failed to encode local event"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(cancel) = self.session.get_mut().take() {
            cancel.cancel();
        }
    }
}

/// Pump inbound frames into handlers; on link loss raise `disconnect` and retry
/// with a fixed delay, raising `reconnect` on success.
async fn supervise(
    inner: Weak<Inner>,
    mut inbound: mpsc::Receiver<Frame>,
    token: SecretString,
    cancel: CancellationToken,
) {
    loop {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                frame = inbound.recv() => {
                    let Some(frame) = frame else { break };
                    let Some(strong) = inner.upgrade() else { return };
                    strong.dispatch(&frame);
                }
            }
        }

        let Some(strong) = inner.upgrade() else { return };
        if cancel.is_cancelled() {
            return;
        }
        strong.outbound.write().take();
        strong.set_state(ConnectionState::Disconnected);
        warn!(endpoint = %strong.connector.endpoint(), "connection lost");
        strong.raise(
            DISCONNECT,
            &DisconnectNotice {
                reason: "connection lost".into(),
            },
        );
        let connector = Arc::clone(&strong.connector);
        let config = strong.config.clone();
        drop(strong);

        let mut link = None;
        for attempt in 1..=config.reconnect_attempts {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(config.reconnect_delay) => {}
            }
            let Some(strong) = inner.upgrade() else { return };
            strong.set_state(ConnectionState::Connecting);
            drop(strong);

            match connector.open(&token, config.send_queue).await {
                Ok(opened) => {
                    link = Some(opened);
                    break;
                }
                Err(e) => {
                    warn!(attempt, max = config.reconnect_attempts, error = %e, "reconnect failed");
                    if let Some(strong) = inner.upgrade() {
                        strong.set_state(ConnectionState::Disconnected);
                    }
                }
            }
        }

        let Some(Link { outbound, inbound: next }) = link else {
            error!(attempts = config.reconnect_attempts, "giving up on reconnect");
            if let Some(strong) = inner.upgrade() {
                strong.set_state(ConnectionState::Disconnected);
            }
            return;
        };
        let Some(strong) = inner.upgrade() else { return };
        if cancel.is_cancelled() {
            return;
        }
        strong.install(outbound);
        info!(endpoint = %connector.endpoint(), "reconnected");
        strong.raise(RECONNECT, &serde_json::json!({}));
        inbound = next;
    }
}
