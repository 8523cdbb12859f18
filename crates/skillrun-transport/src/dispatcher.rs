//! Per-surface routing of turn events.
//!
//! A dispatcher binds one execution surface to the shared connection. Each turn
//! gets its own set of subscriptions tagged with a [`TurnId`]; beginning a new
//! turn or ending the current one removes them by id, so handlers never
//! accumulate across turns and other surfaces' handlers are never touched.
//!
//! `response:start`, `response:complete` and `response:error` are one-shot per
//! turn, but only once the sink accepts one. An event the sink declines (one
//! belonging to another interaction) leaves the handler armed for the real one.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use skillrun_core::protocol::{
    DisconnectNotice, ResponseChunk, ResponseComplete, ResponseError, ResponseStart, DISCONNECT,
    RESPONSE_CHUNK, RESPONSE_COMPLETE, RESPONSE_ERROR, RESPONSE_START,
};

use crate::connection::{ConnectionManager, SubscriptionId};
use crate::error::DispatchError;

/// Monotonic per-surface turn counter. Events tagged with a stale id are ignored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiver of routed turn events, implemented by an execution surface.
///
/// `on_start`, `on_complete` and `on_error` return whether the event was taken
/// for `turn`. Returning `false` keeps the turn's handler for that event armed.
pub trait TurnSink: Send + Sync {
    fn on_start(&self, turn: TurnId, start: ResponseStart) -> bool;
    fn on_chunk(&self, turn: TurnId, chunk: ResponseChunk);
    fn on_complete(&self, turn: TurnId, complete: ResponseComplete) -> bool;
    fn on_error(&self, turn: TurnId, error: ResponseError) -> bool;
    fn on_disconnect(&self, turn: TurnId, notice: DisconnectNotice);
}

struct ActiveTurn {
    turn: TurnId,
    subscriptions: Vec<(&'static str, SubscriptionId)>,
}

pub struct EventDispatcher {
    connection: ConnectionManager,
    sink: Mutex<Option<Weak<dyn TurnSink>>>,
    active: Mutex<Option<ActiveTurn>>,
}

impl EventDispatcher {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            sink: Mutex::new(None),
            active: Mutex::new(None),
        }
    }

    /// A dispatcher already bound to `sink`, for surfaces that own their dispatcher.
    pub fn with_sink(connection: ConnectionManager, sink: Weak<dyn TurnSink>) -> Self {
        Self {
            connection,
            sink: Mutex::new(Some(sink)),
            active: Mutex::new(None),
        }
    }

    /// Bind a surface. The dispatcher only holds a weak reference.
    pub fn attach(&self, sink: Weak<dyn TurnSink>) -> Result<(), DispatchError> {
        let mut slot = self.sink.lock();
        if slot.as_ref().is_some_and(|s| s.strong_count() > 0) {
            return Err(DispatchError::AlreadyAttached);
        }
        *slot = Some(sink);
        Ok(())
    }

    /// Unbind the surface and drop any turn subscriptions.
    pub fn detach(&self) -> Result<(), DispatchError> {
        if self.sink.lock().take().is_none() {
            return Err(DispatchError::NotAttached);
        }
        self.end_turn();
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub fn current_turn(&self) -> Option<TurnId> {
        self.active.lock().as_ref().map(|a| a.turn)
    }

    /// Subscribe the five turn handlers for `turn`, replacing any previous turn's.
    ///
    /// `disconnect` is one-shot. `response:start`, `response:complete` and
    /// `response:error` go quiet after the first event the sink accepts.
    /// `response:chunk` stays until the turn ends.
    pub fn begin_turn(&self, turn: TurnId) -> Result<(), DispatchError> {
        let sink = self.sink.lock().clone().ok_or(DispatchError::NotAttached)?;

        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            self.teardown(previous);
        }

        let conn = &self.connection;
        let subscriptions = vec![
            (
                RESPONSE_START,
                conn.subscribe(
                    RESPONSE_START,
                    route(&sink, turn, RESPONSE_START, true, |s, t, p: ResponseStart| {
                        s.on_start(t, p)
                    }),
                ),
            ),
            (
                RESPONSE_CHUNK,
                conn.subscribe(
                    RESPONSE_CHUNK,
                    route(&sink, turn, RESPONSE_CHUNK, false, |s, t, p: ResponseChunk| {
                        s.on_chunk(t, p);
                        true
                    }),
                ),
            ),
            (
                RESPONSE_COMPLETE,
                conn.subscribe(
                    RESPONSE_COMPLETE,
                    route(&sink, turn, RESPONSE_COMPLETE, true, |s, t, p: ResponseComplete| {
                        s.on_complete(t, p)
                    }),
                ),
            ),
            (
                RESPONSE_ERROR,
                conn.subscribe(
                    RESPONSE_ERROR,
                    route(&sink, turn, RESPONSE_ERROR, true, |s, t, p: ResponseError| {
                        s.on_error(t, p)
                    }),
                ),
            ),
            (
                DISCONNECT,
                conn.subscribe_once(
                    DISCONNECT,
                    route(&sink, turn, DISCONNECT, false, |s, t, p: DisconnectNotice| {
                        s.on_disconnect(t, p);
                        true
                    }),
                ),
            ),
        ];
        debug!(%turn, "turn handlers registered");
        *active = Some(ActiveTurn {
            turn,
            subscriptions,
        });
        Ok(())
    }

    /// Drop the current turn's subscriptions. Safe to call repeatedly.
    pub fn end_turn(&self) {
        let previous = self.active.lock().take();
        if let Some(previous) = previous {
            self.teardown(previous);
        }
    }

    /// Drop `turn`'s subscriptions if it is still the current turn. A newer
    /// turn registered in the meantime is left alone.
    pub fn finish_turn(&self, turn: TurnId) -> bool {
        let finished = {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|current| current.turn == turn) {
                active.take()
            } else {
                None
            }
        };
        match finished {
            Some(finished) => {
                self.teardown(finished);
                true
            }
            None => false,
        }
    }

    fn teardown(&self, active: ActiveTurn) {
        for (event, id) in active.subscriptions {
            self.connection.unsubscribe(event, Some(id));
        }
        debug!(turn = %active.turn, "turn handlers removed");
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            self.teardown(active);
        }
    }
}

/// Build a handler that decodes the payload and forwards it to a live sink.
/// A payload that fails to decode becomes a turn error. With `latch`, the
/// handler ignores everything after the first delivery the sink accepted.
fn route<T, F>(
    sink: &Weak<dyn TurnSink>,
    turn: TurnId,
    event: &'static str,
    latch: bool,
    deliver: F,
) -> impl Fn(&Value) + Send + Sync + 'static
where
    T: DeserializeOwned,
    F: Fn(&dyn TurnSink, TurnId, T) -> bool + Send + Sync + 'static,
{
    let sink = sink.clone();
    let taken = AtomicBool::new(false);
    move |data| {
        if taken.load(Ordering::Acquire) {
            return;
        }
        let Some(sink) = sink.upgrade() else { return };
        match serde_json::from_value::<T>(data.clone()) {
            Ok(payload) => {
                if deliver(sink.as_ref(), turn, payload) && latch {
                    taken.store(true, Ordering::Release);
                }
            }
            Err(e) => {
                warn!(%turn, event, error = %e, "malformed payload");
                let _ = sink.on_error(
                    turn,
                    ResponseError {
                        message: format!("malformed {event} payload"),
                    },
                );
            }
        }
    }
}
