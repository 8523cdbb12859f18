//! Execution orchestrator: the per-surface state machine.
//!
//! One orchestrator drives one execution surface. It validates and sends
//! `skill:execute`, advances through [`ExecutionStage`] as routed turn events
//! arrive, owns the stream buffer and conversation, and broadcasts
//! [`ExecutionEvent`]s for whoever renders the surface.
//!
//! Every send opens a new [`TurnId`]. Handlers registered for an older turn
//! may still fire after a cancel; their events are recognised as stale and
//! dropped. A fresh run cancelled before `response:start` has no id to cancel
//! by, so the surface remembers it and cancels it once the server names it.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use skillrun_core::protocol::{
    CancelRequest, DisconnectNotice, ExecutionRequest, RequestTarget, ResponseChunk,
    ResponseComplete, ResponseError, ResponseStart, RESPONSE_COMPLETE, RESPONSE_ERROR,
    RESPONSE_START, SKILL_CANCEL, SKILL_EXECUTE,
};
use skillrun_core::{
    ConversationTurn, DocumentId, ExecutionEvent, ExecutionStage, InteractionId, ParameterValues,
    Skill, SurfaceId,
};
use skillrun_settings::ExecutionSettings;
use skillrun_transport::{
    ConnectionError, ConnectionManager, EventDispatcher, SubscriptionId, TurnId, TurnSink,
};

use crate::buffer::StreamBuffer;
use crate::conversation::{Conversation, Plan, UserAction};
use crate::error::EngineError;
use crate::params::{self, AmbientContext};

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct ExecutionConfig {
    /// Delay of each local pacing step. Zero skips pacing.
    pub stage_pacing: Duration,
    /// Fail a turn after this long without an inbound event. `None` disables the guard.
    pub idle_timeout: Option<Duration>,
    pub event_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self::from(&ExecutionSettings::default())
    }
}

impl From<&ExecutionSettings> for ExecutionConfig {
    fn from(settings: &ExecutionSettings) -> Self {
        Self {
            stage_pacing: settings.stage_pacing(),
            idle_timeout: settings.idle_timeout(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Point-in-time view of a surface.
#[derive(Clone, Debug)]
pub struct ExecutionSnapshot {
    pub stage: ExecutionStage,
    pub interaction_id: Option<InteractionId>,
    /// Provisional while in flight, canonical once completed.
    pub buffer: String,
    pub turns: Vec<ConversationTurn>,
    pub last_error: Option<EngineError>,
    pub document_id: Option<DocumentId>,
    pub ended: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TurnKind {
    Fresh,
    FollowUp,
    End,
}

impl TurnKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::FollowUp => "follow_up",
            Self::End => "end",
        }
    }
}

/// The turn currently outstanding. Dropping it stops its watchdog.
struct ActiveTurn {
    id: TurnId,
    kind: TurnKind,
    /// `skill:execute` has gone out (or is about to).
    sent: bool,
    last_event: Instant,
    watchdog: Option<CancellationToken>,
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
    }
}

/// Fresh runs cancelled after `skill:execute` went out but before the server
/// named them. Executes are answered in send order, so the next
/// `response:start` or `response:error` belongs to the oldest unanswered run.
#[derive(Default)]
struct Orphans {
    /// Link the runs below were sent on. A new link drops them all.
    epoch: u64,
    unanswered: usize,
    /// Named late and cancelled; their completions are dropped.
    abandoned: HashSet<InteractionId>,
    /// The abandoned run still streaming. Its chunks and final error are dropped.
    draining: Option<InteractionId>,
}

impl Orphans {
    fn on_link(&mut self, epoch: u64) -> &mut Self {
        if self.epoch != epoch {
            *self = Self {
                epoch,
                ..Self::default()
            };
        }
        self
    }
}

struct SurfaceState {
    stage: ExecutionStage,
    last_turn: TurnId,
    active: Option<ActiveTurn>,
    buffer: StreamBuffer,
    conversation: Conversation,
    last_error: Option<EngineError>,
    document_id: Option<DocumentId>,
    orphans: Orphans,
}

impl SurfaceState {
    fn is_current(&self, turn: TurnId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == turn)
    }

    fn open_turn(&mut self, kind: TurnKind) -> TurnId {
        self.last_turn = self.last_turn.next();
        self.active = Some(ActiveTurn {
            id: self.last_turn,
            kind,
            sent: false,
            last_event: Instant::now(),
            watchdog: None,
        });
        self.last_turn
    }

    fn touch(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.last_event = Instant::now();
        }
    }
}

struct Shared {
    surface_id: SurfaceId,
    skill: Skill,
    target: RequestTarget,
    connection: ConnectionManager,
    dispatcher: EventDispatcher,
    config: ExecutionConfig,
    state: Mutex<SurfaceState>,
    stage_tx: watch::Sender<ExecutionStage>,
    events: broadcast::Sender<ExecutionEvent>,
    me: Weak<Shared>,
    /// Connection subscriptions that catch a cancelled run's late answers
    /// while no turn of this surface is on the wire.
    orphan_guard: Mutex<Vec<(&'static str, SubscriptionId)>>,
}

/// Handle to one execution surface. Clones share the surface.
#[derive(Clone)]
pub struct ExecutionOrchestrator {
    shared: Arc<Shared>,
}

impl ExecutionOrchestrator {
    pub fn new(
        skill: Skill,
        ctx: &AmbientContext,
        connection: ConnectionManager,
        config: ExecutionConfig,
    ) -> Self {
        let target = RequestTarget {
            skill_id: skill.id.clone(),
            team_id: ctx.team_id.clone(),
            customer_id: ctx.customer_id(),
        };
        let (stage_tx, _) = watch::channel(ExecutionStage::Idle);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let sink: Weak<dyn TurnSink> = weak.clone();
            Shared {
                surface_id: SurfaceId::new(),
                skill,
                target,
                dispatcher: EventDispatcher::with_sink(connection.clone(), sink),
                connection,
                config,
                state: Mutex::new(SurfaceState {
                    stage: ExecutionStage::Idle,
                    last_turn: TurnId::default(),
                    active: None,
                    buffer: StreamBuffer::new(),
                    conversation: Conversation::new(),
                    last_error: None,
                    document_id: None,
                    orphans: Orphans::default(),
                }),
                stage_tx,
                events,
                me: weak.clone(),
                orphan_guard: Mutex::new(Vec::new()),
            }
        });
        Self { shared }
    }

    pub fn surface_id(&self) -> &SurfaceId {
        &self.shared.surface_id
    }

    pub fn skill(&self) -> &Skill {
        &self.shared.skill
    }

    pub fn stage(&self) -> ExecutionStage {
        self.shared.state.lock().stage
    }

    pub fn watch_stage(&self) -> watch::Receiver<ExecutionStage> {
        self.shared.stage_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.shared.events.subscribe()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot {
        let state = self.shared.state.lock();
        ExecutionSnapshot {
            stage: state.stage,
            interaction_id: state.conversation.interaction_id().cloned(),
            buffer: state.buffer.as_str().to_string(),
            turns: state.conversation.turns().to_vec(),
            last_error: state.last_error.clone(),
            document_id: state.document_id.clone(),
            ended: state.conversation.is_ended(),
        }
    }

    /// Resolve once the surface is `completed` or `idle`.
    pub async fn wait_settled(&self) -> ExecutionStage {
        let mut rx = self.shared.stage_tx.subscribe();
        let settled = rx.wait_for(|stage| stage.is_settled()).await.map(|s| *s);
        settled.unwrap_or_else(|_| self.stage())
    }

    /// Start a fresh execution with `values`.
    ///
    /// Validation runs first; a failure leaves the stage untouched and sends
    /// nothing. From `completed` the previous interaction and its turns are
    /// discarded.
    #[instrument(skip_all, fields(skill_id = %self.shared.skill.id, surface_id = %self.shared.surface_id))]
    pub async fn start(
        &self,
        values: ParameterValues,
        reference_document: Option<DocumentId>,
    ) -> Result<(), EngineError> {
        let shared = &self.shared;
        params::validate(&shared.skill, &values).into_result()?;

        let turn = {
            let mut state = shared.state.lock();
            state
                .conversation
                .plan(&UserAction::Execute, state.stage, shared.skill.multi_turn)?;
            if !shared.connection.is_connected() {
                return Err(ConnectionError::NotConnected.into());
            }
            let turn = state.open_turn(TurnKind::Fresh);
            state.conversation.reset();
            state.buffer.clear();
            state.last_error = None;
            state.document_id = None;
            shared.set_stage(&mut state, ExecutionStage::Preparing);
            turn
        };
        info!(%turn, "execution starting");

        self.pace(turn).await?;
        shared.advance(turn, ExecutionStage::Initiating)?;
        let request = ExecutionRequest::fresh(&shared.target, values, reference_document);

        self.pace(turn).await?;
        shared.advance(turn, ExecutionStage::Waiting)?;
        self.dispatch(turn, &request)
    }

    /// Continue the interaction with a user message. The user turn is appended
    /// immediately and rolled back if the turn fails.
    #[instrument(skip_all, fields(skill_id = %self.shared.skill.id, surface_id = %self.shared.surface_id))]
    pub fn send_follow_up(&self, message: impl Into<String>) -> Result<(), EngineError> {
        let shared = &self.shared;
        let (turn, request) = {
            let mut state = shared.state.lock();
            let plan = state.conversation.plan(
                &UserAction::FollowUp(message.into()),
                state.stage,
                shared.skill.multi_turn,
            )?;
            let Plan::FollowUp {
                interaction_id,
                message,
            } = plan
            else {
                return Err(EngineError::NoInteraction);
            };
            if !shared.connection.is_connected() {
                return Err(ConnectionError::NotConnected.into());
            }

            let turn = state.open_turn(TurnKind::FollowUp);
            state.buffer.clear();
            state.last_error = None;
            let user_turn = state.conversation.push_pending_user(message.clone());
            shared.emit(ExecutionEvent::TurnAppended {
                surface_id: shared.surface_id.clone(),
                turn: user_turn,
            });
            shared.set_stage(&mut state, ExecutionStage::Receiving);
            (
                turn,
                ExecutionRequest::follow_up(&shared.target, interaction_id, message),
            )
        };
        info!(%turn, "follow-up sent");
        self.dispatch(turn, &request)
    }

    /// Ask the server to close the interaction. It answers with a summary
    /// through the usual response sequence; no follow-ups are accepted after.
    #[instrument(skip_all, fields(skill_id = %self.shared.skill.id, surface_id = %self.shared.surface_id))]
    pub fn end_conversation(&self) -> Result<(), EngineError> {
        let shared = &self.shared;
        let (turn, request) = {
            let mut state = shared.state.lock();
            let plan = state
                .conversation
                .plan(&UserAction::End, state.stage, shared.skill.multi_turn)?;
            let Plan::End { interaction_id } = plan else {
                return Err(EngineError::NoInteraction);
            };
            if !shared.connection.is_connected() {
                return Err(ConnectionError::NotConnected.into());
            }

            let turn = state.open_turn(TurnKind::End);
            state.buffer.clear();
            state.last_error = None;
            state.conversation.mark_ended();
            shared.set_stage(&mut state, ExecutionStage::Waiting);
            (
                turn,
                ExecutionRequest::end_conversation(&shared.target, interaction_id),
            )
        };
        info!(%turn, "conversation end requested");
        self.dispatch(turn, &request)
    }

    /// Return to the never-executed state. An in-flight turn is cancelled first.
    pub fn start_new_conversation(&self) {
        let shared = &self.shared;
        let plan = {
            let state = shared.state.lock();
            state.conversation.plan(
                &UserAction::NewConversation,
                state.stage,
                shared.skill.multi_turn,
            )
        };
        if let Ok(Plan::Reset {
            cancel_in_flight: true,
        }) = plan
        {
            self.cancel();
        }
        let mut state = shared.state.lock();
        state.conversation.reset();
        state.buffer.clear();
        state.last_error = None;
        state.document_id = None;
        if state.stage != ExecutionStage::Idle {
            shared.set_stage(&mut state, ExecutionStage::Idle);
        }
        info!(surface_id = %shared.surface_id, "new conversation");
    }

    /// Reset to `idle` without waiting for the server.
    ///
    /// The turn's handlers are removed before returning, so late events for it
    /// are dropped. `skill:cancel` goes out when a turn was in flight and an
    /// interaction id is known. A fresh run already sent but not yet named is
    /// cancelled when its `response:start` arrives, and the rest of its output
    /// is swallowed. A failed cancel send is logged, not returned. Returns
    /// `false` (and does nothing) when already idle.
    pub fn cancel(&self) -> bool {
        let shared = &self.shared;
        let (in_flight, turn, interaction_id, orphaned) = {
            let mut state = shared.state.lock();
            if state.stage == ExecutionStage::Idle {
                return false;
            }
            let in_flight = state.stage.is_in_flight();
            let active = state.active.take();
            let turn = active.as_ref().map(|a| a.id);
            let sent = active.as_ref().is_some_and(|a| a.sent);
            if active.is_some_and(|a| a.kind == TurnKind::End) {
                state.conversation.reopen();
            }
            state.conversation.rollback_pending();
            shared.set_stage(&mut state, ExecutionStage::Idle);
            let interaction_id = state.conversation.interaction_id().cloned();
            let orphaned = in_flight && sent && interaction_id.is_none();
            if orphaned {
                state
                    .orphans
                    .on_link(shared.connection.link_epoch())
                    .unanswered += 1;
                debug!("cancelled before the server assigned an interaction");
            }
            shared.emit(ExecutionEvent::Cancelled {
                surface_id: shared.surface_id.clone(),
                interaction_id: interaction_id.clone(),
            });
            (in_flight, turn, interaction_id, orphaned)
        };
        if orphaned {
            shared.arm_orphan_guard();
        }
        if let Some(turn) = turn {
            shared.dispatcher.finish_turn(turn);
        }
        if let (true, Some(interaction_id)) = (in_flight, interaction_id) {
            shared.send_cancel(&interaction_id);
        }
        true
    }

    /// One pacing step. Fails with `Cancelled` if the turn was superseded meanwhile.
    async fn pace(&self, turn: TurnId) -> Result<(), EngineError> {
        let pacing = self.shared.config.stage_pacing;
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        if self.shared.state.lock().is_current(turn) {
            Ok(())
        } else {
            Err(EngineError::Cancelled)
        }
    }

    /// Register the turn's handlers, then send. A failed send ends the turn.
    ///
    /// The turn is marked sent before its handlers exist, so the orphan guard
    /// and the turn handlers never both act on one frame. Once marked, the
    /// request goes out even if a cancel lands in between; that cancel has
    /// already counted it as a run to cancel by id later.
    fn dispatch(&self, turn: TurnId, request: &ExecutionRequest) -> Result<(), EngineError> {
        let shared = &self.shared;
        let current = {
            let mut state = shared.state.lock();
            match state.active.as_mut() {
                Some(active) if active.id == turn => {
                    active.sent = true;
                    true
                }
                _ => false,
            }
        };
        if !current {
            return Err(EngineError::Cancelled);
        }
        if let Err(e) = shared.dispatcher.begin_turn(turn) {
            let err = EngineError::from(e);
            shared.fail_turn(turn, err.clone());
            return Err(err);
        }
        if let Err(e) = shared.connection.send(SKILL_EXECUTE, request) {
            let err = EngineError::from(e);
            shared.fail_turn(turn, err.clone());
            return Err(err);
        }
        debug!(%turn, fresh = request.is_fresh(), "skill:execute sent");
        if !shared.state.lock().is_current(turn) {
            shared.dispatcher.finish_turn(turn);
            return Err(EngineError::Cancelled);
        }
        self.arm_watchdog(turn);
        Ok(())
    }

    /// Fail `turn` with `Timeout` once no inbound event arrived for `idle_timeout`.
    fn arm_watchdog(&self, turn: TurnId) {
        let Some(timeout) = self.shared.config.idle_timeout else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(%turn, "no runtime, turn runs without a timeout");
            return;
        };
        let cancel = CancellationToken::new();
        {
            let mut state = self.shared.state.lock();
            match state.active.as_mut() {
                Some(active) if active.id == turn => active.watchdog = Some(cancel.clone()),
                _ => return,
            }
        }

        let weak = Arc::downgrade(&self.shared);
        handle.spawn(async move {
            loop {
                let deadline = {
                    let Some(shared) = weak.upgrade() else { return };
                    let state = shared.state.lock();
                    match state.active.as_ref() {
                        Some(active) if active.id == turn => active.last_event + timeout,
                        _ => return,
                    }
                };
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep_until(deadline) => {}
                }
                let Some(shared) = weak.upgrade() else { return };
                let expired = {
                    let state = shared.state.lock();
                    state
                        .active
                        .as_ref()
                        .is_some_and(|a| a.id == turn && a.last_event + timeout <= Instant::now())
                };
                if expired {
                    shared.fail_turn(turn, EngineError::Timeout(timeout));
                    return;
                }
            }
        });
    }
}

impl Shared {
    fn emit(&self, event: ExecutionEvent) {
        if self.events.send(event).is_err() {
            debug!("no execution event receivers");
        }
    }

    fn send_cancel(&self, interaction_id: &InteractionId) {
        let request = CancelRequest {
            interaction_id: interaction_id.clone(),
        };
        match self.connection.send(SKILL_CANCEL, &request) {
            Ok(()) => info!(%interaction_id, "cancel sent"),
            Err(e) => warn!(%interaction_id, error = %e, "failed to send cancel"),
        }
    }

    fn set_stage(&self, state: &mut SurfaceState, to: ExecutionStage) -> bool {
        let from = state.stage;
        if let Err(e) = from.transition(to) {
            warn!(error = %e, "stage transition rejected");
            return false;
        }
        state.stage = to;
        self.stage_tx.send_replace(to);
        debug!(%from, %to, "stage changed");
        self.emit(ExecutionEvent::StageChanged {
            surface_id: self.surface_id.clone(),
            from,
            to,
        });
        true
    }

    /// Move the start pipeline forward if `turn` is still the active one.
    fn advance(&self, turn: TurnId, to: ExecutionStage) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.is_current(turn) {
            debug!(%turn, %to, "turn superseded during preparation");
            return Err(EngineError::Cancelled);
        }
        self.set_stage(&mut state, to);
        Ok(())
    }

    /// Subscribe the orphan guard unless it is already listening.
    fn arm_orphan_guard(&self) {
        let mut guard = self.orphan_guard.lock();
        if !guard.is_empty() {
            return;
        }
        let me = self.me.clone();
        let on_start = move |data: &serde_json::Value| {
            let Some(shared) = me.upgrade() else { return };
            if let Ok(start) = serde_json::from_value::<ResponseStart>(data.clone()) {
                shared.guard_start(start);
            }
        };
        let me = self.me.clone();
        let on_complete = move |data: &serde_json::Value| {
            let Some(shared) = me.upgrade() else { return };
            if let Ok(complete) = serde_json::from_value::<ResponseComplete>(data.clone()) {
                shared.guard_complete(complete);
            }
        };
        let me = self.me.clone();
        let on_error = move |_: &serde_json::Value| {
            if let Some(shared) = me.upgrade() {
                shared.guard_error();
            }
        };
        guard.push((RESPONSE_START, self.connection.subscribe(RESPONSE_START, on_start)));
        guard.push((
            RESPONSE_COMPLETE,
            self.connection.subscribe(RESPONSE_COMPLETE, on_complete),
        ));
        guard.push((RESPONSE_ERROR, self.connection.subscribe(RESPONSE_ERROR, on_error)));
        debug!(surface_id = %self.surface_id, "orphan guard armed");
    }

    /// Drop the guard once no cancelled run is left to hear from.
    fn release_orphan_guard(&self) {
        let settled = {
            let mut state = self.state.lock();
            let orphans = state.orphans.on_link(self.connection.link_epoch());
            orphans.unanswered == 0 && orphans.draining.is_none()
        };
        if !settled {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.orphan_guard.lock());
        if subscriptions.is_empty() {
            return;
        }
        for (event, id) in subscriptions {
            self.connection.unsubscribe(event, Some(id));
        }
        debug!(surface_id = %self.surface_id, "orphan guard released");
    }

    /// The guard only acts while no turn of this surface is on the wire;
    /// otherwise the turn's own handlers see the frame.
    fn guard_start(&self, start: ResponseStart) {
        let abandoned = {
            let mut state = self.state.lock();
            if state.active.as_ref().is_some_and(|a| a.sent) {
                return;
            }
            let orphans = state.orphans.on_link(self.connection.link_epoch());
            if orphans.unanswered == 0 || orphans.abandoned.contains(&start.interaction_id) {
                None
            } else {
                orphans.unanswered -= 1;
                orphans.abandoned.insert(start.interaction_id.clone());
                orphans.draining = Some(start.interaction_id.clone());
                Some(start.interaction_id)
            }
        };
        if let Some(interaction_id) = abandoned {
            info!(%interaction_id, "late start of a cancelled run");
            self.send_cancel(&interaction_id);
        }
        self.release_orphan_guard();
    }

    fn guard_complete(&self, complete: ResponseComplete) {
        {
            let mut state = self.state.lock();
            if state.active.as_ref().is_some_and(|a| a.sent) {
                return;
            }
            let orphans = state.orphans.on_link(self.connection.link_epoch());
            if orphans.abandoned.remove(&complete.interaction_id)
                && orphans.draining.as_ref() == Some(&complete.interaction_id)
            {
                orphans.draining = None;
            }
        }
        self.release_orphan_guard();
    }

    fn guard_error(&self) {
        {
            let mut state = self.state.lock();
            if state.active.as_ref().is_some_and(|a| a.sent) {
                return;
            }
            let orphans = state.orphans.on_link(self.connection.link_epoch());
            if orphans.draining.take().is_none() && orphans.unanswered > 0 {
                orphans.unanswered -= 1;
            }
        }
        self.release_orphan_guard();
    }

    /// Terminal failure of `turn`: stage idle, buffer kept, optimistic user turn
    /// removed. Returns `false` when `turn` is no longer current.
    fn fail_turn(&self, turn: TurnId, error: EngineError) -> bool {
        {
            let mut state = self.state.lock();
            if !state.is_current(turn) {
                debug!(%turn, "stale failure dropped");
                return false;
            }
            if let Some(active) = state.active.take() {
                if active.kind == TurnKind::End {
                    state.conversation.reopen();
                }
                warn!(
                    %turn,
                    kind = active.kind.as_str(),
                    interaction_id = ?state.conversation.interaction_id(),
                    error_kind = error.error_kind(),
                    error = %error,
                    "turn failed"
                );
            }
            state.conversation.rollback_pending();
            state.last_error = Some(error.clone());
            if state.stage != ExecutionStage::Idle {
                self.set_stage(&mut state, ExecutionStage::Idle);
            }
            self.emit(ExecutionEvent::Failed {
                surface_id: self.surface_id.clone(),
                kind: error.error_kind().to_string(),
                message: error.to_string(),
                retryable: error.is_retryable(),
            });
        }
        self.dispatcher.finish_turn(turn);
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for (event, id) in self.orphan_guard.get_mut().drain(..) {
            self.connection.unsubscribe(event, Some(id));
        }
    }
}

impl TurnSink for Shared {
    fn on_start(&self, turn: TurnId, start: ResponseStart) -> bool {
        let abandoned = {
            let mut state = self.state.lock();
            if !state.is_current(turn) {
                debug!(%turn, "stale response:start dropped");
                return false;
            }
            let orphans = state.orphans.on_link(self.connection.link_epoch());
            if orphans.abandoned.contains(&start.interaction_id) {
                debug!(%turn, interaction_id = %start.interaction_id, "repeated start of a cancelled run dropped");
                return false;
            }
            if orphans.unanswered > 0 {
                orphans.unanswered -= 1;
                orphans.abandoned.insert(start.interaction_id.clone());
                orphans.draining = Some(start.interaction_id.clone());
                start.interaction_id
            } else {
                orphans.draining = None;
                state.touch();
                state.conversation.set_interaction(start.interaction_id);
                if state.stage == ExecutionStage::Waiting {
                    self.set_stage(&mut state, ExecutionStage::Receiving);
                }
                if let Some(interaction_id) = state.conversation.interaction_id().cloned() {
                    info!(%turn, %interaction_id, "response started");
                    self.emit(ExecutionEvent::InteractionStarted {
                        surface_id: self.surface_id.clone(),
                        interaction_id,
                    });
                }
                return true;
            }
        };
        info!(%turn, interaction_id = %abandoned, "late start of a cancelled run");
        self.send_cancel(&abandoned);
        false
    }

    fn on_chunk(&self, turn: TurnId, chunk: ResponseChunk) {
        let mut state = self.state.lock();
        if !state.is_current(turn) {
            debug!(%turn, "stale response:chunk dropped");
            return;
        }
        let epoch = self.connection.link_epoch();
        if let Some(draining) = &state.orphans.on_link(epoch).draining {
            debug!(%turn, interaction_id = %draining, "chunk of a cancelled run dropped");
            return;
        }
        state.touch();
        if state.stage == ExecutionStage::Waiting {
            self.set_stage(&mut state, ExecutionStage::Receiving);
        }
        state.buffer.push(&chunk.chunk);
        self.emit(ExecutionEvent::Chunk {
            surface_id: self.surface_id.clone(),
            text: chunk.chunk,
        });
    }

    fn on_complete(&self, turn: TurnId, complete: ResponseComplete) -> bool {
        {
            let mut state = self.state.lock();
            if !state.is_current(turn) {
                debug!(%turn, "stale response:complete dropped");
                return false;
            }
            let orphans = state.orphans.on_link(self.connection.link_epoch());
            if orphans.abandoned.remove(&complete.interaction_id) {
                if orphans.draining.as_ref() == Some(&complete.interaction_id) {
                    orphans.draining = None;
                }
                debug!(%turn, interaction_id = %complete.interaction_id, "completion of a cancelled run dropped");
                drop(state);
                self.release_orphan_guard();
                return false;
            }
            if let Some(own) = state.conversation.interaction_id() {
                if *own != complete.interaction_id {
                    debug!(
                        %turn,
                        interaction_id = %own,
                        received = %complete.interaction_id,
                        "completion for another interaction ignored"
                    );
                    return false;
                }
            }
            state.active = None;

            state.buffer.replace(complete.content.clone());
            state.document_id = complete.document_id.clone();
            if self.skill.multi_turn && state.conversation.interaction_id().is_some() {
                let assistant = state.conversation.push_assistant(complete.content.clone());
                self.emit(ExecutionEvent::TurnAppended {
                    surface_id: self.surface_id.clone(),
                    turn: assistant,
                });
            } else {
                state.conversation.confirm_pending();
            }
            self.set_stage(&mut state, ExecutionStage::Completed);
            info!(
                %turn,
                interaction_id = %complete.interaction_id,
                chunks = state.buffer.chunk_count(),
                "response complete"
            );
            self.emit(ExecutionEvent::Completed {
                surface_id: self.surface_id.clone(),
                interaction_id: complete.interaction_id,
                document_id: complete.document_id,
                content: complete.content,
            });
        }
        self.dispatcher.finish_turn(turn);
        true
    }

    fn on_error(&self, turn: TurnId, error: ResponseError) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_current(turn) {
                let orphans = state.orphans.on_link(self.connection.link_epoch());
                let swallowed = if let Some(draining) = orphans.draining.take() {
                    debug!(%turn, interaction_id = %draining, message = %error.message, "error of a cancelled run dropped");
                    true
                } else if orphans.unanswered > 0 {
                    orphans.unanswered -= 1;
                    debug!(%turn, message = %error.message, "error for a run cancelled before it started");
                    true
                } else {
                    false
                };
                if swallowed {
                    drop(state);
                    self.release_orphan_guard();
                    return false;
                }
            }
        }
        self.fail_turn(turn, EngineError::Protocol(error.message))
    }

    fn on_disconnect(&self, turn: TurnId, notice: DisconnectNotice) {
        self.fail_turn(turn, EngineError::ConnectionLost(notice.reason));
    }
}
