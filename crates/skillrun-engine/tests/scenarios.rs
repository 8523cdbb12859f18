//! End-to-end surface behaviour against an in-memory execution service.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use skillrun_core::protocol::{
    RESPONSE_CHUNK, RESPONSE_COMPLETE, RESPONSE_ERROR, RESPONSE_START, SKILL_CANCEL, SKILL_EXECUTE,
};
use skillrun_core::{
    ExecutionEvent, ExecutionStage, ParameterSpec, ParameterType, ParameterValue, ParameterValues,
    Role, Skill, SkillId, TeamId,
};
use skillrun_engine::{
    prepare, AmbientContext, EngineError, ExecutionConfig, ExecutionOrchestrator, FieldError,
};
use skillrun_transport::{ConnectionConfig, ConnectionManager, MemoryConnector, MemoryServer};

fn skill(multi_turn: bool) -> Skill {
    Skill {
        id: SkillId::from_raw("s1"),
        name: "Discovery brief".into(),
        parameters: vec![ParameterSpec::new("topic", ParameterType::Text).required()],
        supports_streaming: true,
        multi_turn,
    }
}

fn topic(value: &str) -> ParameterValues {
    let mut values = ParameterValues::new();
    values.insert("topic".into(), ParameterValue::from(value));
    values
}

fn config() -> ExecutionConfig {
    ExecutionConfig {
        stage_pacing: Duration::ZERO,
        idle_timeout: None,
        ..Default::default()
    }
}

struct Harness {
    connection: ConnectionManager,
    server: MemoryServer,
}

impl Harness {
    async fn new() -> Self {
        let (connector, mut server) = MemoryConnector::pair();
        let connection = ConnectionManager::new(Arc::new(connector), ConnectionConfig::default());
        connection
            .connect(SecretString::from("token".to_string()))
            .await
            .unwrap();
        assert_eq!(server.accept().await.as_deref(), Some("token"));
        Self { connection, server }
    }

    fn surface(&self, multi_turn: bool) -> ExecutionOrchestrator {
        let ctx = AmbientContext::new(TeamId::from_raw("t1"));
        ExecutionOrchestrator::new(skill(multi_turn), &ctx, self.connection.clone(), config())
    }

    async fn expect_sent(&mut self, event: &str) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.server.recv())
            .await
            .expect("frame within timeout")
            .expect("link open");
        assert_eq!(frame.event, event);
        frame.data
    }

    async fn emit(&self, event: &str, data: Value) {
        assert!(self.server.emit(event, data).await);
    }
}

async fn until(
    events: &mut broadcast::Receiver<ExecutionEvent>,
    mut pred: impl FnMut(&ExecutionEvent) -> bool,
) -> ExecutionEvent {
    loop {
        let event = events.recv().await.unwrap();
        if pred(&event) {
            return event;
        }
    }
}

/// Run one fresh execution to completion with the given canonical content.
async fn complete_fresh(h: &mut Harness, orch: &ExecutionOrchestrator, content: &str) {
    complete_fresh_as(h, orch, "i1", content).await;
}

async fn complete_fresh_as(
    h: &mut Harness,
    orch: &ExecutionOrchestrator,
    interaction: &str,
    content: &str,
) {
    orch.start(topic("x"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    h.emit(RESPONSE_START, json!({"interactionId": interaction})).await;
    h.emit(
        RESPONSE_COMPLETE,
        json!({"interactionId": interaction, "content": content}),
    )
    .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);
}

fn contents(orch: &ExecutionOrchestrator) -> Vec<String> {
    orch.snapshot().turns.into_iter().map(|t| t.content).collect()
}

#[tokio::test]
async fn scenario_a_missing_required_parameter_blocks_send() {
    let h = Harness::new().await;
    let orch = h.surface(false);

    let values = prepare(orch.skill(), &AmbientContext::new(TeamId::from_raw("t1")));
    let err = orch.start(values, None).await.unwrap_err();

    let EngineError::Validation(validation) = err else {
        panic!("expected validation error, got {err:?}");
    };
    assert_eq!(validation.fields.len(), 1);
    assert_eq!(validation.fields["topic"], FieldError::Required);
    assert_eq!(validation.messages()["topic"], "required");
    assert_eq!(orch.stage(), ExecutionStage::Idle);

    let mut server = h.server;
    assert!(server.try_recv().is_none());
}

#[tokio::test]
async fn scenario_b_canonical_content_replaces_streamed_chunks() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);
    let mut events = orch.subscribe();

    orch.start(topic("x"), None).await.unwrap();
    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(
        sent,
        json!({"skillId": "s1", "teamId": "t1", "parameters": {"topic": "x"}})
    );

    h.emit(RESPONSE_START, json!({"interactionId": "i1"})).await;
    h.emit(RESPONSE_CHUNK, json!({"chunk": "Hello "})).await;
    h.emit(RESPONSE_CHUNK, json!({"chunk": "world"})).await;

    let mut chunks = 0;
    until(&mut events, |e| {
        if matches!(e, ExecutionEvent::Chunk { .. }) {
            chunks += 1;
        }
        chunks == 2
    })
    .await;
    let provisional = orch.snapshot();
    assert_eq!(provisional.stage, ExecutionStage::Receiving);
    assert_eq!(provisional.buffer, "Hello world");
    assert_eq!(provisional.interaction_id.unwrap().as_str(), "i1");

    h.emit(
        RESPONSE_COMPLETE,
        json!({"interactionId": "i1", "content": "Hello world!"}),
    )
    .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);
    assert_eq!(orch.snapshot().buffer, "Hello world!");
}

#[tokio::test]
async fn scenario_c_follow_up_appends_user_then_assistant() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    complete_fresh(&mut h, &orch, "First draft").await;
    assert_eq!(orch.snapshot().turns.len(), 1);

    orch.send_follow_up("continue").unwrap();
    let snap = orch.snapshot();
    assert_eq!(snap.stage, ExecutionStage::Receiving);
    assert_eq!(snap.turns.len(), 2);
    assert_eq!(snap.turns[1].role, Role::User);
    assert_eq!(snap.turns[1].content, "continue");
    assert!(snap.buffer.is_empty());

    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(
        sent,
        json!({"skillId": "s1", "teamId": "t1", "message": "continue", "interactionId": "i1"})
    );

    h.emit(RESPONSE_START, json!({"interactionId": "i1"})).await;
    h.emit(RESPONSE_CHUNK, json!({"chunk": "More"})).await;
    h.emit(
        RESPONSE_COMPLETE,
        json!({"interactionId": "i1", "content": "More detail."}),
    )
    .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);

    let turns = orch.snapshot().turns;
    let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, [Role::Assistant, Role::User, Role::Assistant]);
    assert_eq!(turns[0].content, "First draft");
    assert_eq!(turns[2].content, "More detail.");
}

#[tokio::test]
async fn scenario_d_remote_error_keeps_partial_output() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);
    let mut events = orch.subscribe();

    orch.start(topic("x"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    h.emit(RESPONSE_START, json!({"interactionId": "i1"})).await;
    h.emit(RESPONSE_CHUNK, json!({"chunk": "Partial "})).await;
    h.emit(RESPONSE_ERROR, json!({"message": "quota exceeded"})).await;

    let failed = until(&mut events, |e| matches!(e, ExecutionEvent::Failed { .. })).await;
    let ExecutionEvent::Failed {
        kind,
        message,
        retryable,
        ..
    } = failed
    else {
        unreachable!()
    };
    assert_eq!(kind, "protocol");
    assert_eq!(message, "quota exceeded");
    assert!(retryable);

    let snap = orch.snapshot();
    assert_eq!(snap.stage, ExecutionStage::Idle);
    assert_eq!(snap.buffer, "Partial ");
    assert_eq!(
        snap.last_error,
        Some(EngineError::Protocol("quota exceeded".into()))
    );

    orch.start(topic("retry"), None).await.unwrap();
    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(sent["parameters"]["topic"], "retry");
    assert!(sent.get("interactionId").is_none());
}

#[tokio::test]
async fn cancel_when_idle_is_a_no_op() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);

    assert!(!orch.cancel());
    assert!(!orch.cancel());
    assert_eq!(orch.stage(), ExecutionStage::Idle);
    assert!(orch.snapshot().last_error.is_none());
    assert!(h.server.try_recv().is_none());
}

#[tokio::test]
async fn cancel_in_flight_sends_cancel_and_resets() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);
    let mut events = orch.subscribe();

    orch.start(topic("x"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    h.emit(RESPONSE_START, json!({"interactionId": "i9"})).await;
    until(&mut events, |e| matches!(e, ExecutionEvent::InteractionStarted { .. })).await;

    assert!(orch.cancel());
    assert_eq!(orch.stage(), ExecutionStage::Idle);
    let sent = h.expect_sent(SKILL_CANCEL).await;
    assert_eq!(sent, json!({"interactionId": "i9"}));
}

#[tokio::test]
async fn follow_up_reuses_the_started_interaction() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    let mut events = orch.subscribe();

    orch.start(topic("x"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    h.emit(RESPONSE_START, json!({"interactionId": "int_42"})).await;
    until(&mut events, |e| matches!(e, ExecutionEvent::InteractionStarted { .. })).await;
    h.emit(RESPONSE_COMPLETE, json!({"interactionId": "int_42", "content": "one"}))
        .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);

    for message in ["two", "three"] {
        orch.send_follow_up(message).unwrap();
        let sent = h.expect_sent(SKILL_EXECUTE).await;
        assert_eq!(sent["interactionId"], "int_42");
        assert_eq!(sent["message"], message);
        assert!(sent.get("parameters").is_none());
        h.emit(RESPONSE_START, json!({"interactionId": "int_42"})).await;
        h.emit(
            RESPONSE_COMPLETE,
            json!({"interactionId": "int_42", "content": message}),
        )
        .await;
        assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);
    }
    assert_eq!(orch.snapshot().turns.len(), 5);
}

#[tokio::test]
async fn completion_without_chunks_is_exact() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);
    complete_fresh(&mut h, &orch, "Only the final text").await;
    assert_eq!(orch.snapshot().buffer, "Only the final text");
}

#[tokio::test]
async fn chunks_concatenate_in_arrival_order() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);
    let mut events = orch.subscribe();

    orch.start(topic("x"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    h.emit(RESPONSE_START, json!({"interactionId": "i1"})).await;
    for chunk in ["C1", "C2", "C3"] {
        h.emit(RESPONSE_CHUNK, json!({ "chunk": chunk })).await;
    }
    let mut seen = 0;
    until(&mut events, |e| {
        if matches!(e, ExecutionEvent::Chunk { .. }) {
            seen += 1;
        }
        seen == 3
    })
    .await;
    assert_eq!(orch.snapshot().buffer, "C1C2C3");
    assert_eq!(orch.stage(), ExecutionStage::Receiving);
}

#[tokio::test]
async fn failed_follow_up_rolls_back_user_turn_and_allows_retry() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    complete_fresh(&mut h, &orch, "draft").await;

    orch.send_follow_up("shorter").unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(orch.snapshot().turns.len(), 2);
    h.emit(RESPONSE_ERROR, json!({"message": "model overloaded"})).await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Idle);

    let snap = orch.snapshot();
    assert_eq!(snap.turns.len(), 1);
    assert_eq!(snap.interaction_id.unwrap().as_str(), "i1");

    orch.send_follow_up("shorter").unwrap();
    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(sent["interactionId"], "i1");
}

#[tokio::test]
async fn cancelled_follow_up_rolls_back_user_turn() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    complete_fresh(&mut h, &orch, "draft").await;

    orch.send_follow_up("more").unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    assert!(orch.cancel());
    assert_eq!(h.expect_sent(SKILL_CANCEL).await, json!({"interactionId": "i1"}));
    assert_eq!(orch.snapshot().turns.len(), 1);
}

#[tokio::test]
async fn end_conversation_blocks_further_follow_ups() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    complete_fresh(&mut h, &orch, "draft").await;

    orch.end_conversation().unwrap();
    assert_eq!(orch.stage(), ExecutionStage::Waiting);
    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(
        sent,
        json!({"skillId": "s1", "teamId": "t1", "interactionId": "i1", "endConversation": true})
    );
    h.emit(RESPONSE_START, json!({"interactionId": "i1"})).await;
    h.emit(RESPONSE_COMPLETE, json!({"interactionId": "i1", "content": "Summary"}))
        .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);

    let snap = orch.snapshot();
    assert!(snap.ended);
    assert_eq!(snap.buffer, "Summary");
    assert_eq!(orch.send_follow_up("again").unwrap_err(), EngineError::ConversationEnded);
    assert_eq!(orch.end_conversation().unwrap_err(), EngineError::ConversationEnded);
}

#[tokio::test]
async fn failed_end_may_be_retried() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    complete_fresh(&mut h, &orch, "draft").await;

    orch.end_conversation().unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    h.emit(RESPONSE_ERROR, json!({"message": "try later"})).await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Idle);
    assert!(!orch.snapshot().ended);

    orch.end_conversation().unwrap();
    assert_eq!(h.expect_sent(SKILL_EXECUTE).await["endConversation"], true);
}

#[tokio::test]
async fn new_conversation_makes_next_start_fresh() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    complete_fresh(&mut h, &orch, "draft").await;

    orch.start_new_conversation();
    let snap = orch.snapshot();
    assert_eq!(snap.stage, ExecutionStage::Idle);
    assert!(snap.interaction_id.is_none());
    assert!(snap.turns.is_empty());
    assert!(snap.buffer.is_empty());
    assert_eq!(orch.send_follow_up("hi").unwrap_err(), EngineError::NoInteraction);

    orch.start(topic("y"), None).await.unwrap();
    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert!(sent.get("interactionId").is_none());
}

#[tokio::test]
async fn follow_up_requires_multi_turn_skill() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);
    complete_fresh(&mut h, &orch, "done").await;
    assert_eq!(orch.send_follow_up("more").unwrap_err(), EngineError::NotMultiTurn);
    assert!(orch.snapshot().turns.is_empty());
}

#[tokio::test]
async fn surfaces_sharing_a_connection_do_not_cross_talk() {
    let mut h = Harness::new().await;
    let busy = h.surface(false);
    let quiet = h.surface(false);

    busy.start(topic("x"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    assert!(!quiet.cancel());

    h.emit(RESPONSE_START, json!({"interactionId": "i1"})).await;
    h.emit(RESPONSE_CHUNK, json!({"chunk": "only mine"})).await;
    h.emit(RESPONSE_COMPLETE, json!({"interactionId": "i1", "content": "only mine"}))
        .await;
    assert_eq!(busy.wait_settled().await, ExecutionStage::Completed);

    let quiet_snap = quiet.snapshot();
    assert_eq!(quiet_snap.stage, ExecutionStage::Idle);
    assert!(quiet_snap.buffer.is_empty());
    assert!(quiet_snap.interaction_id.is_none());
}

#[tokio::test]
async fn concurrent_follow_ups_complete_on_their_own_surfaces() {
    let mut h = Harness::new().await;
    let a = h.surface(true);
    let b = h.surface(true);
    complete_fresh_as(&mut h, &a, "iA", "A1").await;
    complete_fresh_as(&mut h, &b, "iB", "B1").await;

    a.send_follow_up("more a").unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    b.send_follow_up("more b").unwrap();
    h.expect_sent(SKILL_EXECUTE).await;

    h.emit(RESPONSE_COMPLETE, json!({"interactionId": "iA", "content": "A2"}))
        .await;
    assert_eq!(a.wait_settled().await, ExecutionStage::Completed);
    assert_eq!(b.stage(), ExecutionStage::Receiving);

    h.emit(RESPONSE_COMPLETE, json!({"interactionId": "iB", "content": "B2"}))
        .await;
    assert_eq!(b.wait_settled().await, ExecutionStage::Completed);

    assert_eq!(a.snapshot().buffer, "A2");
    assert_eq!(b.snapshot().buffer, "B2");
    assert_eq!(contents(&a), ["A1", "more a", "A2"]);
    assert_eq!(contents(&b), ["B1", "more b", "B2"]);
}

#[tokio::test]
async fn run_cancelled_before_start_is_cancelled_once_named() {
    let mut h = Harness::new().await;
    let orch = h.surface(true);
    let mut events = orch.subscribe();

    orch.start(topic("old"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    assert!(orch.cancel());
    assert!(h.server.try_recv().is_none());

    orch.start(topic("new"), None).await.unwrap();
    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(sent["parameters"]["topic"], "new");

    h.emit(RESPONSE_START, json!({"interactionId": "i_old"})).await;
    let cancel = h.expect_sent(SKILL_CANCEL).await;
    assert_eq!(cancel, json!({"interactionId": "i_old"}));
    h.emit(RESPONSE_CHUNK, json!({"chunk": "old output"})).await;
    h.emit(
        RESPONSE_COMPLETE,
        json!({"interactionId": "i_old", "content": "old output"}),
    )
    .await;

    h.emit(RESPONSE_START, json!({"interactionId": "i_new"})).await;
    h.emit(RESPONSE_CHUNK, json!({"chunk": "new "})).await;
    h.emit(
        RESPONSE_COMPLETE,
        json!({"interactionId": "i_new", "content": "new output"}),
    )
    .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);

    let mut streamed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExecutionEvent::Chunk { text, .. } = event {
            streamed.push(text);
        }
    }
    assert_eq!(streamed, ["new "]);

    let snap = orch.snapshot();
    assert_eq!(snap.interaction_id.unwrap().as_str(), "i_new");
    assert_eq!(snap.buffer, "new output");
    assert_eq!(contents(&orch), ["new output"]);
    assert_eq!(h.connection.handler_count(RESPONSE_START), 0);
}

#[tokio::test]
async fn late_start_while_idle_is_cancelled_and_forgotten() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);

    orch.start(topic("old"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    assert!(orch.cancel());

    h.emit(RESPONSE_START, json!({"interactionId": "i_old"})).await;
    let cancel = h.expect_sent(SKILL_CANCEL).await;
    assert_eq!(cancel, json!({"interactionId": "i_old"}));

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let tail = h.connection.subscribe(RESPONSE_COMPLETE, move |_| {
        let _ = seen_tx.send(());
    });
    h.emit(
        RESPONSE_COMPLETE,
        json!({"interactionId": "i_old", "content": "old output"}),
    )
    .await;
    seen_rx.recv().await.unwrap();
    assert_eq!(h.connection.handler_count(RESPONSE_START), 0);
    h.connection.unsubscribe(RESPONSE_COMPLETE, Some(tail));

    let idle = orch.snapshot();
    assert_eq!(idle.stage, ExecutionStage::Idle);
    assert!(idle.buffer.is_empty());

    orch.start(topic("new"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    h.emit(RESPONSE_START, json!({"interactionId": "i_new"})).await;
    h.emit(RESPONSE_COMPLETE, json!({"interactionId": "i_new", "content": "new"}))
        .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);
    assert_eq!(orch.snapshot().interaction_id.unwrap().as_str(), "i_new");
    assert!(h.server.try_recv().is_none());
}

#[tokio::test]
async fn error_answering_a_cancelled_run_spares_the_next_one() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);

    orch.start(topic("old"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;
    assert!(orch.cancel());
    orch.start(topic("new"), None).await.unwrap();
    h.expect_sent(SKILL_EXECUTE).await;

    h.emit(RESPONSE_ERROR, json!({"message": "quota exceeded"})).await;
    h.emit(RESPONSE_START, json!({"interactionId": "i2"})).await;
    h.emit(RESPONSE_COMPLETE, json!({"interactionId": "i2", "content": "fine"}))
        .await;
    assert_eq!(orch.wait_settled().await, ExecutionStage::Completed);

    let snap = orch.snapshot();
    assert_eq!(snap.buffer, "fine");
    assert!(snap.last_error.is_none());
}

#[tokio::test]
async fn reference_document_travels_with_fresh_request() {
    let mut h = Harness::new().await;
    let orch = h.surface(false);
    orch.start(topic("x"), Some(skillrun_core::DocumentId::from_raw("doc_7")))
        .await
        .unwrap();
    let sent = h.expect_sent(SKILL_EXECUTE).await;
    assert_eq!(sent["referenceDocumentId"], "doc_7");
}
