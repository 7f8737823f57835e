mod common;

use cs_domain::step::{StepDraft, TriggeredBy};
use cs_gateway::runtime::{run_supervisor_turn, SupervisorRequest};
use cs_gateway::sse::{CollectSink, MentionOutcome, WireEvent};
use cs_store::StepStore;

async fn three_agent_session(store: &dyn StepStore, middle_model: &str) -> cs_domain::step::Session {
    store
        .create_session(
            Some("team".into()),
            ["mock-writer", middle_model, "mock-editor"]
                .iter()
                .map(|m| StepDraft {
                    model: (*m).into(),
                    prompt: format!("You are {m}."),
                    ..Default::default()
                })
                .collect(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn failing_delegate_does_not_stop_the_turn() {
    let (rt, store) = common::runtime(&common::config(), "On it, handing out the tasks.");
    let session = three_agent_session(store.as_ref(), "mock-broken").await;

    let queue = rt.new_queue();
    let mut sink = CollectSink::default();
    let summary = run_supervisor_turn(
        &rt,
        &queue,
        &mut sink,
        SupervisorRequest {
            session_id: session.id.clone(),
            user_input: "@Agent1 draft the intro @Agent2 check the facts @Agent3 polish the tone"
                .into(),
        },
    )
    .await
    .unwrap();
    queue.flush().await;

    assert_eq!(summary.mentions.len(), 3);
    assert_eq!(summary.mentions[0].task_prompt, "draft the intro");
    assert!(matches!(summary.outcomes[0], MentionOutcome::Completed { agent_index: 0, .. }));
    assert!(matches!(
        &summary.outcomes[1],
        MentionOutcome::Failed { agent_index: 1, error, .. } if error.contains("upstream exploded")
    ));
    assert!(matches!(summary.outcomes[2], MentionOutcome::Completed { agent_index: 2, .. }));
    assert_eq!(summary.response, "On it, handing out the tasks.");

    // Wire order: start, supervisor chunks, then one start per delegation.
    assert!(matches!(sink.events.first(), Some(WireEvent::SupervisorTurnStart { .. })));
    assert!(matches!(sink.events.last(), Some(WireEvent::SupervisorComplete { .. })));
    assert!(sink.count("supervisor_chunk") > 0);
    assert_eq!(sink.count("mention_execution_start"), 3);
    assert_eq!(sink.count("agent_execution_complete"), 2);
    assert_eq!(sink.count("agent_execution_error"), 1);
    assert_eq!(sink.count("token"), 0);

    let session = store.get_session(&session.id).await.unwrap().unwrap();
    let turn = &session.supervisor_turns[0];
    assert!(turn.is_complete);
    assert!(!turn.is_streaming);
    assert_eq!(turn.parsed_mentions.len(), 3);

    for index in [0, 2] {
        let history = session.history_for(index);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].triggered_by, TriggeredBy::Supervisor);
        assert!(session.steps[index].is_complete);
        assert!(session.steps[index].error.is_none());
    }
    assert!(session.history_for(1).is_empty());
    assert!(session.steps[1].is_complete);
    assert!(session.steps[1].error.is_some());
}

#[tokio::test]
async fn reply_mentions_are_used_when_the_user_names_nobody() {
    let (rt, store) = common::runtime(&common::config(), "@Agent3 tighten the summary please");
    let session = three_agent_session(store.as_ref(), "mock-checker").await;

    let queue = rt.new_queue();
    let mut sink = CollectSink::default();
    let summary = run_supervisor_turn(
        &rt,
        &queue,
        &mut sink,
        SupervisorRequest {
            session_id: session.id.clone(),
            user_input: "What should happen next?".into(),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.mentions.len(), 1);
    assert_eq!(summary.mentions[0].agent_index, 2);
    assert_eq!(summary.mentions[0].task_prompt, "tighten the summary please");
    assert_eq!(summary.executed_step_ids, vec![session.steps[2].id.clone()]);
}

#[tokio::test]
async fn unknown_mentions_are_reported() {
    let (rt, store) = common::runtime(&common::config(), "Noted.");
    let session = three_agent_session(store.as_ref(), "mock-checker").await;

    let queue = rt.new_queue();
    let mut sink = CollectSink::default();
    let summary = run_supervisor_turn(
        &rt,
        &queue,
        &mut sink,
        SupervisorRequest {
            session_id: session.id.clone(),
            user_input: "@Nobody do the thing".into(),
        },
    )
    .await
    .unwrap();

    assert_eq!(summary.invalid_mentions, vec!["@Nobody".to_string()]);
    assert_eq!(sink.count("invalid_mentions"), 1);
    assert!(matches!(sink.events.last(), Some(WireEvent::SupervisorComplete { .. })));
}

#[tokio::test]
async fn supervisor_model_failure_is_reported_on_the_stream() {
    let mut config = common::config();
    config.supervisor.model = "mock-broken-supervisor".into();
    let (rt, store) = common::runtime(&config, "unused");
    let session = three_agent_session(store.as_ref(), "mock-checker").await;

    let queue = rt.new_queue();
    let mut sink = CollectSink::default();
    let summary = run_supervisor_turn(
        &rt,
        &queue,
        &mut sink,
        SupervisorRequest {
            session_id: session.id.clone(),
            user_input: "@Agent1 draft the intro".into(),
        },
    )
    .await
    .unwrap();
    queue.flush().await;

    assert!(summary.error.as_deref().unwrap_or_default().contains("upstream exploded"));
    assert_eq!(sink.count("error"), 1);
    assert_eq!(sink.count("supervisor_chunk"), 0);
    match &sink.events[1] {
        WireEvent::Error { step_id, message } => {
            assert!(step_id.is_none());
            assert!(message.contains("upstream exploded"));
        }
        other => panic!("expected an error event, got {other:?}"),
    }
    // The user's own mention still runs.
    assert!(matches!(summary.outcomes[0], MentionOutcome::Completed { agent_index: 0, .. }));
    assert!(matches!(sink.events.last(), Some(WireEvent::SupervisorComplete { .. })));

    let session = store.get_session(&session.id).await.unwrap().unwrap();
    let turn = &session.supervisor_turns[0];
    assert!(turn.is_complete);
    assert!(turn.error.is_some());
}

#[tokio::test]
async fn hangup_during_a_delegation_skips_the_rest() {
    let (rt, store) = common::runtime(&common::config(), "Okay.");
    let session = three_agent_session(store.as_ref(), "mock-checker").await;

    let queue = rt.new_queue();
    // turn start, one supervisor chunk, the first mention start, one relay.
    let mut sink = common::HangupSink::after(4);
    let summary = run_supervisor_turn(
        &rt,
        &queue,
        &mut sink,
        SupervisorRequest {
            session_id: session.id.clone(),
            user_input: "@Agent1 draft the intro @Agent2 check the facts @Agent3 polish the tone"
                .into(),
        },
    )
    .await
    .unwrap();
    queue.flush().await;

    assert!(matches!(
        &summary.outcomes[0],
        MentionOutcome::Failed { agent_index: 0, error, .. } if error == "client disconnected"
    ));
    assert!(matches!(summary.outcomes[1], MentionOutcome::NotRun { agent_index: 1 }));
    assert!(matches!(summary.outcomes[2], MentionOutcome::NotRun { agent_index: 2 }));
    assert_eq!(summary.error.as_deref(), Some("client disconnected"));
    assert_eq!(summary.executed_step_ids, vec![session.steps[0].id.clone()]);
    assert_eq!(sink.count("supervisor_complete"), 0);

    let session = store.get_session(&session.id).await.unwrap().unwrap();
    assert!(session.supervisor_turns[0].is_complete);
    assert!(session.steps[0].is_complete);
    assert_eq!(session.steps[0].error.as_deref(), Some("client disconnected"));
    assert!(!session.steps[1].is_complete);
    assert!(!session.steps[2].is_complete);
    assert!(session.history_for(0).is_empty());
}
