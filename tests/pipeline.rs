//! End-to-end pipeline tests over the loopback driver and a scripted backend

use std::time::Duration;

use parley_gateway::config::EmotionMode;
use parley_gateway::context::Role;
use parley_gateway::upstream::UpstreamError;
use parley_gateway::{Error, InboundEvent, RunState, TurnOutcome};

mod common;
use common::{Harness, test_bot};

fn unavailable() -> UpstreamError {
    UpstreamError::Status {
        status: 503,
        body: "overloaded".to_string(),
    }
}

// -- basic replies -------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn replies_to_direct_message() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.say("alice", "Alice", "hello");
    h.expect_sent(1).await;

    let outbox = h.driver.outbox();
    assert_eq!(outbox[0].conversation_id, "alice");
    assert_eq!(outbox[0].text, "echo: hello");

    let turns = h.wait_for_turns(1).await;
    assert_eq!(turns[0].outcome, TurnOutcome::Replied);
    assert_eq!(turns[0].preset.as_deref(), Some("main"));
    assert_eq!(h.orchestrator.status().stats.total_replies, 1);

    let system = &h.backend.requests()[0].messages[0];
    assert_eq!(system.role, Role::System);
    assert!(system.content.contains("You are Parley, chatting with Alice."));
}

#[tokio::test(start_paused = true)]
async fn exchange_is_remembered() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.say("alice", "Alice", "hello");
    h.expect_sent(1).await;
    h.wait_for_turns(1).await;
    h.say("alice", "Alice", "again");
    h.expect_sent(2).await;
    h.wait_for_turns(2).await;

    let second = &h.backend.requests()[1];
    assert!(
        second
            .messages
            .iter()
            .any(|m| m.role == Role::Assistant && m.content.contains("echo: hello"))
    );
    assert_eq!(h.orchestrator.store().memory().count("alice").unwrap(), 4);
}

// -- ordering and concurrency ------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn turns_in_one_conversation_stay_in_order() {
    let h = Harness::new(test_bot());
    h.backend.set_latency(Duration::from_secs(1));
    h.start().await;

    for text in ["one", "two", "three"] {
        h.say("alice", "Alice", text);
    }
    h.expect_sent(3).await;

    assert_eq!(
        h.driver.sent_to("alice"),
        vec!["echo: one", "echo: two", "echo: three"]
    );
    assert_eq!(h.backend.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn conversations_run_in_parallel() {
    let h = Harness::new(test_bot());
    h.backend.set_latency(Duration::from_secs(1));
    h.start().await;

    for conversation in ["a", "b", "c"] {
        h.say(conversation, conversation, "hi");
    }
    h.expect_sent(3).await;

    assert!(h.backend.max_in_flight() >= 2);
}

#[tokio::test(start_paused = true)]
async fn max_concurrency_one_serializes_upstream_calls() {
    let h = Harness::new(parley_gateway::BotConfig {
        max_concurrency: 1,
        ..test_bot()
    });
    h.backend.set_latency(Duration::from_secs(1));
    h.start().await;

    for conversation in ["a", "b", "c"] {
        h.say(conversation, conversation, "hi");
    }
    h.expect_sent(3).await;

    assert_eq!(h.backend.max_in_flight(), 1);
}

// -- merging -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn rapid_messages_merge_into_one_turn() {
    let h = Harness::new(parley_gateway::BotConfig {
        merge_user_messages_sec: 2.0,
        ..test_bot()
    });
    h.start().await;

    h.say("alice", "Alice", "hi");
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.say("alice", "Alice", "are you there");
    h.expect_sent(1).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.backend.user_messages(), vec!["hi\nare you there"]);
    assert_eq!(h.driver.outbox().len(), 1);
}

// -- upstream failures -------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried() {
    let h = Harness::new(test_bot());
    h.backend.push(Err(unavailable()));
    h.backend.push(Err(UpstreamError::Timeout));
    h.backend.reply("recovered");
    h.start().await;

    h.say("alice", "Alice", "hello");
    h.expect_sent(1).await;

    assert_eq!(h.driver.sent_to("alice"), vec!["recovered"]);
    assert_eq!(h.backend.requests().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn fallback_reply_after_exhausted_retries() {
    let h = Harness::new(parley_gateway::BotConfig {
        fallback_reply: "busy right now".to_string(),
        ..test_bot()
    });
    for _ in 0..3 {
        h.backend.push(Err(unavailable()));
    }
    h.start().await;

    h.say("alice", "Alice", "hello");
    h.expect_sent(1).await;

    assert_eq!(h.driver.sent_to("alice"), vec!["busy right now"]);
    let turns = h.wait_for_turns(1).await;
    assert!(matches!(turns[0].outcome, TurnOutcome::Fallback { .. }));
    let stats = h.orchestrator.status().stats;
    assert_eq!(stats.failed_turns, 1);
    assert_eq!(stats.total_replies, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_turn_releases_the_conversation() {
    let h = Harness::new(test_bot());
    h.backend.push(Err(UpstreamError::Status {
        status: 401,
        body: "bad key".to_string(),
    }));
    h.start().await;

    h.say("alice", "Alice", "first");
    let turns = h.wait_for_turns(1).await;
    assert!(matches!(turns[0].outcome, TurnOutcome::Failed { .. }));
    assert!(h.driver.outbox().is_empty());
    assert_eq!(h.backend.requests().len(), 1);

    h.say("alice", "Alice", "second");
    h.expect_sent(1).await;
    assert_eq!(h.driver.sent_to("alice"), vec!["echo: second"]);
}

// -- filtering -----------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn group_messages_need_a_mention() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.driver
        .inject(InboundEvent::text("team", "bob", "lunch?").in_group(false));
    let turns = h.wait_for_turns(1).await;
    assert!(matches!(turns[0].outcome, TurnOutcome::Rejected { .. }));

    h.driver
        .inject(InboundEvent::text("team", "bob", "@Parley lunch?").in_group(true));
    h.expect_sent(1).await;

    assert_eq!(h.backend.user_messages(), vec!["lunch?"]);
    assert_eq!(h.orchestrator.status().stats.rejected_turns, 1);
}

// -- pacing ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn chunks_respect_min_reply_interval() {
    let h = Harness::new(parley_gateway::BotConfig {
        min_reply_interval_sec: 2.0,
        reply_chunk_size: 10,
        ..test_bot()
    });
    h.backend.reply("alpha beta gamma delta epsilon");
    h.start().await;

    h.say("alice", "Alice", "talk to me");
    let turns = h.wait_for_turns(1).await;
    assert_eq!(turns[0].outcome, TurnOutcome::Replied);

    let outbox = h.driver.outbox();
    assert!(outbox.len() >= 2);
    for pair in outbox.windows(2) {
        assert!(pair[1].instant - pair[0].instant >= Duration::from_secs(2));
    }
}

// -- streaming ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn streamed_reply_goes_out_while_generating() {
    let h = Harness::new(parley_gateway::BotConfig {
        stream_reply: true,
        stream_buffer_chars: 10,
        min_reply_interval_sec: 1.0,
        reply_suffix: " [{model}]".to_string(),
        ..test_bot()
    });
    h.backend
        .reply("First sentence here. Second sentence here. Third one.");
    h.backend.set_stream_gap(Duration::from_secs(2));
    h.start().await;

    h.say("alice", "Alice", "tell me three things");
    let turns = h.wait_for_turns(1).await;
    assert_eq!(turns[0].outcome, TurnOutcome::Replied);
    assert_eq!(turns[0].chunks, 3);

    let outbox = h.driver.outbox();
    let texts: Vec<&str> = outbox.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(
        texts,
        [
            "First sentence here.",
            "Second sentence here.",
            "Third one. [test-model]"
        ]
    );
    assert!(h.backend.requests()[0].stream);

    // Deltas arrive 2s apart, so the first chunk leaves while the rest still streams
    assert!(outbox[1].instant - outbox[0].instant >= Duration::from_secs(4));
    for pair in outbox.windows(2) {
        assert!(pair[1].instant - pair[0].instant >= Duration::from_secs(1));
    }
}

// -- pause and control commands ------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn paused_turns_are_dropped_but_commands_work() {
    let h = Harness::new(test_bot());
    h.start().await;
    h.orchestrator.pause(Some("lunch".to_string())).unwrap();

    h.say("alice", "Alice", "hello");
    let turns = h.wait_for_turns(1).await;
    assert_eq!(turns[0].outcome, TurnOutcome::Paused);
    assert!(h.driver.outbox().is_empty());

    h.say("alice", "Alice", "/status");
    h.expect_sent(1).await;
    let status = &h.driver.outbox()[0].text;
    assert!(status.contains("State: paused"));
    assert!(status.contains("Paused: lunch"));

    h.say("alice", "Alice", "/resume");
    h.expect_sent(2).await;
    assert_eq!(h.driver.outbox()[1].text, "Auto replies resumed");
    assert_eq!(h.orchestrator.state(), RunState::Running);

    h.say("alice", "Alice", "hello again");
    h.expect_sent(3).await;
    assert_eq!(h.driver.outbox()[2].text, "echo: hello again");
    assert_eq!(h.backend.requests().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn pause_command_from_chat() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.say("alice", "Alice", "/pause meeting");
    h.expect_sent(1).await;

    assert_eq!(h.driver.outbox()[0].text, "Auto replies paused (meeting)");
    assert_eq!(h.orchestrator.state(), RunState::Paused);
    assert_eq!(h.orchestrator.status().pause_reason.as_deref(), Some("meeting"));
}

// -- lifecycle -------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_fails_without_usable_preset() {
    let h = Harness::new(test_bot());
    h.backend
        .fail_health_check
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = h.orchestrator.start().await.unwrap_err();

    assert!(matches!(err, Error::NoUsablePreset(_)));
    assert_eq!(h.orchestrator.state(), RunState::Stopped);
    assert!(h.orchestrator.status().last_error.is_some());
}

#[tokio::test(start_paused = true)]
async fn stop_and_restart() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.orchestrator.stop().await.unwrap();
    assert_eq!(h.orchestrator.state(), RunState::Stopped);
    assert!(matches!(
        h.orchestrator.stop().await,
        Err(Error::InvalidTransition(_))
    ));
    assert!(h.orchestrator.resume().is_err());

    h.start().await;
    h.say("alice", "Alice", "back?");
    h.expect_sent(1).await;
}

#[tokio::test(start_paused = true)]
async fn stopped_orchestrator_does_not_poll() {
    let h = Harness::new(test_bot());
    h.say("alice", "Alice", "anyone?");
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(h.driver.outbox().is_empty());
    assert!(h.backend.requests().is_empty());
}

// -- reconnect -------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnects_after_driver_loss() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.driver.set_connected(false);
    h.wait_for_state(RunState::Reconnecting).await;
    h.wait_for_state(RunState::Running).await;
    assert_eq!(h.driver.reconnect_attempts(), 1);

    h.say("alice", "Alice", "still there?");
    h.expect_sent(1).await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_stop_the_orchestrator() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.driver.refuse_reconnect(true);
    h.driver.set_connected(false);
    h.wait_for_state(RunState::Stopped).await;

    assert_eq!(h.driver.reconnect_attempts(), 3);
    let status = h.orchestrator.status();
    let last_error = status.last_error.unwrap();
    assert!(last_error.starts_with("reconnect failed:"), "{last_error}");
    assert!(last_error.contains("3 attempt(s)"), "{last_error}");
}

#[tokio::test(start_paused = true)]
async fn idle_keepalive_forces_a_reconnect() {
    let h = Harness::new(parley_gateway::BotConfig {
        keepalive_idle_sec: 5,
        ..test_bot()
    });
    h.start().await;

    h.wait_for_state(RunState::Reconnecting).await;
    assert!(h.orchestrator.status().driver_connected);
    h.wait_for_state(RunState::Running).await;
    assert!(h.driver.reconnect_attempts() >= 1);
    assert!(h.orchestrator.status().last_error.is_none());

    h.say("alice", "Alice", "still there?");
    h.expect_sent(1).await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_disabled_leaves_an_idle_driver_alone() {
    let h = Harness::new(test_bot());
    h.start().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.driver.reconnect_attempts(), 0);
    assert_eq!(h.orchestrator.state(), RunState::Running);
}

// -- manual send -------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn manual_send_is_recorded() {
    let h = Harness::new(test_bot());
    h.start().await;

    h.orchestrator.send_manual("alice", "hi from the operator").await.unwrap();

    assert_eq!(h.driver.sent_to("alice"), vec!["hi from the operator"]);
    let turns = h.orchestrator.recent_turns(10);
    assert_eq!(turns[0].outcome, TurnOutcome::Manual);
    assert!(h.orchestrator.send_manual("alice", "   ").await.is_err());
}

// -- hot reload --------------------------------------------------------------------------

async fn wait_for_model(h: &Harness, model: &str) {
    for _ in 0..200 {
        if h.orchestrator.status().active_model.as_deref() == Some(model) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "active model never became {model}, now {:?}",
        h.orchestrator.status().active_model
    );
}

#[tokio::test(start_paused = true)]
async fn preset_change_is_rechecked_on_reload() {
    let h = Harness::new(test_bot());
    h.start().await;
    assert_eq!(h.backend.health_checks(), 1);

    let mut next = (*h.config.current()).clone();
    next.presets[0].model = "test-model-2".to_string();
    h.config.replace(next);

    wait_for_model(&h, "test-model-2").await;
    assert_eq!(h.backend.health_checks(), 2);
    assert_eq!(h.orchestrator.state(), RunState::Running);

    h.say("alice", "Alice", "hello");
    h.wait_for_turns(1).await;
    assert_eq!(h.backend.requests()[0].model, "test-model-2");
}

#[tokio::test(start_paused = true)]
async fn bot_only_change_keeps_the_active_preset() {
    let h = Harness::new(test_bot());
    h.start().await;

    let mut next = (*h.config.current()).clone();
    next.bot.self_name = "Renamed".to_string();
    h.config.replace(next);

    h.say("alice", "Alice", "hello");
    h.wait_for_turns(1).await;
    assert_eq!(h.backend.health_checks(), 1);
    let system = &h.backend.requests()[0].messages[0];
    assert!(system.content.contains("You are Renamed"));
}

#[tokio::test(start_paused = true)]
async fn reload_without_recheck_keeps_the_old_selection() {
    let h = Harness::new(parley_gateway::BotConfig {
        reload_ai_client_on_change: false,
        ..test_bot()
    });
    h.start().await;

    let mut next = (*h.config.current()).clone();
    next.presets[0].model = "test-model-2".to_string();
    h.config.replace(next);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.backend.health_checks(), 1);
    assert_eq!(h.orchestrator.status().active_model.as_deref(), Some("test-model"));
}

// -- profile and emotion -----------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn extracted_facts_land_before_the_next_turn() {
    let h = Harness::new(parley_gateway::BotConfig {
        profile_update_every: 1,
        ..test_bot()
    });
    h.backend.reply("Nice to meet you.");
    h.backend.reply(
        r#"{"new_facts": ["works night shifts as a nurse"], "relationship_hint": "friend", "personality_traits": ["warm"]}"#,
    );
    h.start().await;

    h.say("alice", "Alice", "I just got home from my night shift at the hospital");
    h.wait_for_turns(1).await;
    assert_eq!(h.backend.requests().len(), 2);
    assert_eq!(h.driver.sent_to("alice"), vec!["Nice to meet you."]);

    let profile = h.orchestrator.store().profiles().get("alice").unwrap().unwrap();
    assert_eq!(profile.message_count, 1);
    assert_eq!(profile.relationship, "friend");
    assert_eq!(profile.facts.len(), 1);
    assert_eq!(profile.facts[0].text, "works night shifts as a nurse");
    assert!(profile.personality.contains("warm"));

    h.say("alice", "Alice", "what should I cook?");
    h.wait_for_turns(2).await;
    let third = &h.backend.requests()[2];
    assert!(third.messages[0].content.contains("works night shifts as a nurse"));

    let profile = h.orchestrator.store().profiles().get("alice").unwrap().unwrap();
    assert_eq!(profile.message_count, 2);
    assert_eq!(profile.facts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn extraction_waits_for_its_cadence() {
    let h = Harness::new(parley_gateway::BotConfig {
        profile_update_every: 2,
        ..test_bot()
    });
    h.start().await;

    h.say("alice", "Alice", "hello");
    h.wait_for_turns(1).await;
    assert_eq!(h.backend.requests().len(), 1);

    h.say("alice", "Alice", "again");
    h.wait_for_turns(2).await;
    assert_eq!(h.backend.requests().len(), 3);
    let profile = h.orchestrator.store().profiles().get("alice").unwrap().unwrap();
    assert_eq!(profile.message_count, 2);
}

#[tokio::test(start_paused = true)]
async fn model_emotion_reaches_the_prompt() {
    let h = Harness::new(parley_gateway::BotConfig {
        emotion_mode: EmotionMode::Ai,
        ..test_bot()
    });
    h.backend.reply(r#"{"emotion": "sad", "confidence": 0.8}"#);
    h.backend.reply("I'm sorry to hear that.");
    h.start().await;

    h.say("alice", "Alice", "the meeting is at 3");
    h.expect_sent(1).await;
    h.wait_for_turns(1).await;

    let requests = h.backend.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].messages[1].content.contains("the meeting is at 3"));
    assert!(requests[1].messages[0].content.contains("[Current Emotion] sad (confidence 0.80)"));
    assert_eq!(h.driver.sent_to("alice"), vec!["I'm sorry to hear that."]);

    let profile = h.orchestrator.store().profiles().get("alice").unwrap().unwrap();
    assert_eq!(profile.last_emotion.as_deref(), Some("sad"));
}

#[tokio::test(start_paused = true)]
async fn unreadable_emotion_answer_falls_back_to_keywords() {
    let h = Harness::new(parley_gateway::BotConfig {
        emotion_mode: EmotionMode::Ai,
        ..test_bot()
    });
    h.backend.reply("they seem a bit off today");
    h.start().await;

    h.say("alice", "Alice", "I'm worried about tomorrow");
    h.expect_sent(1).await;

    let requests = h.backend.requests();
    assert!(requests[1].messages[0].content.contains("[Current Emotion] anxious"));
}
