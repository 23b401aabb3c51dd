//! Tests for mindlink-client: correlation, dedup, transfers, approval
//! protocols, and the orchestration core end to end

use mindlink_client::*;
use mindlink_core::{
    CommitVoteChoice, ConversationId, Error, Response, Sender, SessionOutcome, TokenUsage,
    TransferDirection, TransferPhase, VoteTally,
};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc;

fn connected_core() -> (ClientCore, mpsc::UnboundedReceiver<String>) {
    let (mut core, outbound_rx) = ClientCore::new("self-node");
    core.connection_up();
    (core, outbound_rx)
}

/// Pop the next outbound frame and return its parsed JSON.
fn next_frame(rx: &mut mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let raw = rx.try_recv().expect("expected an outbound frame");
    serde_json::from_str(&raw).expect("outbound frame is JSON")
}

fn drain_ui(rx: &mut tokio::sync::broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(e) => events.push(e),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
    events
}

// ===========================================================================
// Command correlation
// ===========================================================================

#[test]
fn correlation_ids_are_sequential() {
    let (mut core, mut rx) = connected_core();
    let conv = ConversationId::local_ai();
    core.send_ai_query(conv.clone(), "one").unwrap();
    core.send_ai_query(conv, "two").unwrap();
    assert_eq!(next_frame(&mut rx)["id"], "cmd-1");
    assert_eq!(next_frame(&mut rx)["id"], "cmd-2");
}

#[test]
fn ai_query_response_resolves_placeholder() {
    let (mut core, mut rx) = connected_core();
    let conv = ConversationId::local_ai();
    core.send_ai_query(conv.clone(), "What is the answer?").unwrap();
    let frame = next_frame(&mut rx);
    assert_eq!(frame["command"], "execute_ai_query");
    let id = frame["id"].as_str().unwrap();

    let log = core.store().log(&conv);
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].sender, Sender::User);
    assert_eq!(log[1].text, "Thinking...");
    assert!(log[1].is_pending());
    assert!(core.store().is_busy(&conv));

    let response = json!({
        "id": id,
        "status": "OK",
        "payload": { "content": "42.", "token_usage": { "used": 120, "limit": 1000 } },
    });
    core.apply_text(&response.to_string());

    let log = core.store().log(&conv);
    assert_eq!(log[1].text, "42.");
    assert!(!log[1].is_pending());
    assert!(!core.store().is_busy(&conv));
    assert_eq!(core.store().usage(&conv), Some(TokenUsage::new(120, 1000)));
}

#[test]
fn ai_query_failure_patches_placeholder_with_error() {
    let (mut core, mut rx) = connected_core();
    let conv = ConversationId::local_ai();
    core.send_ai_query(conv.clone(), "hi").unwrap();
    let id = next_frame(&mut rx)["id"].as_str().unwrap().to_string();

    let response = json!({
        "id": id,
        "status": "ERROR",
        "payload": { "message": "model offline" },
    });
    core.apply_text(&response.to_string());

    let log = core.store().log(&conv);
    assert_eq!(log[1].text, "Error: model offline");
    assert!(!log[1].is_pending());
}

#[test]
fn duplicate_response_delivery_is_a_no_op() {
    let (mut core, mut rx) = connected_core();
    let conv = ConversationId::local_ai();
    core.send_ai_query(conv.clone(), "hi").unwrap();
    let id = next_frame(&mut rx)["id"].as_str().unwrap().to_string();

    let ok = json!({ "id": id, "status": "OK", "payload": { "content": "first" } });
    core.apply_text(&ok.to_string());
    let late = json!({ "id": id, "status": "OK", "payload": { "content": "second" } });
    core.apply_text(&late.to_string());

    let log = core.store().log(&conv);
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].text, "first");
    assert_eq!(core.outstanding_commands(), 0);
}

#[test]
fn untracked_response_is_dropped() {
    let (mut core, _rx) = connected_core();
    let response = json!({ "id": "cmd-999", "status": "OK", "payload": {} });
    // Must not panic or create any state.
    core.apply_text(&response.to_string());
    assert_eq!(core.outstanding_commands(), 0);
}

#[test]
fn disconnected_query_fails_without_consuming_an_id() {
    let (mut core, mut rx) = ClientCore::new("self-node");
    let conv = ConversationId::local_ai();
    let err = core.send_ai_query(conv.clone(), "hi").unwrap_err();
    assert!(matches!(err, Error::NotConnected));
    assert!(rx.try_recv().is_err());
    assert_eq!(core.outstanding_commands(), 0);

    // The attempt still lands in the log as a failed exchange.
    let log = core.store().log(&conv);
    assert_eq!(log.len(), 2);
    assert!(log[1].text.contains("not connected"));

    // After connecting, the first command still gets the first id.
    core.connection_up();
    core.send_ai_query(conv, "hi again").unwrap();
    assert_eq!(next_frame(&mut rx)["id"], "cmd-1");
}

// ===========================================================================
// Token window gating
// ===========================================================================

#[test]
fn full_token_window_gates_sends() {
    let (mut core, mut rx) = connected_core();
    let conv = ConversationId::new("ai-session-x");
    let warning = json!({
        "event": "token_warning",
        "payload": {
            "conversation_id": "ai-session-x",
            "tokens_used": 1000,
            "token_limit": 1000,
            "usage_percent": 100.0,
        },
    });
    core.apply_text(&warning.to_string());

    let err = core.send_ai_query(conv.clone(), "one more").unwrap_err();
    assert!(matches!(err, Error::TokenLimitReached(_)));
    assert!(rx.try_recv().is_err());

    // Ending the session lifts the gate.
    core.end_session(conv.clone()).unwrap();
    let id = next_frame(&mut rx)["id"].as_str().unwrap().to_string();
    let response = json!({ "id": id, "status": "OK", "payload": {} });
    core.apply_text(&response.to_string());
    assert!(core.send_ai_query(conv, "fresh start").is_ok());
}

// ===========================================================================
// Peer messages and delivery dedup
// ===========================================================================

#[test]
fn peer_message_appends_and_counts_unread() {
    let (mut core, _rx) = connected_core();
    let event = json!({
        "event": "new_p2p_message",
        "payload": { "sender_node_id": "node-1", "text": "hello", "message_id": "m-1" },
    });
    core.apply_text(&event.to_string());

    let conv = ConversationId::peer("node-1");
    let log = core.store().log(&conv);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].sender, Sender::Peer("node-1".to_string()));
    assert_eq!(core.store().unread(&conv), 1);
}

#[test]
fn redelivered_peer_message_is_dropped() {
    let (mut core, _rx) = connected_core();
    let event = json!({
        "event": "new_p2p_message",
        "payload": { "sender_node_id": "node-1", "text": "hello", "message_id": "m-1" },
    });
    core.apply_text(&event.to_string());
    core.apply_text(&event.to_string());

    let conv = ConversationId::peer("node-1");
    assert_eq!(core.store().log(&conv).len(), 1);
    assert_eq!(core.store().unread(&conv), 1);
}

#[test]
fn fallback_key_collapses_identical_unidentified_messages() {
    let (mut core, _rx) = connected_core();
    let event = json!({
        "event": "new_p2p_message",
        "payload": { "sender_node_id": "node-1", "text": "ping" },
    });
    core.apply_text(&event.to_string());
    core.apply_text(&event.to_string());
    assert_eq!(core.store().log(&ConversationId::peer("node-1")).len(), 1);
}

#[test]
fn peer_send_resolves_on_response() {
    let (mut core, mut rx) = connected_core();
    core.send_peer_message("node-2", "hey").unwrap();
    let frame = next_frame(&mut rx);
    assert_eq!(frame["command"], "send_p2p_message");
    assert_eq!(frame["params"]["recipient_node_id"], "node-2");
    let id = frame["id"].as_str().unwrap().to_string();

    let conv = ConversationId::peer("node-2");
    assert!(core.store().log(&conv)[0].is_pending());

    let response = json!({ "id": id, "status": "OK", "payload": {} });
    core.apply_text(&response.to_string());
    let log = core.store().log(&conv);
    assert!(!log[0].is_pending());
    assert_eq!(log[0].text, "hey");
}

#[test]
fn peer_send_failure_annotates_message() {
    let (mut core, mut rx) = connected_core();
    core.send_peer_message("node-2", "hey").unwrap();
    let id = next_frame(&mut rx)["id"].as_str().unwrap().to_string();

    let response = json!({ "id": id, "status": "ERROR", "payload": { "message": "peer offline" } });
    core.apply_text(&response.to_string());
    let log = core.store().log(&ConversationId::peer("node-2"));
    assert_eq!(log[0].text, "hey (failed: peer offline)");
    assert!(!log[0].is_pending());
}

// ===========================================================================
// RecentKeys — bounded FIFO dedup
// ===========================================================================

#[test]
fn recent_keys_default_capacity() {
    let keys = RecentKeys::default();
    assert!(keys.is_empty());
    assert_eq!(DEDUP_CAPACITY, 100);
}

#[test]
fn recent_keys_fifo_eviction() {
    let mut keys = RecentKeys::new(3);
    assert!(keys.insert("a".to_string()));
    assert!(keys.insert("b".to_string()));
    assert!(keys.insert("c".to_string()));
    assert!(!keys.insert("a".to_string()));
    assert_eq!(keys.len(), 3);

    // "d" evicts "a" (oldest inserted), never "b" or "c".
    assert!(keys.insert("d".to_string()));
    assert!(!keys.contains("a"));
    assert!(keys.contains("b"));
    assert!(keys.contains("c"));

    // An evicted key is admitted again.
    assert!(keys.insert("a".to_string()));
}

#[test]
fn delivery_key_prefers_explicit_id() {
    assert_eq!(delivery_key(Some("m-1"), "node", "text"), "m-1");
    assert_eq!(delivery_key(None, "node", "text"), "node|text");
    assert_eq!(delivery_key(Some(""), "node", "text"), "node|text");
}

// ===========================================================================
// File transfers
// ===========================================================================

#[test]
fn outbound_transfer_lifecycle() {
    let (mut core, mut rx) = connected_core();
    let transfer_id = core
        .confirm_send_file("node-3", "/tmp/doc.pdf", "doc.pdf", 4096)
        .unwrap()
        .expect("transfer created");

    let frame = next_frame(&mut rx);
    assert_eq!(frame["command"], "send_file");
    assert_eq!(frame["params"]["transfer_id"], transfer_id.as_str());
    let cmd_id = frame["id"].as_str().unwrap().to_string();

    // A second confirmation for the same pair is suppressed while preparing.
    assert!(core
        .confirm_send_file("node-3", "/tmp/doc.pdf", "doc.pdf", 4096)
        .unwrap()
        .is_none());
    assert!(rx.try_recv().is_err());

    // Preparation progress arrives before the offer is acknowledged.
    let progress = json!({
        "event": "file_transfer_progress",
        "payload": { "transfer_id": transfer_id, "percent": 40.0, "phase": "hashing_file" },
    });
    core.apply_text(&progress.to_string());
    assert_eq!(
        core.transfers().get(&transfer_id).unwrap().state,
        TransferState::Preparing
    );

    let response = json!({ "id": cmd_id, "status": "OK", "payload": {} });
    core.apply_text(&response.to_string());
    assert_eq!(
        core.transfers().get(&transfer_id).unwrap().state,
        TransferState::Offered
    );

    // Once offered, the same pair may be sent again.
    assert!(core
        .confirm_send_file("node-3", "/tmp/doc.pdf", "doc.pdf", 4096)
        .unwrap()
        .is_some());

    let transferring = json!({
        "event": "file_transfer_progress",
        "payload": { "transfer_id": transfer_id, "percent": 10.0, "phase": "transferring" },
    });
    core.apply_text(&transferring.to_string());
    assert_eq!(
        core.transfers().get(&transfer_id).unwrap().state,
        TransferState::InProgress
    );

    let complete = json!({
        "event": "file_transfer_complete",
        "payload": { "transfer_id": transfer_id, "filename": "doc.pdf", "direction": "upload" },
    });
    core.apply_text(&complete.to_string());
    let record = core.transfers().get(&transfer_id).unwrap();
    assert_eq!(record.state, TransferState::Completed);
    assert_eq!(record.progress_percent, 100.0);
}

#[test]
fn inbound_offer_accept_and_complete_by_filename() {
    let (mut core, mut rx) = connected_core();
    let mut ui = core.subscribe();
    let offer = json!({
        "event": "file_transfer_offer",
        "payload": {
            "transfer_id": "t-9",
            "filename": "photo.jpg",
            "size_bytes": 2048,
            "sender_node_id": "node-4",
        },
    });
    core.apply_text(&offer.to_string());
    assert!(drain_ui(&mut ui)
        .iter()
        .any(|e| matches!(e, UiEvent::PromptFileOffer { transfer_id, .. } if transfer_id == "t-9")));

    // A re-delivered offer does not prompt again.
    core.apply_text(&offer.to_string());
    assert!(!drain_ui(&mut ui)
        .iter()
        .any(|e| matches!(e, UiEvent::PromptFileOffer { .. })));

    core.accept_file_offer("t-9").unwrap();
    assert_eq!(next_frame(&mut rx)["command"], "accept_file_offer");
    assert_eq!(
        core.transfers().get("t-9").unwrap().state,
        TransferState::Accepted
    );

    // Completion carries no transfer id; it resolves by filename + direction.
    let complete = json!({
        "event": "file_transfer_complete",
        "payload": { "filename": "photo.jpg", "direction": "download" },
    });
    core.apply_text(&complete.to_string());
    assert_eq!(
        core.transfers().get("t-9").unwrap().state,
        TransferState::Completed
    );

    core.apply_action(UserAction::AcknowledgeTransfer {
        transfer_id: "t-9".to_string(),
    });
    assert!(core.transfers().get("t-9").is_none());
}

#[test]
fn reject_offer_sends_cancel_with_declined_reason() {
    let (mut core, mut rx) = connected_core();
    let offer = json!({
        "event": "file_transfer_offer",
        "payload": {
            "transfer_id": "t-5",
            "filename": "a.bin",
            "size_bytes": 10,
            "sender_node_id": "node-4",
        },
    });
    core.apply_text(&offer.to_string());
    core.reject_file_offer("t-5").unwrap();
    let frame = next_frame(&mut rx);
    assert_eq!(frame["command"], "cancel_file_transfer");
    assert_eq!(frame["params"]["reason"], "declined");
    assert_eq!(
        core.transfers().get("t-5").unwrap().state,
        TransferState::Rejected
    );
}

#[test]
fn peer_cancellation_resolves_by_filename() {
    let (mut core, _rx) = connected_core();
    let offer = json!({
        "event": "file_transfer_offer",
        "payload": {
            "transfer_id": "t-6",
            "filename": "big.iso",
            "size_bytes": 1_000_000,
            "sender_node_id": "node-4",
        },
    });
    core.apply_text(&offer.to_string());
    let cancelled = json!({
        "event": "file_transfer_cancelled",
        "payload": { "filename": "big.iso", "reason": "hash_mismatch" },
    });
    core.apply_text(&cancelled.to_string());
    let record = core.transfers().get("t-6").unwrap();
    assert_eq!(record.state, TransferState::Cancelled);
    assert_eq!(record.cancel_reason.as_deref(), Some("hash_mismatch"));
}

#[test]
fn transfer_state_graph_rejects_illegal_moves() {
    let mut engine = TransferEngine::new();
    engine.inbound_offer("t-1", "f.txt", 1, "node-1");

    // Preparation progress outside Preparing is ignored.
    engine.progress("t-1", 50.0, TransferPhase::HashingFile).unwrap();
    assert_eq!(engine.get("t-1").unwrap().state, TransferState::Offered);

    // A download cannot complete from Offered; it must be accepted first.
    assert!(engine
        .complete(Some("t-1"), "f.txt", TransferDirection::Download)
        .is_none());
    assert_eq!(engine.get("t-1").unwrap().state, TransferState::Offered);

    engine.accept("t-1").unwrap();
    engine
        .progress("t-1", 30.0, TransferPhase::Transferring)
        .unwrap();
    assert!(engine
        .complete(Some("t-1"), "f.txt", TransferDirection::Download)
        .is_some());

    // Terminal records ignore further cancellation.
    engine.cancel("t-1", "user_cancelled").unwrap();
    assert_eq!(engine.get("t-1").unwrap().state, TransferState::Completed);
}

// ===========================================================================
// New-session protocol
// ===========================================================================

#[test]
fn session_proposal_prompts_once_and_takes_one_vote() {
    let (mut core, mut rx) = connected_core();
    let mut ui = core.subscribe();
    let proposal = json!({
        "event": "new_session_proposal",
        "payload": {
            "proposal_id": "sp-1",
            "initiator_node_id": "node-7",
            "conversation_id": "node-7",
        },
    });
    core.apply_text(&proposal.to_string());
    core.apply_text(&proposal.to_string());
    let prompts = drain_ui(&mut ui)
        .iter()
        .filter(|e| matches!(e, UiEvent::PromptNewSession { .. }))
        .count();
    assert_eq!(prompts, 1);

    core.vote_new_session("sp-1", true).unwrap();
    assert_eq!(next_frame(&mut rx)["command"], "vote_new_session");
    let err = core.vote_new_session("sp-1", true).unwrap_err();
    assert!(matches!(err, Error::AlreadyVoted(_)));
}

#[test]
fn approved_session_result_clears_peer_conversation() {
    let (mut core, _rx) = connected_core();
    let conv = ConversationId::peer("node-7");
    let message = json!({
        "event": "new_p2p_message",
        "payload": { "sender_node_id": "node-7", "text": "old history", "message_id": "m-1" },
    });
    core.apply_text(&message.to_string());
    assert_eq!(core.store().log(&conv).len(), 1);

    let result = json!({
        "event": "new_session_result",
        "payload": { "proposal_id": "sp-1", "result": "approved", "sender_node_id": "node-7" },
    });
    core.apply_text(&result.to_string());
    assert!(core.store().log(&conv).is_empty());
    assert_eq!(core.store().unread(&conv), 0);
}

#[test]
fn rejected_session_result_leaves_conversation_intact() {
    let (mut core, _rx) = connected_core();
    let conv = ConversationId::peer("node-7");
    let message = json!({
        "event": "new_p2p_message",
        "payload": { "sender_node_id": "node-7", "text": "history", "message_id": "m-1" },
    });
    core.apply_text(&message.to_string());

    let result = json!({
        "event": "new_session_result",
        "payload": { "proposal_id": "sp-1", "result": "rejected", "sender_node_id": "node-7" },
    });
    core.apply_text(&result.to_string());
    assert_eq!(core.store().log(&conv).len(), 1);
}

#[test]
fn one_pending_proposal_per_conversation() {
    let (mut core, mut rx) = connected_core();
    let conv = ConversationId::peer("node-7");
    core.propose_new_session(conv.clone(), vec!["node-7".to_string()])
        .unwrap();
    let frame = next_frame(&mut rx);
    assert_eq!(frame["command"], "propose_new_session");
    let cmd_id = frame["id"].as_str().unwrap().to_string();

    let response = json!({
        "id": cmd_id,
        "status": "OK",
        "payload": { "proposal_id": "sp-2" },
    });
    core.apply_text(&response.to_string());

    let err = core
        .propose_new_session(conv, vec!["node-7".to_string()])
        .unwrap_err();
    assert!(matches!(err, Error::ProposalPending(_)));
}

#[test]
fn session_proposal_expires_after_deadline() {
    let mut engine = NewSessionEngine::new();
    engine.on_proposal("sp-3", "node-7", "node-7", vec![]);
    assert!(engine.expire(Instant::now()).is_empty());
    let expired = engine.expire(Instant::now() + PROPOSAL_TIMEOUT + Duration::from_secs(1));
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].proposal_id, "sp-3");
    assert_eq!(engine.open_count(), 0);
}

#[test]
fn session_result_for_untracked_proposal_still_applies() {
    let mut engine = NewSessionEngine::new();
    let result = engine.on_result(
        "sp-unseen",
        SessionOutcome::Approved,
        None,
        Some("node-9"),
        None,
    );
    assert_eq!(
        result.clear_target,
        Some(ConversationId::peer("node-9"))
    );
}

// ===========================================================================
// Knowledge-commit protocol
// ===========================================================================

#[test]
fn commit_proposal_prompts_once() {
    let (mut core, _rx) = connected_core();
    let mut ui = core.subscribe();
    let proposal = json!({
        "event": "knowledge_commit_proposal",
        "payload": {
            "proposal_id": "kc-1",
            "initiator_node_id": "node-2",
            "topic": "game_design",
        },
    });
    core.apply_text(&proposal.to_string());
    core.apply_text(&proposal.to_string());
    let prompts = drain_ui(&mut ui)
        .iter()
        .filter(|e| matches!(e, UiEvent::PromptKnowledgeCommit { .. }))
        .count();
    assert_eq!(prompts, 1);
}

#[test]
fn commit_vote_and_result_notification() {
    let (mut core, mut rx) = connected_core();
    let mut ui = core.subscribe();
    let proposal = json!({
        "event": "knowledge_commit_proposal",
        "payload": {
            "proposal_id": "kc-1",
            "initiator_node_id": "node-2",
            "topic": "game_design",
        },
    });
    core.apply_text(&proposal.to_string());
    drain_ui(&mut ui);

    core.vote_knowledge_commit("kc-1", CommitVoteChoice::Approve, Some("looks right".to_string()))
        .unwrap();
    let frame = next_frame(&mut rx);
    assert_eq!(frame["command"], "vote_knowledge_commit");
    assert_eq!(frame["params"]["vote"], "approve");
    assert_eq!(frame["params"]["comment"], "looks right");

    let err = core
        .vote_knowledge_commit("kc-1", CommitVoteChoice::Approve, None)
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyVoted(_)));

    let result = json!({
        "event": "knowledge_commit_result",
        "payload": {
            "proposal_id": "kc-1",
            "status": "approved",
            "topic": "game_design",
            "vote_tally": { "approve": 3, "reject": 1, "request_changes": 0, "total": 4 },
        },
    });
    core.apply_text(&result.to_string());
    let events = drain_ui(&mut ui);
    assert!(events.iter().any(|e| matches!(
        e,
        UiEvent::Notification { level: NoticeLevel::Info, text } if text == "approved: game_design (3/4)"
    )));
}

#[test]
fn commit_result_retains_nothing() {
    let mut engine = KnowledgeCommitEngine::new();
    engine.on_proposal("kc-2", "node-2", "topic", None);
    assert_eq!(engine.open_count(), 1);
    let tally = VoteTally {
        approve: 1,
        reject: 2,
        request_changes: 0,
        total: 4,
    };
    let result = engine.on_result(
        Some("kc-2"),
        mindlink_core::CommitOutcome::Rejected,
        "topic",
        tally,
    );
    assert_eq!(result.notification(), "rejected: topic (1/4)");
    assert_eq!(engine.open_count(), 0);
    assert!(engine.get("kc-2").is_none());
}

// ===========================================================================
// Context staleness
// ===========================================================================

#[test]
fn context_stale_until_sent_and_after_change() {
    let mut tracker = ContextTracker::new();
    let conv = ConversationId::local_ai();
    let local = ContextSource::Local;

    tracker.mark_current(local.clone(), "hash-1");
    assert!(tracker.is_stale(&conv, &local));

    tracker.mark_sent(&conv, &local);
    assert!(!tracker.is_stale(&conv, &local));

    tracker.mark_current(local.clone(), "hash-2");
    assert!(tracker.is_stale(&conv, &local));
}

#[test]
fn context_staleness_is_per_conversation() {
    let mut tracker = ContextTracker::new();
    let a = ConversationId::new("a");
    let b = ConversationId::new("b");
    let local = ContextSource::Local;
    tracker.mark_current(local.clone(), "hash-1");
    tracker.mark_sent(&a, &local);
    assert!(!tracker.is_stale(&a, &local));
    assert!(tracker.is_stale(&b, &local));
}

#[test]
fn context_events_update_tracker_and_query_bundles_stale_sources() {
    let (mut core, mut rx) = connected_core();
    let updated = json!({ "event": "context_updated", "payload": { "context_hash": "h1" } });
    core.apply_text(&updated.to_string());
    let peer = json!({
        "event": "peer_context_updated",
        "payload": { "node_id": "node-5", "context_hash": "p1" },
    });
    core.apply_text(&peer.to_string());

    core.send_ai_query(ConversationId::local_ai(), "q").unwrap();
    let frame = next_frame(&mut rx);
    let refresh = frame["params"]["refresh_context"].as_array().unwrap();
    assert_eq!(refresh.len(), 2);

    // A second query with unchanged sources bundles nothing.
    core.send_ai_query(ConversationId::local_ai(), "q2").unwrap();
    let frame = next_frame(&mut rx);
    assert!(frame["params"]["refresh_context"].as_array().unwrap().is_empty());
}

// ===========================================================================
// History restoration and session teardown
// ===========================================================================

#[test]
fn history_restored_replaces_log_wholesale() {
    let (mut core, _rx) = connected_core();
    let conv = ConversationId::peer("node-1");
    let live = json!({
        "event": "new_p2p_message",
        "payload": { "sender_node_id": "node-1", "text": "live message", "message_id": "m-9" },
    });
    core.apply_text(&live.to_string());

    let restored = json!({
        "event": "history_restored",
        "payload": {
            "conversation_id": "node-1",
            "messages": [
                { "sender": "user", "text": "stored question" },
                { "sender": "assistant", "text": "stored answer" },
                { "sender": "node-1", "text": "stored peer line" },
            ],
            "message_count": 3,
        },
    });
    core.apply_text(&restored.to_string());

    let log = core.store().log(&conv);
    assert_eq!(log.len(), 3);
    assert_eq!(log[0].sender, Sender::User);
    assert_eq!(log[1].sender, Sender::Assistant);
    assert_eq!(log[2].sender, Sender::Peer("node-1".to_string()));
}

#[test]
fn end_session_removes_conversation_on_confirmation() {
    let (mut core, mut rx) = connected_core();
    let conv = ConversationId::new("ai-session-y");
    core.send_ai_query(conv.clone(), "hi").unwrap();
    let query_id = next_frame(&mut rx)["id"].as_str().unwrap().to_string();
    let response = json!({ "id": query_id, "status": "OK", "payload": { "content": "hello" } });
    core.apply_text(&response.to_string());
    assert!(core.store().contains(&conv));

    core.end_session(conv.clone()).unwrap();
    let end_id = next_frame(&mut rx)["id"].as_str().unwrap().to_string();

    // Local state survives until the core service confirms.
    assert!(core.store().contains(&conv));
    let response = json!({ "id": end_id, "status": "OK", "payload": {} });
    core.apply_text(&response.to_string());
    assert!(!core.store().contains(&conv));
}

// ===========================================================================
// Unknown events and malformed frames
// ===========================================================================

#[test]
fn unknown_event_kind_is_ignored() {
    let (mut core, _rx) = connected_core();
    let event = json!({ "event": "quantum_flux", "payload": { "level": 11 } });
    core.apply_text(&event.to_string());
    assert!(core.store().list().is_empty());
}

#[test]
fn garbage_frame_is_ignored() {
    let (mut core, _rx) = connected_core();
    core.apply_text("this is not json");
    core.apply_text("{\"neither\": \"response nor event\"}");
    assert!(core.store().list().is_empty());
}

// ===========================================================================
// Backoff
// ===========================================================================

#[test]
fn backoff_doubles_and_caps() {
    let mut backoff = Backoff::new();
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    assert_eq!(backoff.next_delay(), Duration::from_secs(16));
    assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    assert_eq!(backoff.next_delay(), Duration::from_secs(30));
}

#[test]
fn backoff_resets_on_success() {
    let mut backoff = Backoff::new();
    backoff.next_delay();
    backoff.next_delay();
    backoff.reset();
    assert_eq!(backoff.next_delay(), Duration::from_secs(1));
}

// ===========================================================================
// Client loop
// ===========================================================================

#[tokio::test]
async fn loop_walks_dial_phase_before_connected() {
    let (core, _outbound_rx) = ClientCore::new("self-node");
    let mut ui = core.subscribe();
    let (client_loop, input_tx) = ClientLoop::new(core);
    let handle = tokio::spawn(client_loop.run());

    // The socket pump reports a dial attempt before the connect resolves.
    input_tx.send(ClientInput::Connecting).unwrap();
    input_tx.send(ClientInput::ConnectionUp).unwrap();
    input_tx.send(ClientInput::Shutdown).unwrap();
    handle.await.unwrap();

    let phases: Vec<ConnectionPhase> = drain_ui(&mut ui)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::ConnectionChanged { phase } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![ConnectionPhase::Connecting, ConnectionPhase::Connected]
    );
}

#[tokio::test]
async fn loop_processes_actions_in_order() {
    let (mut core, mut outbound_rx) = ClientCore::new("self-node");
    core.connection_up();
    let mut ui = core.subscribe();
    let (client_loop, input_tx) = ClientLoop::new(core);
    let handle = tokio::spawn(client_loop.run());

    input_tx
        .send(ClientInput::Action(UserAction::SendAiQuery {
            conversation: ConversationId::local_ai(),
            prompt: "hello".to_string(),
        }))
        .unwrap();
    input_tx.send(ClientInput::Shutdown).unwrap();
    handle.await.unwrap();

    let frame = next_frame(&mut outbound_rx);
    assert_eq!(frame["command"], "execute_ai_query");
    assert!(drain_ui(&mut ui)
        .iter()
        .any(|e| matches!(e, UiEvent::ConversationChanged { .. })));
}

#[tokio::test]
async fn loop_surfaces_action_failures_as_notifications() {
    let (core, _outbound_rx) = ClientCore::new("self-node");
    // Deliberately not connected.
    let mut ui = core.subscribe();
    let (client_loop, input_tx) = ClientLoop::new(core);
    let handle = tokio::spawn(client_loop.run());

    input_tx
        .send(ClientInput::Action(UserAction::VoteNewSession {
            proposal_id: "sp-1".to_string(),
            approve: true,
        }))
        .unwrap();
    input_tx.send(ClientInput::Shutdown).unwrap();
    handle.await.unwrap();

    assert!(drain_ui(&mut ui).iter().any(|e| matches!(
        e,
        UiEvent::Notification { level: NoticeLevel::Error, .. }
    )));
}
