//! End-to-end fan-out over the in-process pipeline: registry, estimator,
//! scheduler, dispatcher, and per-client queues wired exactly as the server
//! wires them, with probe samples injected instead of real sockets.

use std::sync::Arc;

use stagesync_core::models::ClientIdentity;
use stagesync_core::Config;
use stagesync_proto::{
    Capability, ClientId, ColorValue, CommandEnvelope, CommandOutcome, CommandPayload,
    ExclusionReason, TargetSelector, PROTOCOL_VERSION,
};
use stagesync_relay::hub::{Outbound, OutboundQueue};
use stagesync_relay::RelayState;

/// Register a client and feed it enough probe samples to qualify it with a
/// stable round-trip `rtt_ms` and clock offset `offset_ms`.
fn join_client(
    state: &RelayState,
    tags: &[&str],
    capabilities: &[Capability],
    rtt_ms: i64,
    offset_ms: i64,
) -> (ClientId, Arc<OutboundQueue>) {
    let now = state.clock.now_ms();
    let identity = ClientIdentity::new(
        tags.iter().map(|tag| (*tag).to_string()).collect(),
        capabilities.iter().copied().collect(),
        now,
    );
    let id = identity.id.clone();
    state.registry.register(identity).unwrap();
    let queue = state.hub.attach(id.clone());

    for probe in 0..3 {
        let sent = now + probe * 10;
        let echoed = sent + rtt_ms / 2 + offset_ms;
        let received = sent + rtt_ms;
        state.estimator.sample(&id, sent, echoed, received).unwrap();
    }
    (id, queue)
}

fn color_command(command_id: u64, target: TargetSelector) -> CommandEnvelope {
    CommandEnvelope {
        version: PROTOCOL_VERSION,
        command_id,
        payload: CommandPayload::SendColor {
            color: ColorValue::Rgb(255, 140, 0),
            zone: Some("center".to_string()),
        },
        target,
        deadline_hint_ms: None,
    }
}

fn pop_instruction(queue: &OutboundQueue) -> Option<stagesync_proto::ScheduledInstruction> {
    match queue.try_pop() {
        Some(Outbound::Instruction(instruction)) => Some(instruction),
        _ => None,
    }
}

#[tokio::test]
async fn test_tagged_fanout_shares_one_deadline() {
    let state = RelayState::new(Config::default());

    // Three synced clients in the target zone with spread latencies, plus
    // one untagged client that must see nothing.
    let (slow_id, slow_queue) = join_client(&state, &["zone-center"], &[Capability::Color], 150, 40);
    let (mid_id, mid_queue) = join_client(&state, &["zone-center"], &[Capability::Color], 80, -25);
    let (fast_id, fast_queue) = join_client(&state, &["zone-center"], &[Capability::Color], 20, 0);
    let (_other_id, other_queue) = join_client(&state, &["zone-left"], &[Capability::Color], 30, 5);

    let before = state.clock.now_ms();
    let report = state.dispatcher.dispatch(&color_command(
        1,
        TargetSelector::ByTag {
            tag: "zone-center".to_string(),
        },
    ));

    assert_eq!(report.outcome, CommandOutcome::Delivered);
    assert_eq!(report.resolved, 3);
    assert_eq!(report.scheduled, 3);
    assert!(report.excluded.is_empty());

    // The shared deadline is sized to the slowest member plus the margin.
    let deadline = report.deadline_ms.unwrap();
    let margin = state.config.sync.safety_margin_ms;
    assert!(deadline >= before + 150 + margin);
    assert!(deadline <= state.clock.now_ms() + 150 + margin + 5);

    // Exactly one instruction per zone member, each translated into that
    // client's clock domain.
    for (id, queue, offset) in [
        (&slow_id, &slow_queue, 40),
        (&mid_id, &mid_queue, -25),
        (&fast_id, &fast_queue, 0),
    ] {
        let instruction = pop_instruction(queue).expect("zone member should receive instruction");
        assert_eq!(instruction.command_id, 1);
        assert_eq!(&instruction.client_id, id);
        assert_eq!(instruction.execute_at_ms, deadline + offset);
        assert!(queue.is_empty());
    }

    assert!(other_queue.is_empty());
}

#[tokio::test]
async fn test_unsynchronized_client_excluded_not_fatal() {
    let state = RelayState::new(Config::default());

    let (synced_id, synced_queue) = join_client(&state, &["stage"], &[Capability::Color], 40, 10);

    // One client registers but never completes qualification.
    let now = state.clock.now_ms();
    let unsynced = ClientIdentity::new(
        std::iter::once("stage".to_string()).collect(),
        std::iter::once(Capability::Color).collect(),
        now,
    );
    let unsynced_id = unsynced.id.clone();
    state.registry.register(unsynced).unwrap();
    state.hub.attach(unsynced_id.clone());

    let report = state.dispatcher.dispatch(&color_command(2, TargetSelector::All));

    assert_eq!(report.outcome, CommandOutcome::Delivered);
    assert_eq!(report.resolved, 2);
    assert_eq!(report.scheduled, 1);
    assert_eq!(report.excluded.len(), 1);
    assert_eq!(report.excluded[0].client_id, unsynced_id);
    assert_eq!(report.excluded[0].reason, ExclusionReason::Unsynchronized);

    let instruction = pop_instruction(&synced_queue).unwrap();
    assert_eq!(instruction.client_id, synced_id);
}

#[tokio::test]
async fn test_newer_command_supersedes_inflight_same_kind() {
    let state = RelayState::new(Config::default());
    let (_id, queue) = join_client(&state, &["stage"], &[Capability::Color], 40, 0);

    let first = state.dispatcher.dispatch(&color_command(10, TargetSelector::All));
    assert_eq!(first.scheduled, 1);
    let second = state.dispatcher.dispatch(&color_command(11, TargetSelector::All));
    assert_eq!(second.scheduled, 1);

    // The superseded instruction was purged while still queued, so only the
    // cancel and the replacement remain, in that order.
    assert_eq!(queue.try_pop(), Some(Outbound::Cancel { command_id: 10 }));
    let replacement = pop_instruction(&queue).unwrap();
    assert_eq!(replacement.command_id, 11);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_unreachable_deadline_hint_rejected() {
    let state = RelayState::new(Config::default());
    join_client(&state, &["stage"], &[Capability::Color], 120, 0);

    let mut envelope = color_command(20, TargetSelector::All);
    // Earlier than any possible round-trip from now.
    envelope.deadline_hint_ms = Some(state.clock.now_ms() + 10);

    let report = state.dispatcher.dispatch(&envelope);
    match report.outcome {
        CommandOutcome::Rejected { reason } => {
            assert!(reason.contains("deadline"), "unexpected reason: {reason}");
        }
        CommandOutcome::Delivered => panic!("expected rejection"),
    }
    assert_eq!(report.scheduled, 0);
}

#[tokio::test]
async fn test_empty_target_set_succeeds_trivially() {
    let state = RelayState::new(Config::default());
    join_client(&state, &["zone-left"], &[Capability::Color], 30, 0);

    let report = state.dispatcher.dispatch(&color_command(
        30,
        TargetSelector::ByTag {
            tag: "zone-right".to_string(),
        },
    ));

    assert_eq!(report.outcome, CommandOutcome::Delivered);
    assert_eq!(report.resolved, 0);
    assert_eq!(report.scheduled, 0);
    assert!(report.deadline_ms.is_none());
}

#[tokio::test]
async fn test_capability_mismatch_filtered_silently() {
    let state = RelayState::new(Config::default());
    let (_lights_id, lights_queue) =
        join_client(&state, &["stage"], &[Capability::Color], 30, 0);
    let (_speaker_id, speaker_queue) =
        join_client(&state, &["stage"], &[Capability::Sound], 30, 0);

    let report = state.dispatcher.dispatch(&color_command(40, TargetSelector::All));

    // The sound-only client is neither scheduled nor reported excluded.
    assert_eq!(report.resolved, 1);
    assert_eq!(report.scheduled, 1);
    assert!(report.excluded.is_empty());
    assert!(pop_instruction(&lights_queue).is_some());
    assert!(speaker_queue.is_empty());
}
