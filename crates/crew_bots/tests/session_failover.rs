//! End-to-end ownership handoff and failover across three participants.

use std::collections::BTreeMap;

use crew_bots::{
    IdentitySelector, InMemoryHub, InMemoryTransport, NullHooks, Perception, SessionConfig,
    SessionContext, SessionEventBody, SpawnParams, BRAINDEAD_SETTLE_TICKS, PANIC_EXIT_THRESHOLD,
};
use crew_bots_proto::BehaviorState;

fn pump(sessions: &mut [SessionContext<InMemoryTransport>]) {
    let perceptions = BTreeMap::new();
    let mut hooks = NullHooks;
    for session in sessions.iter_mut() {
        session.tick(&perceptions, &mut hooks).expect("tick");
    }
}

#[test]
fn transfer_chain_rederives_item_authority_and_disconnect_recovers() {
    let hub = InMemoryHub::new(0);
    let mut sessions: Vec<SessionContext<InMemoryTransport>> = (0..3u64)
        .map(|participant| {
            SessionContext::new(SessionConfig::default(), hub.attach(participant))
        })
        .collect();

    // Host spawns a bot it owns, holding one item.
    let confirmed = sessions[0]
        .spawn_bot(IdentitySelector::Next, &SpawnParams::default())
        .expect("spawn")
        .expect("committed");
    let instance_id = confirmed.instance_id;
    sessions[0].attach_item(77, instance_id).expect("attach item");
    assert_eq!(sessions[0].authority().item_authority(77), Some(0));
    pump(&mut sessions);

    // Participant 1 requests ownership; host commits and broadcasts.
    sessions[1].request_ownership(instance_id).expect("request");
    pump(&mut sessions);
    pump(&mut sessions);
    for session in &sessions {
        assert_eq!(session.authority().current_owner(instance_id), Some(1));
    }
    // Item authority followed the committed token, never independently.
    assert_eq!(sessions[0].authority().item_authority(77), Some(1));

    // Participant 2 takes over next; generation keeps climbing.
    sessions[2].request_ownership(instance_id).expect("request");
    pump(&mut sessions);
    pump(&mut sessions);
    let generation_at_two = sessions[0]
        .authority()
        .token(instance_id)
        .expect("token")
        .generation;
    assert_eq!(sessions[0].authority().current_owner(instance_id), Some(2));
    assert_eq!(sessions[0].authority().item_authority(77), Some(2));

    // Owner drops out; the host reclaims the entity with a new generation
    // so the bot is never left without a simulating participant.
    hub.disconnect(2);
    sessions.remove(2);
    pump(&mut sessions);
    pump(&mut sessions);

    for session in &sessions {
        let token = session.authority().token(instance_id).expect("token");
        assert_eq!(token.owner, 0);
        assert_eq!(token.generation, generation_at_two + 1);
    }
    assert_eq!(sessions[0].authority().item_authority(77), Some(0));
    assert!(sessions[0].journal().events().any(|event| matches!(
        event.body,
        SessionEventBody::OwnerReassigned { entity_id, to: 0, .. } if entity_id == instance_id
    )));
}

#[test]
fn ownership_handoff_resumes_behavior_from_replicated_state() {
    let hub = InMemoryHub::new(0);
    let mut sessions: Vec<SessionContext<InMemoryTransport>> = (0..2u64)
        .map(|participant| {
            SessionContext::new(SessionConfig::default(), hub.attach(participant))
        })
        .collect();

    let confirmed = sessions[0]
        .spawn_bot(IdentitySelector::Next, &SpawnParams::default())
        .expect("spawn")
        .expect("committed");
    let instance_id = confirmed.instance_id;
    pump(&mut sessions);

    // The owning host drives the machine into Panik while the mirror
    // follows through snapshots.
    let mut perceptions = BTreeMap::new();
    perceptions.insert(
        instance_id,
        Perception {
            enemy_nearby: true,
            ..Perception::default()
        },
    );
    let mut hooks = NullHooks;
    for _ in 0..(BRAINDEAD_SETTLE_TICKS + 2) {
        sessions[0].tick(&perceptions, &mut hooks).expect("owner tick");
        sessions[1].tick(&BTreeMap::new(), &mut hooks).expect("mirror tick");
    }

    sessions[1].request_ownership(instance_id).expect("request");
    pump(&mut sessions);
    pump(&mut sessions);
    assert_eq!(
        sessions[1].authority().current_owner(instance_id),
        Some(1)
    );

    // The new owner picks up where the old one left off, not at BrainDead.
    let machine = &sessions[1]
        .lifecycle()
        .instance(instance_id)
        .expect("instance")
        .machine;
    assert_eq!(machine.state(), BehaviorState::Panik);
    assert!(machine.fear() >= PANIC_EXIT_THRESHOLD);

    // And keeps simulating it: under the same threat it stays panicked.
    sessions[1].tick(&perceptions, &mut hooks).expect("new owner tick");
    assert_eq!(
        sessions[1]
            .lifecycle()
            .instance(instance_id)
            .expect("instance")
            .machine
            .state(),
        BehaviorState::Panik
    );
}

#[test]
fn stale_transfer_request_is_rejected_for_the_requester_only() {
    let hub = InMemoryHub::new(0);
    let mut sessions: Vec<SessionContext<InMemoryTransport>> = (0..3u64)
        .map(|participant| {
            SessionContext::new(SessionConfig::default(), hub.attach(participant))
        })
        .collect();

    let confirmed = sessions[0]
        .spawn_bot(IdentitySelector::Next, &SpawnParams::default())
        .expect("spawn")
        .expect("committed");
    let instance_id = confirmed.instance_id;
    pump(&mut sessions);

    // Both peers request with the same expected generation; the first commit
    // advances it, so the second request arrives stale.
    sessions[1].request_ownership(instance_id).expect("request");
    sessions[2].request_ownership(instance_id).expect("request");
    pump(&mut sessions);
    pump(&mut sessions);

    for session in &sessions {
        assert_eq!(session.authority().current_owner(instance_id), Some(1));
    }
    assert!(sessions[2].journal().events().any(|event| matches!(
        event.body,
        SessionEventBody::TransferRejected { entity_id, .. } if entity_id == instance_id
    )));
    assert_eq!(sessions[2].pending_requests(), 0);
}
