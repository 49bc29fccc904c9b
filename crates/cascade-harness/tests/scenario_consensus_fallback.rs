//! Full Consensus fallback: when the second CAC instance itself ends in
//! conflict, the pipeline falls through to PBFT and still converges.
//!
//! Honest members with full connectivity never reach this stage (the
//! conflict-set guarantees of CAC see to that), so the scenario drives
//! one member (carol) as an equivocator: the test signs a second,
//! contradictory CAC₂ statement with her key while her real stack is
//! cut off behind a slow link. With `k = 1` a single inconsistent
//! witness is enough to split the conflict set.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use cascade_core::signature::CacSignature;
use cascade_core::GroupState;
use cascade_harness::SimWorld;
use cascade_proto::{
    Cac2Content, CacKind, CacMessage, CascadeBody, CascadeConsensusMessage, DdsMessage,
};
use cascade_proto::wire::WireEncode;

fn established(names: &[&str]) -> SimWorld {
    let mut world = SimWorld::new(names, Duration::from_millis(100));
    world.create_group(0);
    for target in 1..names.len() {
        world.propose_add(0, target);
    }
    world.run();
    world.commit(0);
    world.run();
    world
}

#[test]
fn cac2_conflict_falls_through_to_full_consensus() {
    let mut world = established(&["alice", "bob", "carol"]);

    // Count PBFT traffic and suppress Restrained Consensus entirely, so
    // both committers time out into the second CAC instance.
    let fc_frames = Rc::new(Cell::new(0u32));
    let fc_counter = fc_frames.clone();
    world.set_link_hook(Box::new(move |_, _, decoded, _| match decoded {
        Some(CascadeConsensusMessage { body: CascadeBody::Restrained(_), .. }) => true,
        Some(CascadeConsensusMessage { body: CascadeBody::Consensus(_), .. }) => {
            fc_counter.set(fc_counter.get() + 1);
            false
        },
        _ => false,
    }));

    world.propose_update(0);
    world.run();
    world.propose_update(1);
    world.run();

    let start = world.now();
    let commit_a = world.commit(0);
    let commit_b = world.commit(1);
    assert_ne!(commit_a, commit_b);

    // Let the conflicting CAC₁ instance resolve; the restrained round
    // is silenced, so both participants sit on their decision timers.
    world.run_until(start + Duration::from_millis(150));

    // From here on carol hears nothing for a long while.
    world.set_link_delay(0, 2, Duration::from_secs(10));
    world.set_link_delay(1, 2, Duration::from_secs(10));

    // Decision timers (2·RTT) fire: alice and bob submit the delivered
    // pair to CAC₂ and stall one ready short of the quorum.
    world.run_until(start + Duration::from_millis(300));
    assert_eq!(world.epochs(), vec![1, 1, 1], "no premature agreement");

    // Equivocation: sign a contradictory CAC₂ statement with carol's
    // key and slip it to alice and bob before carol's own (consistent)
    // fallback statement can reach them.
    let carol_group = world.members[2].group.clone().expect("carol has a group");
    let forged_content =
        Cac2Content { conflicting_messages: vec![commit_a], signatures: Vec::new() };
    let witness =
        CacSignature::sign(&carol_group, 0, CacKind::Witness, forged_content.content_ref());
    let ready =
        CacSignature::sign(&carol_group, 1, CacKind::Ready, forged_content.content_ref());

    let witness_frame = CascadeConsensusMessage::cac2(CacMessage {
        kind: CacKind::Witness,
        sigs: vec![witness.content.clone()],
        payload: Some(forged_content),
    });
    let ready_frame = CascadeConsensusMessage::cac2(CacMessage {
        kind: CacKind::Ready,
        sigs: vec![witness.content, ready.content],
        payload: None,
    });

    for frame in [witness_frame, ready_frame] {
        let protected =
            DdsMessage::CascadeConsensus(carol_group.protect(&frame.encode_to_bytes()));
        world.inject_with_delay(0, protected.clone(), Duration::ZERO);
        world.inject_with_delay(1, protected, Duration::ZERO);
    }

    world.run();

    // The split conflict set forced Full Consensus, and everyone still
    // delivered the same commit: alice's, by the Choice order.
    assert!(fc_frames.get() > 0, "full consensus must have run");
    for member in &world.members {
        assert_eq!(
            member.delivered_commits,
            vec![commit_a],
            "member {} diverged",
            member.id
        );
        assert_eq!(member.epoch(), 2);
    }
}
