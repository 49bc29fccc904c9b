//! Retract path: a conflicting committer that has not yet delivered the
//! conflict when a participation arrives withdraws from Restrained
//! Consensus, and the remaining participant decides a single-element
//! subset. Everyone still converges on the same commit.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use cascade_harness::SimWorld;
use cascade_proto::{
    CacKind, CacMessage, CascadeBody, CascadeConsensusMessage, Identity,
    RestrainedConsensusMessage,
};

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
fn delayed_participant_retracts_and_the_group_converges() {
    let mut world = established(&["alice", "bob", "carol", "dave"]);

    // Starve bob of ready-phase frames: he keeps witnessing and sending
    // his own signatures, but can never complete a CAC delivery, so
    // alice's participation reaches him before he joins the round.
    let retracts_seen = Rc::new(Cell::new(0u32));
    let retract_counter = retracts_seen.clone();
    let bob = Identity::from("bob");
    world.set_link_hook(Box::new(move |_, to, decoded, _| {
        match decoded {
            Some(CascadeConsensusMessage {
                body: CascadeBody::Restrained(RestrainedConsensusMessage::Retract(_)),
                ..
            }) => {
                retract_counter.set(retract_counter.get() + 1);
                false
            },
            Some(CascadeConsensusMessage {
                body: CascadeBody::Cac(CacMessage { kind: CacKind::Ready, .. }),
                ..
            }) => *to == bob,
            _ => false,
        }
    }));

    world.propose_update(0);
    world.run();
    world.propose_update(1);
    world.run();

    let commit_a = world.commit(0);
    let commit_b = world.commit(1);
    assert_ne!(commit_a, commit_b);
    world.run();

    // Bob retracted rather than participating.
    assert!(retracts_seen.get() > 0, "bob must have sent a retract");

    // Alice's single-element decision carried her commit through the
    // second CAC instance; everyone delivered it, including bob.
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
