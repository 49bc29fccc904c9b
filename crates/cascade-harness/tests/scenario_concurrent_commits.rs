//! Concurrent conflicting commits: the cascade escalates to Restrained
//! Consensus and every member still delivers the same commit.

use std::time::Duration;

use cascade_harness::SimWorld;

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
fn concurrent_commits_converge_on_one_winner() {
    let mut world = established(&["alice", "bob", "carol"]);

    // Both members propose updates, everyone caches both.
    world.propose_update(0);
    world.run();
    world.propose_update(1);
    world.run();

    // Alice and Bob commit concurrently: both sign their own commit
    // before seeing the other's.
    let commit_a = world.commit(0);
    let commit_b = world.commit(1);
    assert_ne!(commit_a, commit_b);
    world.run();

    // Consensus safety: everyone delivered the same single commit and
    // moved to the same epoch.
    let winner = &world.members[0].delivered_commits;
    assert_eq!(winner.len(), 1);
    for member in &world.members {
        assert_eq!(
            member.delivered_commits, *winner,
            "member {} diverged",
            member.id
        );
        assert_eq!(member.epoch(), 2);
    }

    // Choice order: equal proposal counts, so the smaller sender leaf
    // (alice) wins.
    assert_eq!(winner[0], commit_a);
}

#[test]
fn loser_of_the_conflict_can_commit_again_next_epoch() {
    let mut world = established(&["alice", "bob", "carol"]);

    world.propose_update(0);
    world.run();
    world.propose_update(1);
    world.run();

    world.commit(0);
    world.commit(1);
    world.run();
    assert_eq!(world.epochs(), vec![2, 2, 2]);

    // Bob's update was committed by Alice's winning commit; Bob now
    // drives the next epoch alone.
    world.propose_update(2);
    world.run();
    let second = world.commit(1);
    world.run();

    assert_eq!(world.epochs(), vec![3, 3, 3]);
    for member in &world.members {
        assert_eq!(member.delivered_commits.last(), Some(&second));
    }
}
