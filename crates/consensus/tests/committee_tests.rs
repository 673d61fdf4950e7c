//! Committee-level behavior of the consensus state machine.

mod common;

use common::*;
use std::collections::{HashMap, HashSet};
use vbft_consensus::{
    select_leader, Block, ConsensusError, ConsensusEvent, ConsensusMessageType, ConsensusPayload,
    Ledger, SignedMessage, Step, Transaction,
};
use vbft_cryptography::Hash256;

/// Starts the round-0 leader and one other member without wiring them
/// together. Returns the committee, the member and the leader's proposal.
fn leader_and_member() -> (Committee, u32, SignedMessage, Hash256) {
    let mut committee = Committee::new(4);
    let leader = committee.node(0).service.context().leader(0).unwrap();
    let member = (leader + 1) % 4;

    committee
        .node_mut(leader)
        .service
        .start(START_TIME)
        .unwrap();
    committee
        .node_mut(member)
        .service
        .start(START_TIME)
        .unwrap();

    let proposal = committee
        .node_mut(leader)
        .drain()
        .into_iter()
        .find_map(|event| match event {
            ConsensusEvent::Broadcast(message)
                if message.message.message_type() == ConsensusMessageType::Proposal =>
            {
                Some(message)
            }
            _ => None,
        })
        .expect("leader proposes on start");
    let block_hash = match &proposal.message.payload {
        ConsensusPayload::Proposal(p) => p.block.hash(),
        _ => unreachable!(),
    };
    (committee, member, proposal, block_hash)
}

fn others(member: u32) -> Vec<u32> {
    (0..4).filter(|i| *i != member).collect()
}

#[test]
fn test_committee_finalizes_identical_blocks() {
    let mut committee = Committee::new(4);
    for node in &committee.nodes {
        for i in 0..3u8 {
            node.txpool.add(Transaction::new(vec![0xAB, i]));
        }
    }
    committee.start();

    assert!(committee.run_until(50, 20_000, |c| c.min_live_height() >= 5));

    let reference = committee.node(0).ledger.block_hashes();
    for node in &committee.nodes {
        assert_eq!(node.ledger.block_hashes()[..6], reference[..6]);
        assert!(node.txpool.is_empty());
    }
    let first = committee.node(0).ledger.block_by_height(1).unwrap();
    assert_eq!(first.transactions.len(), 3);

    // Never two different blocks at one height
    let mut decided: HashMap<u32, Hash256> = HashMap::new();
    for node in &committee.nodes {
        let finalized = node.finalized();
        let heights: HashSet<u32> = finalized.iter().map(|f| f.0).collect();
        assert_eq!(heights.len(), finalized.len(), "height finalized twice");
        for (height, _, hash) in finalized {
            assert_eq!(*decided.entry(height).or_insert(hash), hash);
        }
    }
}

#[test]
fn test_three_matching_commits_finalize_two_do_not() {
    let (mut committee, member, proposal, block_hash) = leader_and_member();
    let voters = others(member);
    let node = committee.node_mut(member);

    node.deliver(&proposal).unwrap();
    node.drain();
    assert_eq!(
        node.service
            .context()
            .votes
            .vote_of(0, ConsensusMessageType::Endorse, member),
        Some(block_hash)
    );

    let commit = ConsensusMessageType::Commit;
    node.deliver(&signed_vote(voters[0], 1, 0, commit, block_hash))
        .unwrap();
    node.deliver(&signed_vote(voters[1], 1, 0, commit, block_hash))
        .unwrap();
    // A repeated vote is not a new vote
    node.deliver(&signed_vote(voters[1], 1, 0, commit, block_hash))
        .unwrap();
    node.drain();

    assert!(node.finalized().is_empty());
    assert_eq!(
        node.service.context().votes.count(0, commit, &block_hash),
        2
    );

    node.deliver(&signed_vote(voters[2], 1, 0, commit, block_hash))
        .unwrap();
    node.drain();
    assert_eq!(node.finalized(), vec![(1, 0, block_hash)]);
    assert_eq!(node.service.context().step, Step::Finalizing);
}

#[test]
fn test_mismatched_hashes_do_not_finalize() {
    let (mut committee, member, proposal, block_hash) = leader_and_member();
    let voters = others(member);
    let node = committee.node_mut(member);
    node.deliver(&proposal).unwrap();

    let commit = ConsensusMessageType::Commit;
    node.deliver(&signed_vote(voters[0], 1, 0, commit, block_hash))
        .unwrap();
    node.deliver(&signed_vote(voters[1], 1, 0, commit, block_hash))
        .unwrap();
    node.deliver(&signed_vote(voters[2], 1, 0, commit, Hash256::of(b"other")))
        .unwrap();
    node.drain();
    assert!(node.finalized().is_empty());
}

#[test]
fn test_leader_selection_is_pure() {
    let mut committee = Committee::new(4);
    let seed = committee.genesis.header.vrf_value;

    for round in 0..32 {
        let leader = select_leader(&[0, 1, 2, 3], &seed, round);
        assert_eq!(leader, select_leader(&[0, 1, 2, 3], &seed, round));
        assert_eq!(leader, select_leader(&[3, 1, 0, 2], &seed, round));
        assert_ne!(leader, select_leader(&[0, 1, 2, 3], &seed, round + 1));
        for node in &committee.nodes {
            assert_eq!(node.service.context().leader(round), leader);
        }
    }

    // Every member derives the same leader for each new height
    committee.start();
    assert!(committee.run_until(50, 10_000, |c| c.min_live_height() >= 2));
    let statuses: HashSet<_> = committee
        .nodes
        .iter()
        .map(|n| (n.service.status().height, n.service.status().leader))
        .collect();
    assert_eq!(statuses.len(), 1);
}

#[test]
fn test_round_timeout_moves_to_next_leader() {
    let mut committee = Committee::new(4);
    let leader0 = committee.node(0).service.context().leader(0).unwrap();
    let leader1 = committee.node(0).service.context().leader(1).unwrap();
    assert_ne!(leader0, leader1);

    committee.isolate(leader0);
    committee.start();
    assert!(committee.run_until(50, 5_000, |c| c.min_live_height() >= 1));

    for node in committee.live_nodes() {
        let (height, round, _) = node.finalized()[0];
        assert_eq!(height, 1);
        assert!(round >= 1);
        assert!(node.log.iter().any(|event| matches!(
            event,
            ConsensusEvent::RoundTimeout { height: 1, round: 0, leader: Some(l) } if *l == leader0
        )));
        assert!(node.log.iter().any(|event| matches!(
            event,
            ConsensusEvent::RoundChanged {
                height: 1,
                old_round: 0,
                new_round: 1
            }
        )));
    }
}

#[test]
fn test_votes_do_not_carry_across_rounds() {
    let (mut committee, member, proposal, block_hash) = leader_and_member();
    let voters = others(member);
    let node = committee.node_mut(member);
    node.deliver(&proposal).unwrap();

    let commit = ConsensusMessageType::Commit;
    node.deliver(&signed_vote(voters[0], 1, 0, commit, block_hash))
        .unwrap();
    node.deliver(&signed_vote(voters[1], 1, 0, commit, block_hash))
        .unwrap();
    // Held until round 1 begins
    node.deliver(&signed_vote(voters[2], 1, 1, commit, block_hash))
        .unwrap();
    assert_eq!(
        node.service.context().votes.count(1, commit, &block_hash),
        0
    );

    node.service.on_timer_tick(START_TIME + 300).unwrap();
    node.drain();

    let context = node.service.context();
    assert_eq!(context.round, 1);
    assert_eq!(context.votes.count(0, commit, &block_hash), 2);
    assert_eq!(context.votes.count(1, commit, &block_hash), 1);
    assert!(node.finalized().is_empty());
}

#[test]
fn test_tampered_vote_is_rejected() {
    let (mut committee, member, proposal, block_hash) = leader_and_member();
    let voters = others(member);
    let node = committee.node_mut(member);
    node.deliver(&proposal).unwrap();

    let commit = ConsensusMessageType::Commit;
    node.deliver(&signed_vote(voters[0], 1, 0, commit, block_hash))
        .unwrap();
    node.deliver(&signed_vote(voters[1], 1, 0, commit, block_hash))
        .unwrap();

    let mut bytes = signed_vote(voters[2], 1, 0, commit, block_hash).encode();
    let last_hash_byte = vbft_consensus::messages::HEADER_SIZE + 31;
    bytes[last_hash_byte] ^= 0x01;
    assert!(matches!(
        node.receive(&bytes),
        Err(ConsensusError::BadSignature { sender }) if sender == voters[2]
    ));

    node.drain();
    assert!(node.finalized().is_empty());
    assert_eq!(node.service.context().votes.voters(0, commit), 2);
}

#[test]
fn test_corrupted_members_cannot_reach_quorum() {
    let mut committee = Committee::new(4);
    let leader = committee.node(0).service.context().leader(0).unwrap();
    committee.corrupted.insert((leader + 1) % 4);
    committee.corrupted.insert((leader + 2) % 4);
    committee.start();

    committee.run_until(100, 3_000, |_| false);
    assert!(committee.rejected > 0);
    for node in &committee.nodes {
        assert!(node.finalized().is_empty());
    }
}

#[test]
fn test_one_partitioned_member_does_not_block_progress() {
    let mut committee = Committee::new(4);
    committee.isolate(3);
    committee.start();

    assert!(committee.run_until(50, 30_000, |c| c.min_live_height() >= 3));
    assert_eq!(committee.node(3).height(), 0);
    for node in committee.live_nodes() {
        assert!(!node.service.status().stalled);
        assert_eq!(
            node.count_events(|e| matches!(e, ConsensusEvent::Stalled { .. })),
            0
        );
    }
}

#[test]
fn test_two_partitioned_members_stall_the_committee() {
    let mut committee = Committee::new(4);
    committee.isolate(2);
    committee.isolate(3);
    committee.start();

    // Ten rounds of back-off: 300 + 600 + 1200 + 2400 + 6 * 4800
    committee.run_until(100, 33_000, |_| false);

    for node in committee.live_nodes() {
        assert!(node.finalized().is_empty());
        assert_eq!(node.height(), 0);
        assert!(node.service.context().round >= 9);
        let status = node.service.status();
        assert!(status.stalled);
        assert_eq!(status.active_peers, 1);
        assert!(node.count_events(|e| matches!(e, ConsensusEvent::Stalled { quorum: 3, .. })) > 0);
    }
}

#[test]
fn test_equivocating_voter_is_reported_once_counted() {
    let (mut committee, member, proposal, block_hash) = leader_and_member();
    let voter = others(member)[0];
    let node = committee.node_mut(member);
    node.deliver(&proposal).unwrap();

    let endorse = ConsensusMessageType::Endorse;
    node.deliver(&signed_vote(voter, 1, 0, endorse, block_hash))
        .unwrap();
    node.deliver(&signed_vote(voter, 1, 0, endorse, Hash256::of(b"fork")))
        .unwrap();
    node.drain();

    let reports: Vec<_> = node
        .log
        .iter()
        .filter_map(|event| match event {
            ConsensusEvent::Equivocation(evidence) => Some(evidence.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].sender, voter);
    assert_eq!(reports[0].first, block_hash);
    assert_eq!(
        node.service.context().votes.vote_of(0, endorse, voter),
        Some(block_hash)
    );
}

#[test]
fn test_proposal_from_wrong_leader_is_rejected() {
    let (mut committee, member, proposal, _) = leader_and_member();
    let leader = proposal.message.sender;
    let impostor = (0..4).find(|i| *i != leader && *i != member).unwrap();

    let mut message = proposal.message.clone();
    message.sender = impostor;
    if let ConsensusPayload::Proposal(p) = &mut message.payload {
        p.block.header.proposer = impostor;
    }
    let forged = message.sign(&keypair(impostor));

    let node = committee.node_mut(member);
    assert!(matches!(
        node.deliver(&forged),
        Err(ConsensusError::WrongLeader { expected, got }) if expected == leader && got == impostor
    ));
    assert!(node.service.context().proposals.is_empty());
}

#[test]
fn test_proposal_with_forged_vrf_is_rejected() {
    let (mut committee, member, proposal, _) = leader_and_member();
    let leader = proposal.message.sender;

    let mut message = proposal.message.clone();
    if let ConsensusPayload::Proposal(p) = &mut message.payload {
        p.block.header.vrf_value.0[0] ^= 0xFF;
    }
    let forged = message.sign(&keypair(leader));

    let node = committee.node_mut(member);
    assert!(matches!(
        node.deliver(&forged),
        Err(ConsensusError::InvalidProposal { .. })
    ));
    // The genuine proposal is still accepted afterwards
    node.deliver(&proposal).unwrap();
    assert_eq!(node.service.context().proposals.len(), 1);
}

#[test]
fn test_message_admission_by_height() {
    let (mut committee, member, _, block_hash) = leader_and_member();
    let voter = others(member)[0];
    let node = committee.node_mut(member);
    let endorse = ConsensusMessageType::Endorse;

    assert!(matches!(
        node.deliver(&signed_vote(voter, 0, 0, endorse, block_hash)),
        Err(ConsensusError::StaleHeight { current: 1, got: 0 })
    ));

    node.deliver(&signed_vote(voter, 2, 0, endorse, block_hash))
        .unwrap();
    assert_eq!(node.service.context().next_height_buffered(), 1);

    // Too far ahead to be useful
    node.deliver(&signed_vote(voter, 9, 0, endorse, block_hash))
        .unwrap();
    assert_eq!(node.service.context().next_height_buffered(), 1);
}

#[test]
fn test_f_plus_one_later_round_messages_skip_ahead() {
    let (mut committee, member, _, block_hash) = leader_and_member();
    let voters = others(member);
    let node = committee.node_mut(member);
    let endorse = ConsensusMessageType::Endorse;

    node.deliver(&signed_vote(voters[0], 1, 3, endorse, block_hash))
        .unwrap();
    assert_eq!(node.service.context().round, 0);
    node.deliver(&signed_vote(voters[1], 1, 3, endorse, block_hash))
        .unwrap();
    let context = node.service.context();
    assert_eq!(context.round, 3);
    assert_eq!(
        context.votes.vote_of(3, endorse, voters[0]),
        Some(block_hash)
    );
    assert_eq!(
        context.votes.vote_of(3, endorse, voters[1]),
        Some(block_hash)
    );

    node.drain();
    assert!(node.log.iter().any(|event| matches!(
        event,
        ConsensusEvent::RoundChanged {
            old_round: 0,
            new_round: 3,
            ..
        }
    )));
}

#[test]
fn test_restart_restores_own_votes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("consensus.bin");

    let (committee, member, proposal, block_hash) = leader_and_member();
    let config = committee.config.clone();
    let genesis: Block = committee.genesis.clone();

    let mut node = Node::with_state_path(member, &config, &genesis, &path);
    node.service.start(START_TIME).unwrap();
    node.deliver(&proposal).unwrap();
    assert!(path.exists());

    let mut restarted = Node::with_state_path(member, &config, &genesis, &path);
    restarted.service.start(START_TIME + 10).unwrap();
    assert_eq!(
        restarted
            .service
            .context()
            .votes
            .vote_of(0, ConsensusMessageType::Endorse, member),
        Some(block_hash)
    );

    // The restored endorsement is not cast a second time
    restarted.deliver(&proposal).unwrap();
    let endorsements = restarted
        .drain()
        .into_iter()
        .filter(|event| {
            matches!(event, ConsensusEvent::Broadcast(m)
                if m.message.message_type() == ConsensusMessageType::Endorse)
        })
        .count();
    assert_eq!(endorsements, 0);
}

#[test]
fn test_reconfigure_applies_at_height_boundary() {
    let mut committee = Committee::new(4);
    committee.start();

    let mut next = committee.config.clone();
    next.epoch = 1;
    committee.node_mut(0).service.reconfigure(next).unwrap();
    assert_eq!(committee.node(0).service.config().epoch, 0);

    assert!(committee.run_until(50, 10_000, |c| c.min_live_height() >= 2));
    assert_eq!(committee.node(0).service.config().epoch, 1);
    assert_eq!(committee.node(0).pool.len(), 4);
}

#[test]
fn test_failed_appends_are_retried() {
    let mut committee = Committee::new(4);
    committee.node(1).ledger.fail_next_appends(2);
    committee.start();

    assert!(committee.run_until(50, 10_000, |c| c.min_live_height() >= 2));
    assert_eq!(
        committee.node(1).ledger.block_hashes()[..3],
        committee.node(0).ledger.block_hashes()[..3]
    );
}
