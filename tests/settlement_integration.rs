//! End-to-end settlement tests over a real store.
//!
//! Covers the settlement invariants: no over-payment, write-once winners,
//! idempotent settle, the concurrent first-finisher race, and payment
//! reconciliation preconditions.

use puzzlebounty_backend::models::{BountyStatus, DistributionMode, WinnerCriteria};
use puzzlebounty_backend::settlement::{self, SettlementError};
use puzzlebounty_backend::store::{BountyStore, NewBounty};
use std::sync::Arc;

fn new_bounty(
    criteria: WinnerCriteria,
    distribution: DistributionMode,
    reward_pool: f64,
) -> NewBounty {
    NewBounty {
        title: "test bounty".to_string(),
        winner_criteria: criteria,
        distribution_mode: distribution,
        reward_pool,
        max_participants: None,
    }
}

async fn active_bounty_with_users(
    store: &BountyStore,
    criteria: WinnerCriteria,
    distribution: DistributionMode,
    reward_pool: f64,
    users: &[&str],
) -> String {
    let bounty = store
        .create_bounty(new_bounty(criteria, distribution, reward_pool))
        .await
        .unwrap();
    store.activate_bounty(&bounty.id).await.unwrap();
    for user in users {
        store.join_bounty(&bounty.id, user).await.unwrap();
    }
    bounty.id
}

#[tokio::test]
async fn settle_fewest_attempts_winner_take_all() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FewestAttempts,
        DistributionMode::WinnerTakeAll,
        100.0,
        &["alice", "bob", "carol"],
    )
    .await;

    store.finish_participant(&id, "alice", 6, 120.0, 5).await.unwrap();
    store.finish_participant(&id, "bob", 3, 150.0, 5).await.unwrap();
    store.finish_participant(&id, "carol", 5, 90.0, 5).await.unwrap();

    let result = settlement::settle(&store, &id).await.unwrap();
    assert!(!result.already_settled);
    assert_eq!(result.winners.len(), 1);
    assert_eq!(result.winners[0].user_id, "bob");
    assert_eq!(result.winners[0].rank, 1);
    assert_eq!(result.winners[0].reward_share, 100.0);

    let bounty = store.get_bounty(&id).await.unwrap().unwrap();
    assert_eq!(bounty.status, BountyStatus::Completed);

    // winner-take-all allocates the pool exactly
    let participants = store.list_participants(&id).await.unwrap();
    let total: f64 = participants.iter().map(|p| p.reward_share).sum();
    assert!((total - 100.0).abs() < 1e-9);

    let stats = store.get_user_stats("bob").await.unwrap();
    assert_eq!(stats.total_wins, 1);
    assert!((stats.total_earnings - 100.0).abs() < 1e-9);
}

#[tokio::test]
async fn settle_is_idempotent_and_performs_no_writes_on_reentry() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FastestTime,
        DistributionMode::WinnerTakeAll,
        50.0,
        &["alice", "bob"],
    )
    .await;

    store.finish_participant(&id, "alice", 1, 30.0, 3).await.unwrap();
    store.finish_participant(&id, "bob", 1, 40.0, 3).await.unwrap();

    let first = settlement::settle(&store, &id).await.unwrap();
    let after_first = store.get_bounty(&id).await.unwrap().unwrap();
    let winner_after_first = store.get_participant(&id, "alice").await.unwrap().unwrap();

    let second = settlement::settle(&store, &id).await.unwrap();
    assert!(second.already_settled);
    assert_eq!(
        first.winners.iter().map(|w| &w.user_id).collect::<Vec<_>>(),
        second.winners.iter().map(|w| &w.user_id).collect::<Vec<_>>()
    );

    // No additional writes: timestamps unchanged after re-entry.
    let after_second = store.get_bounty(&id).await.unwrap().unwrap();
    let winner_after_second = store.get_participant(&id, "alice").await.unwrap().unwrap();
    assert_eq!(after_first.updated_at, after_second.updated_at);
    assert_eq!(winner_after_first.updated_at, winner_after_second.updated_at);

    // Aggregates were not double-counted.
    let stats = store.get_user_stats("alice").await.unwrap();
    assert_eq!(stats.total_wins, 1);
}

#[tokio::test]
async fn winners_are_write_once() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::MostCorrect,
        DistributionMode::WinnerTakeAll,
        25.0,
        &["alice", "bob"],
    )
    .await;

    store.finish_participant(&id, "alice", 2, 60.0, 9).await.unwrap();
    settlement::settle(&store, &id).await.unwrap();

    // Bob finishes later with a better score. His progress is recorded, but
    // the settlement decision is frozen.
    let outcome = store.finish_participant(&id, "bob", 1, 10.0, 10).await.unwrap();
    assert!(!outcome.auto_settled);

    let result = settlement::settle(&store, &id).await.unwrap();
    assert!(result.already_settled);
    assert_eq!(result.winners.len(), 1);
    assert_eq!(result.winners[0].user_id, "alice");

    let alice = store.get_participant(&id, "alice").await.unwrap().unwrap();
    assert!(alice.is_winner);
    assert_eq!(alice.reward_share, 25.0);
}

#[tokio::test]
async fn split_top_3_remainder_goes_to_rank_1() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FastestTime,
        DistributionMode::SplitTop3,
        10.0,
        &["alice", "bob", "carol", "dave"],
    )
    .await;

    store.finish_participant(&id, "alice", 1, 10.0, 3).await.unwrap();
    store.finish_participant(&id, "bob", 1, 20.0, 3).await.unwrap();
    store.finish_participant(&id, "carol", 1, 30.0, 3).await.unwrap();
    store.finish_participant(&id, "dave", 1, 40.0, 3).await.unwrap();

    let result = settlement::settle(&store, &id).await.unwrap();
    let shares: Vec<f64> = result.winners.iter().map(|w| w.reward_share).collect();
    assert_eq!(shares, vec![3.34, 3.33, 3.33]);

    let total: f64 = shares.iter().sum();
    assert!((total - 10.0).abs() < 1e-9);

    let dave = store.get_participant(&id, "dave").await.unwrap().unwrap();
    assert!(!dave.is_winner);
    assert_eq!(dave.reward_share, 0.0);
}

#[tokio::test]
async fn settle_with_no_finishers_is_a_benign_noop() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FastestTime,
        DistributionMode::WinnerTakeAll,
        10.0,
        &["alice"],
    )
    .await;

    let result = settlement::settle(&store, &id).await.unwrap();
    assert!(result.winners.is_empty());
    assert!(!result.already_settled);

    let bounty = store.get_bounty(&id).await.unwrap().unwrap();
    assert_eq!(bounty.status, BountyStatus::Active);
}

#[tokio::test]
async fn settle_rejects_draft_and_cancelled_bounties() {
    let store = BountyStore::new_in_memory().unwrap();
    let bounty = store
        .create_bounty(new_bounty(
            WinnerCriteria::FastestTime,
            DistributionMode::WinnerTakeAll,
            10.0,
        ))
        .await
        .unwrap();

    let err = settlement::settle(&store, &bounty.id).await.unwrap_err();
    assert!(matches!(
        err,
        SettlementError::BountyNotSettleable {
            status: BountyStatus::Draft
        }
    ));

    assert!(matches!(
        settlement::settle(&store, "no-such-bounty").await.unwrap_err(),
        SettlementError::BountyNotFound
    ));
}

#[tokio::test]
async fn expired_bounty_can_be_settled_manually() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::MostCorrect,
        DistributionMode::WinnerTakeAll,
        40.0,
        &["alice", "bob"],
    )
    .await;

    store.finish_participant(&id, "alice", 4, 100.0, 6).await.unwrap();
    store.expire_bounty(&id).await.unwrap();

    let result = settlement::settle(&store, &id).await.unwrap();
    assert_eq!(result.winners.len(), 1);
    assert_eq!(result.winners[0].user_id, "alice");

    let bounty = store.get_bounty(&id).await.unwrap().unwrap();
    assert_eq!(bounty.status, BountyStatus::Completed);
}

#[tokio::test]
async fn first_to_finish_auto_settles_on_first_finisher_only() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FirstToFinish,
        DistributionMode::WinnerTakeAll,
        60.0,
        &["alice", "bob"],
    )
    .await;

    let outcome = store.finish_participant(&id, "alice", 3, 45.0, 5).await.unwrap();
    assert!(outcome.auto_settled);
    assert!(outcome.participant.is_winner);
    assert_eq!(outcome.participant.reward_share, 60.0);

    let bounty = store.get_bounty(&id).await.unwrap().unwrap();
    assert_eq!(bounty.status, BountyStatus::Completed);

    // Second finisher does not re-trigger settlement.
    let outcome = store.finish_participant(&id, "bob", 2, 30.0, 5).await.unwrap();
    assert!(!outcome.auto_settled);
    assert!(!outcome.participant.is_winner);
}

#[tokio::test]
async fn fastest_time_does_not_auto_settle() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FastestTime,
        DistributionMode::WinnerTakeAll,
        60.0,
        &["alice"],
    )
    .await;

    let outcome = store.finish_participant(&id, "alice", 3, 45.0, 5).await.unwrap();
    assert!(!outcome.auto_settled);

    let bounty = store.get_bounty(&id).await.unwrap().unwrap();
    assert_eq!(bounty.status, BountyStatus::Active);
}

#[tokio::test]
async fn concurrent_first_finishers_produce_exactly_one_winner() {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let store = Arc::new(BountyStore::new(db_file.path().to_str().unwrap()).unwrap());
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FirstToFinish,
        DistributionMode::WinnerTakeAll,
        100.0,
        &["alice", "bob"],
    )
    .await;

    let store_a = store.clone();
    let id_a = id.clone();
    let a = tokio::spawn(async move {
        store_a.finish_participant(&id_a, "alice", 1, 10.0, 5).await
    });
    let store_b = store.clone();
    let id_b = id.clone();
    let b = tokio::spawn(async move {
        store_b.finish_participant(&id_b, "bob", 1, 10.0, 5).await
    });

    let outcome_a = a.await.unwrap().unwrap();
    let outcome_b = b.await.unwrap().unwrap();

    // Exactly one of the two finishes triggered settlement.
    assert!(outcome_a.auto_settled ^ outcome_b.auto_settled);

    let participants = store.list_participants(&id).await.unwrap();
    let winners: Vec<_> = participants.iter().filter(|p| p.is_winner).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].reward_share, 100.0);

    let bounty = store.get_bounty(&id).await.unwrap().unwrap();
    assert_eq!(bounty.status, BountyStatus::Completed);
    assert_eq!(bounty.completion_count, 2);
}

#[tokio::test]
async fn record_payment_requires_a_marked_winner() {
    let store = BountyStore::new_in_memory().unwrap();
    let id = active_bounty_with_users(
        &store,
        WinnerCriteria::FastestTime,
        DistributionMode::WinnerTakeAll,
        20.0,
        &["alice", "bob"],
    )
    .await;

    store.finish_participant(&id, "alice", 1, 10.0, 4).await.unwrap();
    store.finish_participant(&id, "bob", 1, 20.0, 4).await.unwrap();
    settlement::settle(&store, &id).await.unwrap();

    // Non-winner cannot be paid, and their paid_at stays null.
    let err = settlement::record_payment(&store, &id, "bob", "0xdead").await.unwrap_err();
    assert!(matches!(err, SettlementError::NotAWinner));
    let bob = store.get_participant(&id, "bob").await.unwrap().unwrap();
    assert!(bob.paid_at.is_none());

    assert!(matches!(
        settlement::record_payment(&store, &id, "nobody", "0xdead").await.unwrap_err(),
        SettlementError::ParticipantNotFound
    ));

    let paid = settlement::record_payment(&store, &id, "alice", "0xabc123").await.unwrap();
    assert!(paid.paid_at.is_some());
    assert_eq!(paid.payment_reference.as_deref(), Some("0xabc123"));

    // A second reference for the same logical payment is accepted as a
    // correction (overwrite), not an error.
    let repaid = settlement::record_payment(&store, &id, "alice", "0xdef456").await.unwrap();
    assert_eq!(repaid.payment_reference.as_deref(), Some("0xdef456"));
}

#[tokio::test]
async fn join_capacity_and_single_count_path() {
    let store = BountyStore::new_in_memory().unwrap();
    let bounty = store
        .create_bounty(NewBounty {
            title: "capped".to_string(),
            winner_criteria: WinnerCriteria::FastestTime,
            distribution_mode: DistributionMode::WinnerTakeAll,
            reward_pool: 10.0,
            max_participants: Some(2),
        })
        .await
        .unwrap();
    store.activate_bounty(&bounty.id).await.unwrap();

    store.join_bounty(&bounty.id, "alice").await.unwrap();
    store.join_bounty(&bounty.id, "bob").await.unwrap();

    assert!(matches!(
        store.join_bounty(&bounty.id, "carol").await.unwrap_err(),
        SettlementError::BountyFull { max: 2 }
    ));
    assert!(matches!(
        store.join_bounty(&bounty.id, "alice").await.unwrap_err(),
        SettlementError::AlreadyJoined
    ));

    // Leaving frees capacity through the one decrement path.
    store.leave_bounty(&bounty.id, "bob").await.unwrap();
    let refreshed = store.get_bounty(&bounty.id).await.unwrap().unwrap();
    assert_eq!(refreshed.participant_count, 1);
    store.join_bounty(&bounty.id, "carol").await.unwrap();

    let refreshed = store.get_bounty(&bounty.id).await.unwrap().unwrap();
    assert_eq!(refreshed.participant_count, 2);
    assert_eq!(store.list_participants(&bounty.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn lifecycle_transitions_are_enforced() {
    let store = BountyStore::new_in_memory().unwrap();
    let bounty = store
        .create_bounty(new_bounty(
            WinnerCriteria::FastestTime,
            DistributionMode::WinnerTakeAll,
            10.0,
        ))
        .await
        .unwrap();

    // Cannot join or expire a draft.
    assert!(matches!(
        store.join_bounty(&bounty.id, "alice").await.unwrap_err(),
        SettlementError::BountyNotJoinable {
            status: BountyStatus::Draft
        }
    ));
    assert!(matches!(
        store.expire_bounty(&bounty.id).await.unwrap_err(),
        SettlementError::InvalidTransition { .. }
    ));

    store.activate_bounty(&bounty.id).await.unwrap();
    assert!(matches!(
        store.activate_bounty(&bounty.id).await.unwrap_err(),
        SettlementError::InvalidTransition { .. }
    ));

    store.cancel_bounty(&bounty.id).await.unwrap();
    assert!(matches!(
        settlement::settle(&store, &bounty.id).await.unwrap_err(),
        SettlementError::BountyNotSettleable {
            status: BountyStatus::Cancelled
        }
    ));
}

#[tokio::test]
async fn create_rejects_non_positive_reward_pool() {
    let store = BountyStore::new_in_memory().unwrap();
    let err = store
        .create_bounty(new_bounty(
            WinnerCriteria::FastestTime,
            DistributionMode::WinnerTakeAll,
            0.0,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::InvalidRewardPool));
}
