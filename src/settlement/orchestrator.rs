//! Settlement orchestration: the single code path that decides and records
//! winners for a bounty.
//!
//! `settle` is idempotent. The first successful invocation marks winners,
//! bumps per-user aggregates, and completes the bounty in one transaction;
//! every later invocation (manual retry, duplicate trigger firing, network
//! retry after an ambiguous response) observes the marked winners and returns
//! them unchanged without writing. Concurrent invocations serialize on the
//! store's connection mutex, so exactly one performs the write.

use crate::models::BountyStatus;
use crate::settlement::error::SettlementError;
use crate::settlement::winner::determine_winners;
use crate::store::{self, BountyStore};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A winner as recorded by settlement, with payment state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledWinner {
    pub user_id: String,
    /// 1-based rank matching determination order.
    pub rank: i64,
    pub reward_share: f64,
    pub paid_at: Option<i64>,
    pub payment_reference: Option<String>,
}

/// Outcome of a settle call.
///
/// `winners` is empty when no participant was eligible; that is a benign
/// no-op, not an error, and the bounty keeps its current status.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementResult {
    pub bounty_id: String,
    pub winners: Vec<SettledWinner>,
    pub already_settled: bool,
}

/// Settle a bounty: public entry point for administrators and retries.
///
/// Acquires the store's exclusive scope for the whole read-decide-write
/// sequence. Fails with `BountyNotFound` or `BountyNotSettleable`; a bounty
/// is settleable from `active`, `expired`, or (idempotent re-entry)
/// `completed`.
pub async fn settle(
    store: &BountyStore,
    bounty_id: &str,
) -> Result<SettlementResult, SettlementError> {
    let mut conn = store.conn.lock().await;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let result = settle_in_tx(&tx, bounty_id, crate::models::now_ms())?;
    tx.commit()?;
    Ok(result)
}

/// Settlement body, composable inside an existing transaction or savepoint.
/// The auto-completion trigger nests this under a savepoint so its failure
/// can be contained without aborting the participant's finish.
pub(crate) fn settle_in_tx(
    conn: &Connection,
    bounty_id: &str,
    now: i64,
) -> Result<SettlementResult, SettlementError> {
    let bounty = store::load_bounty(conn, bounty_id)?.ok_or(SettlementError::BountyNotFound)?;

    if !matches!(
        bounty.status,
        BountyStatus::Active | BountyStatus::Completed | BountyStatus::Expired
    ) {
        return Err(SettlementError::BountyNotSettleable {
            status: bounty.status,
        });
    }

    // Idempotency guard: a non-empty winner set means settlement already
    // happened. Return it unchanged, never re-decide.
    let existing = store::load_existing_winners(conn, bounty_id)?;
    if !existing.is_empty() {
        info!(bounty_id, winners = existing.len(), "bounty already settled; returning prior result");
        return Ok(SettlementResult {
            bounty_id: bounty_id.to_string(),
            winners: existing,
            already_settled: true,
        });
    }

    let snapshots = store::load_participant_snapshots(conn, bounty_id)?;
    let ranked = match determine_winners(&bounty.config(), &snapshots) {
        Ok(ranked) => ranked,
        Err(SettlementError::NoEligibleWinners) => {
            // Benign: leave the bounty in its current status for a later
            // settle (or an explicit expiry) once someone finishes.
            info!(bounty_id, status = bounty.status.as_str(), "no eligible winners; bounty left unsettled");
            return Ok(SettlementResult {
                bounty_id: bounty_id.to_string(),
                winners: Vec::new(),
                already_settled: false,
            });
        }
        Err(err) => return Err(err),
    };

    let mut winners = Vec::with_capacity(ranked.len());
    for winner in &ranked {
        conn.execute(
            "UPDATE participants SET \
                is_winner = 1, reward_share = ?1, winner_rank = ?2, \
                status = 'finished', finished_at = COALESCE(finished_at, ?3), updated_at = ?3 \
             WHERE bounty_id = ?4 AND user_id = ?5",
            params![winner.reward_share, winner.rank, now, bounty_id, &winner.user_id],
        )?;

        // Aggregate counters move inside the same transaction as the outcome
        // fields, exactly once per winner per bounty.
        conn.execute(
            "INSERT INTO user_stats (user_id, bounties_joined, total_wins, total_earnings, updated_at) \
             VALUES (?1, 0, 1, ?2, ?3) \
             ON CONFLICT(user_id) DO UPDATE SET \
                total_wins = total_wins + 1, \
                total_earnings = total_earnings + excluded.total_earnings, \
                updated_at = excluded.updated_at",
            params![&winner.user_id, winner.reward_share, now],
        )?;

        winners.push(SettledWinner {
            user_id: winner.user_id.clone(),
            rank: winner.rank,
            reward_share: winner.reward_share,
            paid_at: None,
            payment_reference: None,
        });
    }

    conn.execute(
        "UPDATE bounties SET status = 'completed', updated_at = ?1 WHERE id = ?2",
        params![now, bounty_id],
    )?;

    info!(
        bounty_id,
        winners = winners.len(),
        pool = bounty.reward_pool,
        "bounty settled"
    );

    Ok(SettlementResult {
        bounty_id: bounty_id.to_string(),
        winners,
        already_settled: false,
    })
}
