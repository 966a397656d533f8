//! Winner determination for bounty settlement.
//!
//! Pure decision function: `(bounty config, participant snapshots) -> ranked
//! winners with prize shares`. No side effects, so it can back dry-run /
//! preview endpoints as well as the real settlement transaction.
//!
//! Ranking rules and tie-break chains:
//! - first_to_finish: `finished_at` asc; rank 1 only. A split distribution
//!   configured with this criterion settles as winner-take-all.
//! - fastest_time:    `elapsed_seconds` asc, then `finished_at` asc.
//! - fewest_attempts: `attempts_used` asc, then `elapsed_seconds` asc.
//! - most_correct:    `correct_count` desc, then `elapsed_seconds` asc.
//!
//! Shares are computed in integer cents so the allocated total equals the
//! pool exactly for winner-take-all and never exceeds it for splits; any
//! split remainder goes to rank 1.

use crate::models::{DistributionMode, ParticipantStatus, WinnerCriteria};
use crate::settlement::error::SettlementError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The immutable slice of bounty configuration settlement cares about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BountyConfig {
    pub winner_criteria: WinnerCriteria,
    pub distribution_mode: DistributionMode,
    pub reward_pool: f64,
}

/// Read-only view of one participant at decision time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    pub user_id: String,
    pub status: ParticipantStatus,
    /// Unix milliseconds; present for every finished participant.
    pub finished_at: Option<i64>,
    pub attempts_used: i64,
    pub elapsed_seconds: f64,
    pub correct_count: i64,
}

/// One entry of the determination output, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedWinner {
    pub user_id: String,
    /// 1-based rank.
    pub rank: i64,
    pub reward_share: f64,
    /// Value of the ranking metric for this winner (seconds, attempts,
    /// correct answers, or finish timestamp depending on the criterion).
    pub metric_value: f64,
}

const MAX_SPLIT_WINNERS: usize = 3;

/// Rank eligible participants and allocate the reward pool.
///
/// Returns `NoEligibleWinners` when no participant has finished. Identical
/// input always produces identical output: ties beyond the documented chains
/// fall back to `user_id` ordering from the pre-sort.
pub fn determine_winners(
    config: &BountyConfig,
    participants: &[ParticipantSnapshot],
) -> Result<Vec<RankedWinner>, SettlementError> {
    let mut eligible: Vec<&ParticipantSnapshot> = participants
        .iter()
        .filter(|p| p.status == ParticipantStatus::Finished)
        .collect();

    if eligible.is_empty() {
        return Err(SettlementError::NoEligibleWinners);
    }

    // Deterministic base order; sort_by below is stable, so residual ties
    // resolve by user_id and repeated dry runs agree.
    eligible.sort_by(|a, b| a.user_id.cmp(&b.user_id));

    match config.winner_criteria {
        WinnerCriteria::FirstToFinish => {
            eligible.sort_by(|a, b| cmp_i64_opt(a.finished_at, b.finished_at));
        }
        WinnerCriteria::FastestTime => {
            eligible.sort_by(|a, b| {
                cmp_f64(a.elapsed_seconds, b.elapsed_seconds)
                    .then_with(|| cmp_i64_opt(a.finished_at, b.finished_at))
            });
        }
        WinnerCriteria::FewestAttempts => {
            eligible.sort_by(|a, b| {
                a.attempts_used
                    .cmp(&b.attempts_used)
                    .then_with(|| cmp_f64(a.elapsed_seconds, b.elapsed_seconds))
            });
        }
        WinnerCriteria::MostCorrect => {
            eligible.sort_by(|a, b| {
                b.correct_count
                    .cmp(&a.correct_count)
                    .then_with(|| cmp_f64(a.elapsed_seconds, b.elapsed_seconds))
            });
        }
    }

    let take = match effective_distribution(config) {
        DistributionMode::WinnerTakeAll => 1,
        DistributionMode::SplitTop3 => MAX_SPLIT_WINNERS.min(eligible.len()),
    };
    let winners = &eligible[..take];

    let shares_cents = allocate_cents(to_cents(config.reward_pool), winners.len());

    Ok(winners
        .iter()
        .zip(shares_cents)
        .enumerate()
        .map(|(i, (p, cents))| RankedWinner {
            user_id: p.user_id.clone(),
            rank: (i + 1) as i64,
            reward_share: from_cents(cents),
            metric_value: metric_value(config.winner_criteria, p),
        })
        .collect())
}

/// first_to_finish only ever produces one winner, regardless of the
/// configured distribution mode.
fn effective_distribution(config: &BountyConfig) -> DistributionMode {
    if config.winner_criteria == WinnerCriteria::FirstToFinish {
        DistributionMode::WinnerTakeAll
    } else {
        config.distribution_mode
    }
}

fn metric_value(criteria: WinnerCriteria, p: &ParticipantSnapshot) -> f64 {
    match criteria {
        WinnerCriteria::FirstToFinish => p.finished_at.unwrap_or(i64::MAX) as f64,
        WinnerCriteria::FastestTime => p.elapsed_seconds,
        WinnerCriteria::FewestAttempts => p.attempts_used as f64,
        WinnerCriteria::MostCorrect => p.correct_count as f64,
    }
}

/// Equal split in integer cents; the remainder goes to rank 1 so value is
/// neither dropped nor over-allocated.
fn allocate_cents(pool_cents: i64, n: usize) -> Vec<i64> {
    let n = n as i64;
    if n == 0 {
        return Vec::new();
    }
    let base = pool_cents / n;
    let remainder = pool_cents - base * n;
    (0..n)
        .map(|rank0| if rank0 == 0 { base + remainder } else { base })
        .collect()
}

fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Missing `finished_at` sorts last; finished participants always carry one.
fn cmp_i64_opt(a: Option<i64>, b: Option<i64>) -> Ordering {
    a.unwrap_or(i64::MAX).cmp(&b.unwrap_or(i64::MAX))
}
