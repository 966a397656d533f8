//! Auto-completion trigger for race-to-finish bounties.
//!
//! Reacts to a participant transitioning into `finished`. Exactly two
//! outcomes: ignore, or invoke settlement. The predicate is a pure function
//! over values the store reads under the same transaction as the finish
//! write, which is what makes the "two concurrent first finishers" race
//! checkable: both contenders cannot observe `other_finished_count == 0`
//! because the reads and writes serialize on the store's exclusive scope.
//!
//! Execution (in `BountyStore::finish_participant`) nests settlement under a
//! savepoint, so a trigger-internal failure is logged and rolled back while
//! the participant's own finish still commits.

use crate::models::{BountyStatus, WinnerCriteria};

/// The trigger's decision for one finish event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Do nothing; the reason is recorded for debug logging.
    Ignore(&'static str),
    /// Invoke settlement synchronously within the finish transaction.
    Settle,
}

/// Decide whether this finish event should eagerly settle the bounty.
///
/// All three preconditions must hold: first-to-finish criteria, bounty still
/// active, and no other participant already finished (`other_finished_count`
/// excludes the participant whose transition is being processed).
pub fn evaluate(
    criteria: WinnerCriteria,
    bounty_status: BountyStatus,
    other_finished_count: i64,
) -> TriggerDecision {
    if criteria != WinnerCriteria::FirstToFinish {
        return TriggerDecision::Ignore("criteria is not first_to_finish");
    }
    if bounty_status != BountyStatus::Active {
        return TriggerDecision::Ignore("bounty is not active");
    }
    if other_finished_count > 0 {
        return TriggerDecision::Ignore("another participant already finished");
    }
    TriggerDecision::Settle
}
