//! Settlement error taxonomy.
//!
//! Three caller-visible classes: not-found (invalid identifier, no retry
//! implied), precondition violations (invariants not met, surfaced to the
//! caller), and storage failures (retryable: settle and record_payment are
//! idempotent / precondition-checked, so a blind retry is safe).
//!
//! `NoEligibleWinners` is internal to winner determination; the orchestrator
//! maps it to an empty successful result rather than surfacing it.

use crate::models::BountyStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("bounty not found")]
    BountyNotFound,

    #[error("participant not found")]
    ParticipantNotFound,

    #[error("bounty is not settleable in status {status:?}")]
    BountyNotSettleable { status: BountyStatus },

    #[error("invalid bounty transition from {from:?} to {to:?}")]
    InvalidTransition { from: BountyStatus, to: BountyStatus },

    #[error("bounty is not joinable in status {status:?}")]
    BountyNotJoinable { status: BountyStatus },

    #[error("bounty is at max participants ({max})")]
    BountyFull { max: i64 },

    #[error("user has already joined this bounty")]
    AlreadyJoined,

    #[error("participant is not active (already finished or never started)")]
    ParticipantNotActive,

    #[error("reward pool must be positive")]
    InvalidRewardPool,

    #[error("no eligible winners")]
    NoEligibleWinners,

    #[error("participant is not a winner")]
    NotAWinner,

    #[error("winner has a zero reward share; nothing to pay")]
    ZeroRewardShare,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl SettlementError {
    /// True for failures where retrying the whole call is the correct
    /// response. Not-found and precondition violations are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SettlementError::Storage(_))
    }
}
