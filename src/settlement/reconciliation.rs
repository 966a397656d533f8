//! Payment reconciliation: recording proof that an already-decided winner
//! was paid on the external escrow ledger.
//!
//! This module never decides whether to pay. The caller drives the escrow,
//! obtains an opaque transaction reference, and reports it here. Callable
//! only after settlement has marked the winner; it can never fabricate one.

use crate::models::now_ms;
use crate::settlement::error::SettlementError;
use crate::store::{self, BountyStore, Participant};
use rusqlite::{params, TransactionBehavior};
use tracing::{info, warn};

/// Record an external payment against a marked winner.
///
/// Fails with `ParticipantNotFound`, `NotAWinner`, or `ZeroRewardShare`.
/// Re-invocation with a different reference for an already-paid winner is
/// accepted as a correction (retried broadcasts of the same logical payment
/// can produce a second observed reference) but logged as unusual.
pub async fn record_payment(
    store: &BountyStore,
    bounty_id: &str,
    user_id: &str,
    payment_reference: &str,
) -> Result<Participant, SettlementError> {
    let now = now_ms();
    let mut conn = store.conn.lock().await;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let participant = store::load_participant(&tx, bounty_id, user_id)?
        .ok_or(SettlementError::ParticipantNotFound)?;
    if !participant.is_winner {
        return Err(SettlementError::NotAWinner);
    }
    if participant.reward_share <= 0.0 {
        return Err(SettlementError::ZeroRewardShare);
    }

    if let Some(previous) = participant.payment_reference.as_deref() {
        if previous != payment_reference {
            warn!(
                bounty_id,
                user_id,
                previous,
                new = payment_reference,
                "overwriting payment reference for already-paid winner"
            );
        }
    }

    tx.execute(
        "UPDATE participants SET paid_at = ?1, payment_reference = ?2, updated_at = ?1 \
         WHERE bounty_id = ?3 AND user_id = ?4",
        params![now, payment_reference, bounty_id, user_id],
    )?;

    let updated = store::load_participant(&tx, bounty_id, user_id)?
        .ok_or(SettlementError::ParticipantNotFound)?;
    tx.commit()?;

    info!(bounty_id, user_id, payment_reference, "payment recorded");
    Ok(updated)
}
