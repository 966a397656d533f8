//! Settlement engine: winner determination, orchestration, the
//! auto-completion trigger, and payment reconciliation.

pub mod error;
pub mod orchestrator;
pub mod reconciliation;
pub mod trigger;
pub mod winner;

pub use error::SettlementError;
pub use orchestrator::{settle, SettledWinner, SettlementResult};
pub use reconciliation::record_payment;
pub use winner::{determine_winners, BountyConfig, ParticipantSnapshot, RankedWinner};
