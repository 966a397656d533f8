//! Durable event store for bounties, participants, and per-user aggregates.
//!
//! One rusqlite connection behind a tokio mutex. Every mutating operation
//! takes the mutex and runs a single IMMEDIATE transaction, which is the
//! exclusive scope all read-decide-write sequences (join capacity checks,
//! finish + auto-settlement, settle itself) rely on. Concurrent callers
//! serialize here; losers of a settlement race observe the committed state.
//!
//! The cached `participant_count` has exactly one increment path
//! (`join_bounty`) and one decrement path (`leave_bounty`), both in the same
//! transaction as the participant row insert/delete. No second accounting
//! mechanism exists.

use crate::models::{
    now_ms, BountyStatus, DistributionMode, ParticipantStatus, WinnerCriteria,
};
use crate::settlement::error::SettlementError;
use crate::settlement::trigger::{self, TriggerDecision};
use crate::settlement::winner::{BountyConfig, ParticipantSnapshot};
use crate::settlement::{orchestrator, SettledWinner};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounty {
    pub id: String,
    pub title: String,
    pub winner_criteria: WinnerCriteria,
    pub distribution_mode: DistributionMode,
    pub reward_pool: f64,
    pub max_participants: Option<i64>,
    pub status: BountyStatus,
    pub participant_count: i64,
    pub completion_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Bounty {
    pub fn config(&self) -> BountyConfig {
        BountyConfig {
            winner_criteria: self.winner_criteria,
            distribution_mode: self.distribution_mode,
            reward_pool: self.reward_pool,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub bounty_id: String,
    pub user_id: String,
    pub status: ParticipantStatus,
    pub finished_at: Option<i64>,
    pub attempts_used: i64,
    pub elapsed_seconds: f64,
    pub correct_count: i64,
    pub is_winner: bool,
    pub reward_share: f64,
    pub winner_rank: Option<i64>,
    pub paid_at: Option<i64>,
    pub payment_reference: Option<String>,
    pub joined_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStats {
    pub user_id: String,
    pub bounties_joined: i64,
    pub total_wins: i64,
    pub total_earnings: f64,
}

/// Parameters for creating a draft bounty. Configuration is immutable once
/// the bounty activates.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBounty {
    pub title: String,
    pub winner_criteria: WinnerCriteria,
    pub distribution_mode: DistributionMode,
    pub reward_pool: f64,
    pub max_participants: Option<i64>,
}

/// Result of a gameplay finish: the updated participant plus whether the
/// auto-completion trigger settled the bounty in the same transaction.
#[derive(Debug, Clone, Serialize)]
pub struct FinishOutcome {
    pub participant: Participant,
    pub auto_settled: bool,
}

#[derive(Clone)]
pub struct BountyStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl BountyStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open bounty db")?;
        Self::with_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory bounty db")?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bounties (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                winner_criteria TEXT NOT NULL,
                distribution_mode TEXT NOT NULL,
                reward_pool REAL NOT NULL,
                max_participants INTEGER,
                status TEXT NOT NULL DEFAULT 'draft',
                participant_count INTEGER NOT NULL DEFAULT 0,
                completion_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS participants (
                bounty_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'joined',
                finished_at INTEGER,
                attempts_used INTEGER NOT NULL DEFAULT 0,
                elapsed_seconds REAL NOT NULL DEFAULT 0,
                correct_count INTEGER NOT NULL DEFAULT 0,
                is_winner INTEGER NOT NULL DEFAULT 0,
                reward_share REAL NOT NULL DEFAULT 0,
                winner_rank INTEGER,
                paid_at INTEGER,
                payment_reference TEXT,
                joined_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (bounty_id, user_id),
                FOREIGN KEY (bounty_id) REFERENCES bounties(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_participants_bounty_status \
             ON participants(bounty_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_participants_bounty_winner \
             ON participants(bounty_id, is_winner)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_stats (
                user_id TEXT PRIMARY KEY,
                bounties_joined INTEGER NOT NULL DEFAULT 0,
                total_wins INTEGER NOT NULL DEFAULT 0,
                total_earnings REAL NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Bounty lifecycle
    // ------------------------------------------------------------------

    pub async fn create_bounty(&self, new: NewBounty) -> Result<Bounty, SettlementError> {
        if !(new.reward_pool > 0.0) {
            return Err(SettlementError::InvalidRewardPool);
        }

        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO bounties \
             (id, title, winner_criteria, distribution_mode, reward_pool, max_participants, \
              status, participant_count, completion_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'draft', 0, 0, ?7, ?7)",
            params![
                &id,
                &new.title,
                new.winner_criteria.as_str(),
                new.distribution_mode.as_str(),
                new.reward_pool,
                new.max_participants,
                now,
            ],
        )?;

        info!(bounty_id = %id, criteria = new.winner_criteria.as_str(), "bounty created");
        load_bounty(&conn, &id)?.ok_or(SettlementError::BountyNotFound)
    }

    pub async fn activate_bounty(&self, bounty_id: &str) -> Result<Bounty, SettlementError> {
        self.transition_bounty(bounty_id, BountyStatus::Active, &[BountyStatus::Draft])
            .await
    }

    pub async fn cancel_bounty(&self, bounty_id: &str) -> Result<Bounty, SettlementError> {
        self.transition_bounty(
            bounty_id,
            BountyStatus::Cancelled,
            &[BountyStatus::Draft, BountyStatus::Active],
        )
        .await
    }

    /// Mark an active bounty expired. Expired bounties remain settleable by
    /// an administrator, so late finishers can still be ranked manually.
    pub async fn expire_bounty(&self, bounty_id: &str) -> Result<Bounty, SettlementError> {
        self.transition_bounty(bounty_id, BountyStatus::Expired, &[BountyStatus::Active])
            .await
    }

    async fn transition_bounty(
        &self,
        bounty_id: &str,
        to: BountyStatus,
        allowed_from: &[BountyStatus],
    ) -> Result<Bounty, SettlementError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let bounty = load_bounty(&tx, bounty_id)?.ok_or(SettlementError::BountyNotFound)?;
        if !allowed_from.contains(&bounty.status) {
            return Err(SettlementError::InvalidTransition {
                from: bounty.status,
                to,
            });
        }

        tx.execute(
            "UPDATE bounties SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![to.as_str(), now_ms(), bounty_id],
        )?;
        let updated = load_bounty(&tx, bounty_id)?.ok_or(SettlementError::BountyNotFound)?;
        tx.commit()?;

        info!(bounty_id, from = bounty.status.as_str(), to = to.as_str(), "bounty transitioned");
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Join / leave: the only participant_count accounting path
    // ------------------------------------------------------------------

    pub async fn join_bounty(
        &self,
        bounty_id: &str,
        user_id: &str,
    ) -> Result<Participant, SettlementError> {
        let now = now_ms();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let bounty = load_bounty(&tx, bounty_id)?.ok_or(SettlementError::BountyNotFound)?;
        if bounty.status != BountyStatus::Active {
            return Err(SettlementError::BountyNotJoinable {
                status: bounty.status,
            });
        }
        if let Some(max) = bounty.max_participants {
            // Capacity is enforced against the cached count, read in the
            // same transaction that increments it.
            if bounty.participant_count >= max {
                return Err(SettlementError::BountyFull { max });
            }
        }
        if load_participant(&tx, bounty_id, user_id)?.is_some() {
            return Err(SettlementError::AlreadyJoined);
        }

        tx.execute(
            "INSERT INTO participants (bounty_id, user_id, status, joined_at, updated_at) \
             VALUES (?1, ?2, 'joined', ?3, ?3)",
            params![bounty_id, user_id, now],
        )?;
        tx.execute(
            "UPDATE bounties SET participant_count = participant_count + 1, updated_at = ?1 \
             WHERE id = ?2",
            params![now, bounty_id],
        )?;
        tx.execute(
            "INSERT INTO user_stats (user_id, bounties_joined, total_wins, total_earnings, updated_at) \
             VALUES (?1, 1, 0, 0, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET \
                bounties_joined = bounties_joined + 1, \
                updated_at = excluded.updated_at",
            params![user_id, now],
        )?;

        let participant =
            load_participant(&tx, bounty_id, user_id)?.ok_or(SettlementError::ParticipantNotFound)?;
        tx.commit()?;
        Ok(participant)
    }

    pub async fn leave_bounty(
        &self,
        bounty_id: &str,
        user_id: &str,
    ) -> Result<(), SettlementError> {
        let now = now_ms();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        load_bounty(&tx, bounty_id)?.ok_or(SettlementError::BountyNotFound)?;
        let participant =
            load_participant(&tx, bounty_id, user_id)?.ok_or(SettlementError::ParticipantNotFound)?;
        if participant.status == ParticipantStatus::Finished || participant.is_winner {
            return Err(SettlementError::ParticipantNotActive);
        }

        tx.execute(
            "DELETE FROM participants WHERE bounty_id = ?1 AND user_id = ?2",
            params![bounty_id, user_id],
        )?;
        tx.execute(
            "UPDATE bounties SET participant_count = participant_count - 1, updated_at = ?1 \
             WHERE id = ?2",
            params![now, bounty_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Gameplay finish ingestion + auto-completion trigger
    // ------------------------------------------------------------------

    /// Record a participant's transition into `finished` and evaluate the
    /// auto-completion trigger inside the same transaction.
    ///
    /// Progress metrics come from the gameplay subsystem and are trusted as
    /// accurate inputs. When the trigger fires, settlement runs under a
    /// savepoint: a settlement failure rolls back the savepoint only and the
    /// finish itself still commits, leaving the bounty for manual settlement.
    pub async fn finish_participant(
        &self,
        bounty_id: &str,
        user_id: &str,
        attempts_used: i64,
        elapsed_seconds: f64,
        correct_count: i64,
    ) -> Result<FinishOutcome, SettlementError> {
        let now = now_ms();
        let mut conn = self.conn.lock().await;
        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let bounty = load_bounty(&tx, bounty_id)?.ok_or(SettlementError::BountyNotFound)?;
        let participant =
            load_participant(&tx, bounty_id, user_id)?.ok_or(SettlementError::ParticipantNotFound)?;
        if participant.status == ParticipantStatus::Finished {
            return Err(SettlementError::ParticipantNotActive);
        }

        // The "is this provably the first finisher" count excludes the
        // participant being transitioned and is read under the same lock
        // scope as the write, which closes the concurrent-first-finisher race.
        let other_finished = count_other_finished(&tx, bounty_id, user_id)?;

        tx.execute(
            "UPDATE participants SET \
                status = 'finished', finished_at = ?1, attempts_used = ?2, \
                elapsed_seconds = ?3, correct_count = ?4, updated_at = ?1 \
             WHERE bounty_id = ?5 AND user_id = ?6",
            params![now, attempts_used, elapsed_seconds, correct_count, bounty_id, user_id],
        )?;
        tx.execute(
            "UPDATE bounties SET completion_count = completion_count + 1, updated_at = ?1 \
             WHERE id = ?2",
            params![now, bounty_id],
        )?;

        let decision = trigger::evaluate(bounty.winner_criteria, bounty.status, other_finished);
        let auto_settled = match decision {
            TriggerDecision::Settle => {
                let sp = tx.savepoint()?;
                match orchestrator::settle_in_tx(&sp, bounty_id, now) {
                    Ok(result) => {
                        sp.commit()?;
                        !result.winners.is_empty()
                    }
                    Err(err) => {
                        // Contained by design: a settlement bug must never
                        // block ordinary gameplay. Savepoint drop rolls back.
                        warn!(
                            bounty_id,
                            user_id,
                            error = %err,
                            "auto-completion settlement failed; finish still committed"
                        );
                        false
                    }
                }
            }
            TriggerDecision::Ignore(reason) => {
                tracing::debug!(bounty_id, user_id, reason, "auto-completion trigger skipped");
                false
            }
        };

        let participant =
            load_participant(&tx, bounty_id, user_id)?.ok_or(SettlementError::ParticipantNotFound)?;
        tx.commit()?;

        info!(bounty_id, user_id, auto_settled, "participant finished");
        Ok(FinishOutcome {
            participant,
            auto_settled,
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_bounty(&self, bounty_id: &str) -> Result<Option<Bounty>, SettlementError> {
        let conn = self.conn.lock().await;
        load_bounty(&conn, bounty_id)
    }

    pub async fn get_participant(
        &self,
        bounty_id: &str,
        user_id: &str,
    ) -> Result<Option<Participant>, SettlementError> {
        let conn = self.conn.lock().await;
        load_participant(&conn, bounty_id, user_id)
    }

    pub async fn list_participants(
        &self,
        bounty_id: &str,
    ) -> Result<Vec<Participant>, SettlementError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE bounty_id = ?1 ORDER BY joined_at ASC, user_id ASC"
        ))?;
        let rows = stmt.query_map(params![bounty_id], map_participant_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub async fn list_winners(
        &self,
        bounty_id: &str,
    ) -> Result<Vec<SettledWinner>, SettlementError> {
        let conn = self.conn.lock().await;
        load_existing_winners(&conn, bounty_id)
    }

    pub async fn get_user_stats(&self, user_id: &str) -> Result<UserStats, SettlementError> {
        let conn = self.conn.lock().await;
        let stats = conn
            .prepare_cached(
                "SELECT user_id, bounties_joined, total_wins, total_earnings \
                 FROM user_stats WHERE user_id = ?1",
            )?
            .query_row(params![user_id], |row| {
                Ok(UserStats {
                    user_id: row.get(0)?,
                    bounties_joined: row.get(1)?,
                    total_wins: row.get(2)?,
                    total_earnings: row.get(3)?,
                })
            })
            .optional()?;

        Ok(stats.unwrap_or(UserStats {
            user_id: user_id.to_string(),
            bounties_joined: 0,
            total_wins: 0,
            total_earnings: 0.0,
        }))
    }
}

// ----------------------------------------------------------------------
// Row-level helpers shared with the settlement orchestrator. These operate
// on a plain connection so they compose inside transactions and savepoints.
// ----------------------------------------------------------------------

const BOUNTY_COLUMNS: &str = "id, title, winner_criteria, distribution_mode, reward_pool, \
     max_participants, status, participant_count, completion_count, created_at, updated_at";

const PARTICIPANT_COLUMNS: &str = "bounty_id, user_id, status, finished_at, attempts_used, \
     elapsed_seconds, correct_count, is_winner, reward_share, winner_rank, paid_at, \
     payment_reference, joined_at, updated_at";

pub(crate) fn load_bounty(
    conn: &Connection,
    bounty_id: &str,
) -> Result<Option<Bounty>, SettlementError> {
    let bounty = conn
        .prepare_cached(&format!(
            "SELECT {BOUNTY_COLUMNS} FROM bounties WHERE id = ?1"
        ))?
        .query_row(params![bounty_id], map_bounty_row)
        .optional()?;
    Ok(bounty)
}

pub(crate) fn load_participant(
    conn: &Connection,
    bounty_id: &str,
    user_id: &str,
) -> Result<Option<Participant>, SettlementError> {
    let participant = conn
        .prepare_cached(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants \
             WHERE bounty_id = ?1 AND user_id = ?2"
        ))?
        .query_row(params![bounty_id, user_id], map_participant_row)
        .optional()?;
    Ok(participant)
}

pub(crate) fn load_participant_snapshots(
    conn: &Connection,
    bounty_id: &str,
) -> Result<Vec<ParticipantSnapshot>, SettlementError> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, status, finished_at, attempts_used, elapsed_seconds, correct_count \
         FROM participants WHERE bounty_id = ?1 ORDER BY user_id ASC",
    )?;
    let rows = stmt.query_map(params![bounty_id], |row| {
        let status: String = row.get(1)?;
        Ok(ParticipantSnapshot {
            user_id: row.get(0)?,
            status: parse_participant_status(1, &status)?,
            finished_at: row.get(2)?,
            attempts_used: row.get(3)?,
            elapsed_seconds: row.get(4)?,
            correct_count: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Winners already marked for this bounty, in rank order. Non-empty means the
/// bounty has been settled and re-settlement must be an idempotent read.
pub(crate) fn load_existing_winners(
    conn: &Connection,
    bounty_id: &str,
) -> Result<Vec<SettledWinner>, SettlementError> {
    let mut stmt = conn.prepare_cached(
        "SELECT user_id, winner_rank, reward_share, paid_at, payment_reference \
         FROM participants WHERE bounty_id = ?1 AND is_winner = 1 \
         ORDER BY winner_rank ASC, user_id ASC",
    )?;
    let rows = stmt.query_map(params![bounty_id], |row| {
        Ok(SettledWinner {
            user_id: row.get(0)?,
            rank: row.get::<_, Option<i64>>(1)?.unwrap_or(1),
            reward_share: row.get(2)?,
            paid_at: row.get(3)?,
            payment_reference: row.get(4)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Count finished participants excluding the one named. Zero means the named
/// participant is provably the first finisher.
pub(crate) fn count_other_finished(
    conn: &Connection,
    bounty_id: &str,
    user_id: &str,
) -> Result<i64, SettlementError> {
    let count: i64 = conn
        .prepare_cached(
            "SELECT COUNT(*) FROM participants \
             WHERE bounty_id = ?1 AND status = 'finished' AND user_id != ?2",
        )?
        .query_row(params![bounty_id, user_id], |row| row.get(0))?;
    Ok(count)
}

fn map_bounty_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bounty> {
    let criteria: String = row.get(2)?;
    let distribution: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(Bounty {
        id: row.get(0)?,
        title: row.get(1)?,
        winner_criteria: WinnerCriteria::parse(&criteria)
            .ok_or_else(|| conversion_err(2, &criteria))?,
        distribution_mode: DistributionMode::parse(&distribution)
            .ok_or_else(|| conversion_err(3, &distribution))?,
        reward_pool: row.get(4)?,
        max_participants: row.get(5)?,
        status: BountyStatus::parse(&status).ok_or_else(|| conversion_err(6, &status))?,
        participant_count: row.get(7)?,
        completion_count: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn map_participant_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    let status: String = row.get(2)?;
    Ok(Participant {
        bounty_id: row.get(0)?,
        user_id: row.get(1)?,
        status: parse_participant_status(2, &status)?,
        finished_at: row.get(3)?,
        attempts_used: row.get(4)?,
        elapsed_seconds: row.get(5)?,
        correct_count: row.get(6)?,
        is_winner: row.get::<_, i64>(7)? != 0,
        reward_share: row.get(8)?,
        winner_rank: row.get(9)?,
        paid_at: row.get(10)?,
        payment_reference: row.get(11)?,
        joined_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn parse_participant_status(idx: usize, s: &str) -> rusqlite::Result<ParticipantStatus> {
    ParticipantStatus::parse(s).ok_or_else(|| conversion_err(idx, s))
}

fn conversion_err(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized value: {value}").into(),
    )
}
