use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Bounty lifecycle states.
///
/// Legal transitions: draft -> active -> {completed | cancelled | expired}.
/// Draft bounties may also be cancelled. Terminal states never transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BountyStatus {
    Draft,
    Active,
    Completed,
    Cancelled,
    Expired,
}

impl BountyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BountyStatus::Draft => "draft",
            BountyStatus::Active => "active",
            BountyStatus::Completed => "completed",
            BountyStatus::Cancelled => "cancelled",
            BountyStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(BountyStatus::Draft),
            "active" => Some(BountyStatus::Active),
            "completed" => Some(BountyStatus::Completed),
            "cancelled" => Some(BountyStatus::Cancelled),
            "expired" => Some(BountyStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BountyStatus::Completed | BountyStatus::Cancelled | BountyStatus::Expired
        )
    }
}

/// Participant progress states within a bounty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Joined,
    Active,
    Finished,
}

impl ParticipantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Joined => "joined",
            ParticipantStatus::Active => "active",
            ParticipantStatus::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "joined" => Some(ParticipantStatus::Joined),
            "active" => Some(ParticipantStatus::Active),
            "finished" => Some(ParticipantStatus::Finished),
            _ => None,
        }
    }
}

/// Rule used to rank finishers when a bounty settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerCriteria {
    FirstToFinish,
    FastestTime,
    FewestAttempts,
    MostCorrect,
}

impl WinnerCriteria {
    pub fn as_str(&self) -> &'static str {
        match self {
            WinnerCriteria::FirstToFinish => "first_to_finish",
            WinnerCriteria::FastestTime => "fastest_time",
            WinnerCriteria::FewestAttempts => "fewest_attempts",
            WinnerCriteria::MostCorrect => "most_correct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "first_to_finish" => Some(WinnerCriteria::FirstToFinish),
            "fastest_time" => Some(WinnerCriteria::FastestTime),
            "fewest_attempts" => Some(WinnerCriteria::FewestAttempts),
            "most_correct" => Some(WinnerCriteria::MostCorrect),
            _ => None,
        }
    }
}

/// How the reward pool is allocated across ranked winners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMode {
    WinnerTakeAll,
    SplitTop3,
}

impl DistributionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionMode::WinnerTakeAll => "winner_take_all",
            DistributionMode::SplitTop3 => "split_top_3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "winner_take_all" => Some(DistributionMode::WinnerTakeAll),
            "split_top_3" => Some(DistributionMode::SplitTop3),
            _ => None,
        }
    }
}

/// Current unix timestamp in milliseconds. All persisted timestamps use this
/// resolution so `finished_at` tie-breaks behave as a total order.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./puzzlebounty.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        Ok(Self {
            database_path,
            port,
        })
    }
}
