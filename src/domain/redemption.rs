use super::ids::TicketId;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionOutcome {
    Accepted,
    RejectedUsed,
    RejectedInvalid,
    RejectedExpired,
}

impl RedemptionOutcome {
    /// Maps a redemption failure to the outcome recorded for it.
    ///
    /// Returns `None` for failures that are not a verdict on the ticket
    /// (store outages and the like).
    pub fn for_error(error: &EngineError) -> Option<Self> {
        match error {
            EngineError::InvalidSignature
            | EngineError::StaleToken(_)
            | EngineError::TicketNotFound(_) => Some(Self::RejectedInvalid),
            EngineError::OutOfWindow { .. } => Some(Self::RejectedExpired),
            EngineError::AlreadyUsed { .. } => Some(Self::RejectedUsed),
            _ => None,
        }
    }
}

impl fmt::Display for RedemptionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Accepted => "accepted",
            Self::RejectedUsed => "rejected_used",
            Self::RejectedInvalid => "rejected_invalid",
            Self::RejectedExpired => "rejected_expired",
        };
        f.write_str(label)
    }
}

/// Append-only audit row written for every scan.
///
/// `ticket_id` is absent when the token could not be authenticated, since
/// an unsigned claim about which ticket it names is worthless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionAttempt {
    pub ticket_id: Option<TicketId>,
    pub attempted_at: DateTime<Utc>,
    pub outcome: RedemptionOutcome,
    pub scanner_id: String,
}
