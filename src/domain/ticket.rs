use super::ids::{OrderId, TicketId, TierId};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The period during which an event admits guests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWindow {
    pub event_id: String,
    pub opens_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
}

impl EventWindow {
    pub fn new(
        event_id: impl Into<String>,
        opens_at: DateTime<Utc>,
        closes_at: DateTime<Utc>,
    ) -> Result<Self> {
        if closes_at <= opens_at {
            return Err(EngineError::ValidationError(
                "Entry window must close after it opens".to_string(),
            ));
        }
        Ok(Self {
            event_id: event_id.into(),
            opens_at,
            closes_at,
        })
    }

    /// Validity bounds for tokens, widened by `grace` on both sides.
    pub fn token_bounds(&self, grace: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.opens_at - grace, self.closes_at + grace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Unused,
    Used,
    Void,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => f.write_str("unused"),
            Self::Used => f.write_str("used"),
            Self::Void => f.write_str("void"),
        }
    }
}

/// An admission right. Created once, then changes at most once more
/// (`unused -> used` or `unused -> void`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub order_id: OrderId,
    pub event_id: String,
    pub tier_id: TierId,
    /// Position inside the order, `0..quantity`.
    pub sequence: u32,
    pub holder_email: String,
    pub status: TicketStatus,
    pub issued_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,
    pub token_version: u32,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Ticket {
    pub fn is_unused(&self) -> bool {
        self.status == TicketStatus::Unused
    }

    /// Conditional `unused -> used`. The token version must match the current one.
    pub fn redeem(&mut self, token_version: u32, at: DateTime<Utc>) -> bool {
        if !self.is_unused() || self.token_version != token_version {
            return false;
        }
        self.status = TicketStatus::Used;
        self.used_at = Some(at);
        true
    }

    /// Conditional `unused -> void`.
    pub fn void(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_unused() {
            return false;
        }
        self.status = TicketStatus::Void;
        self.voided_at = Some(at);
        true
    }

    /// Invalidates outstanding tokens for an unused ticket.
    pub fn rotate_token(&mut self) -> bool {
        if !self.is_unused() {
            return false;
        }
        self.token_version += 1;
        true
    }
}

/// Result of a conditional ticket update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The condition held and the ticket now looks like this.
    Applied(Ticket),
    /// The condition failed; the ticket is unchanged.
    Rejected(Ticket),
    Missing,
}
