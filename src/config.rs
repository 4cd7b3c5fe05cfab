use crate::domain::token::SigningKey;
use chrono::Duration;

pub const DEFAULT_HOLD_MINUTES: i64 = 15;
pub const DEFAULT_GRACE_MINUTES: i64 = 120;

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a reservation holds inventory before it lapses.
    pub hold_duration: Duration,
    /// Slack added on both sides of an event's entry window when minting tokens.
    pub entry_grace: Duration,
    pub signing_key: SigningKey,
}

impl EngineConfig {
    /// Default hold and grace periods with the given signing key.
    pub fn new(signing_key: SigningKey) -> Self {
        Self {
            hold_duration: Duration::minutes(DEFAULT_HOLD_MINUTES),
            entry_grace: Duration::minutes(DEFAULT_GRACE_MINUTES),
            signing_key,
        }
    }

    pub fn with_hold_duration(mut self, hold_duration: Duration) -> Self {
        self.hold_duration = hold_duration;
        self
    }

    pub fn with_entry_grace(mut self, entry_grace: Duration) -> Self {
        self.entry_grace = entry_grace;
        self
    }
}
