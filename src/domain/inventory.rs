use super::ids::{ReservationId, TierId};
use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sellable price point of an event with a fixed stock of tickets.
///
/// Invariant: `reserved_count + sold_count <= total_inventory`. Only the
/// ledger operations below mutate the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub id: TierId,
    pub event_id: String,
    pub unit_price_minor_units: i64,
    pub currency: String,
    pub total_inventory: u32,
    pub reserved_count: u32,
    pub sold_count: u32,
    pub per_buyer_limit: u32,
}

impl PriceTier {
    pub fn new(
        id: TierId,
        event_id: impl Into<String>,
        unit_price_minor_units: i64,
        currency: impl Into<String>,
        total_inventory: u32,
        per_buyer_limit: u32,
    ) -> Result<Self> {
        if unit_price_minor_units < 0 {
            return Err(EngineError::ValidationError(
                "Unit price must not be negative".to_string(),
            ));
        }
        if per_buyer_limit == 0 {
            return Err(EngineError::ValidationError(
                "Per-buyer limit must be positive".to_string(),
            ));
        }
        Ok(Self {
            id,
            event_id: event_id.into(),
            unit_price_minor_units,
            currency: currency.into(),
            total_inventory,
            reserved_count: 0,
            sold_count: 0,
            per_buyer_limit,
        })
    }

    pub fn available(&self) -> u32 {
        self.total_inventory
            .saturating_sub(self.reserved_count + self.sold_count)
    }

    /// Price of `quantity` units in minor currency units.
    pub fn price_of(&self, quantity: u32) -> Result<i64> {
        self.unit_price_minor_units
            .checked_mul(i64::from(quantity))
            .ok_or_else(|| {
                EngineError::ValidationError(format!(
                    "Price of {quantity} ticket(s) on tier {} is out of range",
                    self.id
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Held,
    Committed,
    Released,
}

/// A time-bounded claim on tier inventory made before payment is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub tier_id: TierId,
    pub quantity: u32,
    pub buyer_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ReservationState,
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn hold(
        tier_id: TierId,
        quantity: u32,
        buyer_key: impl Into<String>,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            tier_id,
            quantity,
            buyer_key: buyer_key.into(),
            created_at,
            expires_at,
            state: ReservationState::Held,
            released_at: None,
        }
    }

    /// A hold whose deadline has passed counts as released, swept or not.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Held && now >= self.expires_at
    }

    pub fn release(&mut self, at: DateTime<Utc>) {
        self.state = ReservationState::Released;
        self.released_at = Some(at);
    }

    /// Commit result for a reservation that is no longer held.
    ///
    /// Committed reservations commit again as a no-op; released ones cannot
    /// be revived.
    pub fn settled(&self) -> Result<()> {
        match (self.state, self.released_at) {
            (ReservationState::Committed, _) => Ok(()),
            (ReservationState::Released, Some(at)) if at < self.expires_at => {
                Err(EngineError::ReservationReleased(self.id))
            }
            _ => Err(EngineError::ReservationExpired(self.id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OpenHold {
    reservation_id: ReservationId,
    buyer_key: String,
    quantity: u32,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BuyerUnits {
    buyer_key: String,
    sold: u32,
}

/// Outcome of settling a held reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Held units moved into the sold count.
    Sold,
    /// The hold had already expired; its units went back to the pool instead.
    Lapsed,
}

/// The tier row together with the bookkeeping needed to evaluate holds
/// atomically: open holds and per-buyer sold units.
///
/// Stores persist this as one record and only mutate it while holding
/// that record's lock, which makes every method here a single atomic step
/// relative to other reservers of the same tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLedger {
    pub tier: PriceTier,
    holds: Vec<OpenHold>,
    sold_by_buyer: Vec<BuyerUnits>,
}

impl TierLedger {
    pub fn new(tier: PriceTier) -> Self {
        Self {
            tier,
            holds: Vec::new(),
            sold_by_buyer: Vec::new(),
        }
    }

    /// Returns expired holds to the pool and reports which reservations lapsed.
    pub fn lapse_expired(&mut self, now: DateTime<Utc>) -> Vec<ReservationId> {
        let (expired, open): (Vec<_>, Vec<_>) = self
            .holds
            .drain(..)
            .partition(|hold| now >= hold.expires_at);
        self.holds = open;

        expired
            .into_iter()
            .map(|hold| {
                self.tier.reserved_count -= hold.quantity;
                hold.reservation_id
            })
            .collect()
    }

    /// Units the buyer currently holds or has bought on this tier.
    pub fn buyer_units(&self, buyer_key: &str) -> u32 {
        let held: u32 = self
            .holds
            .iter()
            .filter(|hold| hold.buyer_key == buyer_key)
            .map(|hold| hold.quantity)
            .sum();
        let sold = self
            .sold_by_buyer
            .iter()
            .find(|entry| entry.buyer_key == buyer_key)
            .map_or(0, |entry| entry.sold);
        held + sold
    }

    /// Claims inventory for a new reservation.
    ///
    /// Callers must lapse expired holds first so they never count against capacity.
    pub fn take_hold(&mut self, reservation: &Reservation) -> Result<()> {
        let quantity = reservation.quantity;
        let available = self.tier.available();
        if quantity > available {
            return Err(EngineError::InsufficientInventory {
                tier: self.tier.id.clone(),
                requested: quantity,
                available,
            });
        }

        let held = self.buyer_units(&reservation.buyer_key);
        if held + quantity > self.tier.per_buyer_limit {
            return Err(EngineError::BuyerLimitExceeded {
                tier: self.tier.id.clone(),
                limit: self.tier.per_buyer_limit,
                held,
                requested: quantity,
            });
        }

        self.tier.reserved_count += quantity;
        self.holds.push(OpenHold {
            reservation_id: reservation.id,
            buyer_key: reservation.buyer_key.clone(),
            quantity,
            expires_at: reservation.expires_at,
        });
        Ok(())
    }

    /// Moves a held reservation into sold inventory, or lapses it if its deadline passed.
    pub fn settle(&mut self, reservation: &mut Reservation, now: DateTime<Utc>) -> Settlement {
        let Some(hold) = self.remove_hold(reservation.id) else {
            // Already swept out of the ledger by an earlier lapse.
            reservation.release(now.max(reservation.expires_at));
            return Settlement::Lapsed;
        };
        self.tier.reserved_count -= hold.quantity;

        if now >= hold.expires_at {
            reservation.release(now);
            return Settlement::Lapsed;
        }

        self.tier.sold_count += hold.quantity;
        match self
            .sold_by_buyer
            .iter_mut()
            .find(|entry| entry.buyer_key == hold.buyer_key)
        {
            Some(entry) => entry.sold += hold.quantity,
            None => self.sold_by_buyer.push(BuyerUnits {
                buyer_key: hold.buyer_key,
                sold: hold.quantity,
            }),
        }
        reservation.state = ReservationState::Committed;
        Settlement::Sold
    }

    /// Gives a held reservation's units back to the pool.
    pub fn drop_hold(&mut self, reservation: &mut Reservation, now: DateTime<Utc>) {
        if let Some(hold) = self.remove_hold(reservation.id) {
            self.tier.reserved_count -= hold.quantity;
        }
        reservation.release(now);
    }

    fn remove_hold(&mut self, id: ReservationId) -> Option<OpenHold> {
        let index = self
            .holds
            .iter()
            .position(|hold| hold.reservation_id == id)?;
        Some(self.holds.swap_remove(index))
    }
}
