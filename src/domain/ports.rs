use super::ids::{OrderId, ReservationId, TicketId, TierId};
use super::inventory::{PriceTier, Reservation};
use super::payment::{Order, PaymentEvent};
use super::redemption::RedemptionAttempt;
use super::ticket::{EventWindow, Ticket, Transition};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insert<T> {
    Created(T),
    /// The key was taken; this is what the winner stored.
    Existing(T),
}

impl<T> Insert<T> {
    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Created(value) | Self::Existing(value) => value,
        }
    }
}

/// Price tiers, entry windows and reservations.
///
/// Every mutating method is one atomic step against the tier it touches:
/// implementations serialize all writers of a tier's ledger record.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn put_event_window(&self, window: EventWindow) -> Result<()>;
    async fn event_window(&self, event_id: &str) -> Result<Option<EventWindow>>;

    /// Creates a tier. Fails if the id is already in use.
    async fn put_tier(&self, tier: PriceTier) -> Result<()>;
    async fn tier(&self, id: &TierId) -> Result<Option<PriceTier>>;

    async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>>;

    /// Lapses expired holds on the tier, then takes `hold` if capacity and
    /// the buyer's cap allow it.
    async fn reserve(&self, hold: Reservation, now: DateTime<Utc>) -> Result<Reservation>;

    /// Moves a held reservation into sold inventory. Committing an already
    /// committed reservation returns it unchanged.
    async fn commit(&self, id: ReservationId, now: DateTime<Utc>) -> Result<Reservation>;

    /// Returns a held reservation's units. Releasing twice is a no-op.
    async fn release(&self, id: ReservationId, now: DateTime<Utc>) -> Result<Reservation>;

    /// Lapses every expired hold on the tier and returns how many there were.
    async fn release_expired(&self, tier: &TierId, now: DateTime<Utc>) -> Result<usize>;
}

/// Durable dedup log of payment confirmations.
#[async_trait]
pub trait PaymentEventStore: Send + Sync {
    /// Records the event unless its external id was seen before. Returns
    /// `true` only for the caller whose insert won.
    async fn insert_if_absent(&self, event: PaymentEvent) -> Result<bool>;
    async fn get(&self, external_event_id: &str) -> Result<Option<PaymentEvent>>;
}

/// Orders, tickets and the redemption audit trail.
///
/// The audit trail lives here so an accepted scan and its audit row are
/// written in one atomic step.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Unique on `payment_event_id` and on `reservation_id`. On conflict with
    /// either key the stored order is returned.
    async fn insert_order_if_absent(&self, order: Order) -> Result<Insert<Order>>;
    async fn order_for_payment(&self, external_event_id: &str) -> Result<Option<Order>>;

    /// Stores the order's whole ticket batch, unique on `(order_id, sequence)`.
    /// If any ticket of the order exists the stored batch is returned instead.
    async fn insert_batch_if_absent(
        &self,
        order_id: OrderId,
        tickets: Vec<Ticket>,
    ) -> Result<Insert<Vec<Ticket>>>;
    async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>>;
    /// Tickets of an order, ordered by sequence.
    async fn tickets_for_order(&self, order_id: OrderId) -> Result<Vec<Ticket>>;

    /// `status = used, used_at = attempted_at WHERE id AND status = unused
    /// AND token_version = version`. When applied, `accepted` is appended to
    /// the audit trail in the same atomic step; otherwise nothing is written.
    async fn mark_used(
        &self,
        id: TicketId,
        token_version: u32,
        accepted: RedemptionAttempt,
    ) -> Result<Transition>;
    /// `status = void WHERE id AND status = unused`.
    async fn mark_void(&self, id: TicketId, now: DateTime<Utc>) -> Result<Transition>;
    /// `token_version += 1 WHERE id AND status = unused`.
    async fn bump_token_version(&self, id: TicketId) -> Result<Transition>;

    /// Appends a rejected attempt. The trail is append-only.
    async fn append_attempt(&self, attempt: RedemptionAttempt) -> Result<()>;
    /// Attempts for a ticket in the order they were appended.
    async fn attempts_for(&self, ticket_id: TicketId) -> Result<Vec<RedemptionAttempt>>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type PaymentEventStoreRef = Arc<dyn PaymentEventStore>;
pub type TicketStoreRef = Arc<dyn TicketStore>;

/// The full set of stores one engine instance talks to.
#[derive(Clone)]
pub struct Stores {
    pub ledger: LedgerStoreRef,
    pub payments: PaymentEventStoreRef,
    pub tickets: TicketStoreRef,
}

impl Stores {
    /// Uses one backend for every port.
    pub fn shared<S>(store: S) -> Self
    where
        S: LedgerStore + PaymentEventStore + TicketStore + 'static,
    {
        let store = Arc::new(store);
        Self {
            ledger: store.clone(),
            payments: store.clone(),
            tickets: store,
        }
    }
}
