use crate::domain::ids::{OrderId, ReservationId, TicketId, TierId};
use crate::domain::inventory::{PriceTier, Reservation, ReservationState, Settlement, TierLedger};
use crate::domain::payment::{Order, PaymentEvent};
use crate::domain::ports::{Insert, LedgerStore, PaymentEventStore, Stores, TicketStore};
use crate::domain::redemption::RedemptionAttempt;
use crate::domain::ticket::{EventWindow, Ticket, Transition};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::RwLock;

impl Stores {
    /// A fresh set of empty in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            ledger: Arc::new(InMemoryLedgerStore::new()),
            payments: Arc::new(InMemoryPaymentEventStore::new()),
            tickets: Arc::new(InMemoryTicketStore::new()),
        }
    }
}

#[derive(Default)]
struct LedgerTables {
    windows: HashMap<String, EventWindow>,
    ledgers: HashMap<TierId, TierLedger>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl LedgerTables {
    fn lapse(&mut self, tier: &TierId, now: DateTime<Utc>) -> Result<usize> {
        let ledger = self
            .ledgers
            .get_mut(tier)
            .ok_or_else(|| EngineError::TierNotFound(tier.clone()))?;
        let lapsed = ledger.lapse_expired(now);
        for id in &lapsed {
            if let Some(reservation) = self.reservations.get_mut(id) {
                reservation.release(now);
            }
        }
        Ok(lapsed.len())
    }
}

/// A thread-safe in-memory ledger.
///
/// The write half of the `RwLock` plays the part of the tier row lock, so
/// every mutation is atomic with respect to every other one. Clones share state,
/// which lets tests stand up several engines over one "database".
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    tables: Arc<RwLock<LedgerTables>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn put_event_window(&self, window: EventWindow) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.windows.insert(window.event_id.clone(), window);
        Ok(())
    }

    async fn event_window(&self, event_id: &str) -> Result<Option<EventWindow>> {
        let tables = self.tables.read().await;
        Ok(tables.windows.get(event_id).cloned())
    }

    async fn put_tier(&self, tier: PriceTier) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.ledgers.entry(tier.id.clone()) {
            Entry::Occupied(_) => Err(EngineError::ValidationError(format!(
                "Price tier {} already exists",
                tier.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(TierLedger::new(tier));
                Ok(())
            }
        }
    }

    async fn tier(&self, id: &TierId) -> Result<Option<PriceTier>> {
        let tables = self.tables.read().await;
        Ok(tables.ledgers.get(id).map(|ledger| ledger.tier.clone()))
    }

    async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let tables = self.tables.read().await;
        Ok(tables.reservations.get(&id).cloned())
    }

    async fn reserve(&self, hold: Reservation, now: DateTime<Utc>) -> Result<Reservation> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        tables.lapse(&hold.tier_id, now)?;

        let ledger = tables
            .ledgers
            .get_mut(&hold.tier_id)
            .ok_or_else(|| EngineError::TierNotFound(hold.tier_id.clone()))?;
        ledger.take_hold(&hold)?;
        tables.reservations.insert(hold.id, hold.clone());
        Ok(hold)
    }

    async fn commit(&self, id: ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let mut reservation = tables
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        if reservation.state != ReservationState::Held {
            return reservation.settled().map(|()| reservation);
        }

        let ledger = tables
            .ledgers
            .get_mut(&reservation.tier_id)
            .ok_or_else(|| EngineError::TierNotFound(reservation.tier_id.clone()))?;
        let settlement = ledger.settle(&mut reservation, now);
        tables.reservations.insert(id, reservation.clone());

        match settlement {
            Settlement::Sold => Ok(reservation),
            Settlement::Lapsed => Err(EngineError::ReservationExpired(id)),
        }
    }

    async fn release(&self, id: ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let mut reservation = tables
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        match reservation.state {
            ReservationState::Released => return Ok(reservation),
            ReservationState::Committed => return Err(EngineError::ReservationCommitted(id)),
            ReservationState::Held => {}
        }

        let ledger = tables
            .ledgers
            .get_mut(&reservation.tier_id)
            .ok_or_else(|| EngineError::TierNotFound(reservation.tier_id.clone()))?;
        ledger.drop_hold(&mut reservation, now);
        tables.reservations.insert(id, reservation.clone());
        Ok(reservation)
    }

    async fn release_expired(&self, tier: &TierId, now: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables.write().await;
        tables.lapse(tier, now)
    }
}

/// In-memory payment event log. The map key is the uniqueness constraint.
#[derive(Default, Clone)]
pub struct InMemoryPaymentEventStore {
    events: Arc<RwLock<HashMap<String, PaymentEvent>>>,
}

impl InMemoryPaymentEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentEventStore for InMemoryPaymentEventStore {
    async fn insert_if_absent(&self, event: PaymentEvent) -> Result<bool> {
        let mut events = self.events.write().await;
        match events.entry(event.external_event_id.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(event);
                Ok(true)
            }
        }
    }

    async fn get(&self, external_event_id: &str) -> Result<Option<PaymentEvent>> {
        let events = self.events.read().await;
        Ok(events.get(external_event_id).cloned())
    }
}

#[derive(Default)]
struct TicketTables {
    orders: HashMap<OrderId, Order>,
    order_by_payment: HashMap<String, OrderId>,
    order_by_reservation: HashMap<ReservationId, OrderId>,
    tickets: HashMap<TicketId, Ticket>,
    batches: HashMap<OrderId, Vec<TicketId>>,
    attempts: Vec<RedemptionAttempt>,
}

impl TicketTables {
    fn batch(&self, order_id: OrderId) -> Vec<Ticket> {
        self.batches
            .get(&order_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tickets.get(id).cloned())
            .collect()
    }

    fn transition(&mut self, id: TicketId, apply: impl FnOnce(&mut Ticket) -> bool) -> Transition {
        let Some(ticket) = self.tickets.get_mut(&id) else {
            return Transition::Missing;
        };
        if apply(ticket) {
            Transition::Applied(ticket.clone())
        } else {
            Transition::Rejected(ticket.clone())
        }
    }
}

/// In-memory orders, tickets and redemption attempts under one lock.
#[derive(Default, Clone)]
pub struct InMemoryTicketStore {
    tables: Arc<RwLock<TicketTables>>,
}

impl InMemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for InMemoryTicketStore {
    async fn insert_order_if_absent(&self, order: Order) -> Result<Insert<Order>> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        if let Some(existing) = tables
            .order_by_payment
            .get(&order.payment_event_id)
            .or_else(|| tables.order_by_reservation.get(&order.reservation_id))
            .and_then(|id| tables.orders.get(id))
        {
            return Ok(Insert::Existing(existing.clone()));
        }
        tables
            .order_by_payment
            .insert(order.payment_event_id.clone(), order.id);
        tables
            .order_by_reservation
            .insert(order.reservation_id, order.id);
        tables.orders.insert(order.id, order.clone());
        Ok(Insert::Created(order))
    }

    async fn order_for_payment(&self, external_event_id: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .order_by_payment
            .get(external_event_id)
            .and_then(|id| tables.orders.get(id))
            .cloned())
    }

    async fn insert_batch_if_absent(
        &self,
        order_id: OrderId,
        mut tickets: Vec<Ticket>,
    ) -> Result<Insert<Vec<Ticket>>> {
        let mut tables = self.tables.write().await;
        if tables.batches.contains_key(&order_id) {
            return Ok(Insert::Existing(tables.batch(order_id)));
        }
        tickets.sort_by_key(|ticket| ticket.sequence);
        let ids = tickets.iter().map(|ticket| ticket.id).collect();
        tables.batches.insert(order_id, ids);
        for ticket in &tickets {
            tables.tickets.insert(ticket.id, ticket.clone());
        }
        Ok(Insert::Created(tickets))
    }

    async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>> {
        let tables = self.tables.read().await;
        Ok(tables.tickets.get(&id).cloned())
    }

    async fn tickets_for_order(&self, order_id: OrderId) -> Result<Vec<Ticket>> {
        let tables = self.tables.read().await;
        Ok(tables.batch(order_id))
    }

    async fn mark_used(
        &self,
        id: TicketId,
        token_version: u32,
        accepted: RedemptionAttempt,
    ) -> Result<Transition> {
        let mut tables = self.tables.write().await;
        let transition = tables.transition(id, |ticket| {
            ticket.redeem(token_version, accepted.attempted_at)
        });
        if matches!(transition, Transition::Applied(_)) {
            tables.attempts.push(accepted);
        }
        Ok(transition)
    }

    async fn mark_void(&self, id: TicketId, now: DateTime<Utc>) -> Result<Transition> {
        let mut tables = self.tables.write().await;
        Ok(tables.transition(id, |ticket| ticket.void(now)))
    }

    async fn bump_token_version(&self, id: TicketId) -> Result<Transition> {
        let mut tables = self.tables.write().await;
        Ok(tables.transition(id, Ticket::rotate_token))
    }

    async fn append_attempt(&self, attempt: RedemptionAttempt) -> Result<()> {
        self.tables.write().await.attempts.push(attempt);
        Ok(())
    }

    async fn attempts_for(&self, ticket_id: TicketId) -> Result<Vec<RedemptionAttempt>> {
        let tables = self.tables.read().await;
        Ok(tables
            .attempts
            .iter()
            .filter(|attempt| attempt.ticket_id == Some(ticket_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::redemption::RedemptionOutcome;
    use crate::domain::ticket::TicketStatus;
    use chrono::Duration;

    fn tier(total: u32) -> PriceTier {
        PriceTier::new(TierId::from("ga"), "evt", 1000, "EUR", total, 10).unwrap()
    }

    fn hold(quantity: u32, now: DateTime<Utc>) -> Reservation {
        Reservation::hold(
            TierId::from("ga"),
            quantity,
            "ana@example.com",
            now,
            now + Duration::minutes(10),
        )
    }

    fn accepted(ticket_id: TicketId, at: DateTime<Utc>) -> RedemptionAttempt {
        RedemptionAttempt {
            ticket_id: Some(ticket_id),
            attempted_at: at,
            outcome: RedemptionOutcome::Accepted,
            scanner_id: "gate-1".to_string(),
        }
    }

    fn ticket(order_id: OrderId, sequence: u32) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: TicketId::new(),
            order_id,
            event_id: "evt".to_string(),
            tier_id: TierId::from("ga"),
            sequence,
            holder_email: "ana@example.com".to_string(),
            status: TicketStatus::Unused,
            issued_at: now,
            used_at: None,
            voided_at: None,
            token_version: 1,
            not_before: now,
            not_after: now + Duration::hours(3),
        }
    }

    #[tokio::test]
    async fn test_put_tier_rejects_duplicates() {
        let store = InMemoryLedgerStore::new();
        store.put_tier(tier(5)).await.unwrap();
        assert!(store.put_tier(tier(5)).await.is_err());
        assert_eq!(store.tier(&TierId::from("ga")).await.unwrap().unwrap().total_inventory, 5);
    }

    #[tokio::test]
    async fn test_reserve_unknown_tier() {
        let store = InMemoryLedgerStore::new();
        let result = store.reserve(hold(1, Utc::now()), Utc::now()).await;
        assert!(matches!(result, Err(EngineError::TierNotFound(_))));
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = InMemoryLedgerStore::new();
        store.put_tier(tier(5)).await.unwrap();
        let now = Utc::now();
        let reservation = store.reserve(hold(2, now), now).await.unwrap();

        let first = store.commit(reservation.id, now).await.unwrap();
        let second = store.commit(reservation.id, now).await.unwrap();
        assert_eq!(first, second);

        let tier = store.tier(&TierId::from("ga")).await.unwrap().unwrap();
        assert_eq!(tier.sold_count, 2);
        assert_eq!(tier.reserved_count, 0);
    }

    #[tokio::test]
    async fn test_lazy_expiry_on_reserve() {
        let store = InMemoryLedgerStore::new();
        store.put_tier(tier(1)).await.unwrap();
        let now = Utc::now();
        let stale = store.reserve(hold(1, now), now).await.unwrap();

        let later = now + Duration::minutes(11);
        store.reserve(hold(1, later), later).await.unwrap();

        let stale = store.reservation(stale.id).await.unwrap().unwrap();
        assert_eq!(stale.state, ReservationState::Released);
        assert!(matches!(
            store.commit(stale.id, later).await,
            Err(EngineError::ReservationExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_release_then_commit() {
        let store = InMemoryLedgerStore::new();
        store.put_tier(tier(3)).await.unwrap();
        let now = Utc::now();
        let reservation = store.reserve(hold(3, now), now).await.unwrap();

        store.release(reservation.id, now).await.unwrap();
        store.release(reservation.id, now).await.unwrap();
        assert_eq!(store.tier(&TierId::from("ga")).await.unwrap().unwrap().available(), 3);
        assert!(matches!(
            store.commit(reservation.id, now).await,
            Err(EngineError::ReservationReleased(_))
        ));
    }

    #[tokio::test]
    async fn test_payment_event_insert_if_absent() {
        let store = InMemoryPaymentEventStore::new();
        let event = PaymentEvent {
            external_event_id: "evt_123".to_string(),
            reservation_id: ReservationId::new(),
            amount_minor_units: 1500,
            processed_at: Utc::now(),
        };
        assert!(store.insert_if_absent(event.clone()).await.unwrap());
        assert!(!store.insert_if_absent(event.clone()).await.unwrap());
        assert_eq!(store.get("evt_123").await.unwrap(), Some(event));
    }

    #[tokio::test]
    async fn test_ticket_batch_is_inserted_once() {
        let store = InMemoryTicketStore::new();
        let order_id = OrderId::new();
        let first = vec![ticket(order_id, 1), ticket(order_id, 0)];
        let second = vec![ticket(order_id, 0), ticket(order_id, 1)];

        let created = store.insert_batch_if_absent(order_id, first).await.unwrap();
        assert!(created.was_created());
        let existing = store.insert_batch_if_absent(order_id, second).await.unwrap();
        assert!(!existing.was_created());

        let created = created.into_inner();
        assert_eq!(existing.into_inner(), created);
        assert_eq!(created[0].sequence, 0);
        assert_eq!(store.tickets_for_order(order_id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_mark_used_is_conditional() {
        let store = InMemoryTicketStore::new();
        let order_id = OrderId::new();
        let t = ticket(order_id, 0);
        store.insert_batch_if_absent(order_id, vec![t.clone()]).await.unwrap();

        let now = Utc::now();
        assert!(matches!(
            store.mark_used(t.id, 1, accepted(t.id, now)).await.unwrap(),
            Transition::Applied(_)
        ));
        match store.mark_used(t.id, 1, accepted(t.id, now)).await.unwrap() {
            Transition::Rejected(current) => assert_eq!(current.status, TicketStatus::Used),
            other => panic!("unexpected {other:?}"),
        }
        let ghost = TicketId::new();
        assert_eq!(
            store.mark_used(ghost, 1, accepted(ghost, now)).await.unwrap(),
            Transition::Missing
        );

        // Only the applied transition left an audit row.
        let attempts = store.attempts_for(t.id).await.unwrap();
        assert_eq!(attempts, vec![accepted(t.id, now)]);
        assert!(store.attempts_for(ghost).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_writes_no_accepted_row() {
        let store = InMemoryTicketStore::new();
        let order_id = OrderId::new();
        let t = ticket(order_id, 0);
        store.insert_batch_if_absent(order_id, vec![t.clone()]).await.unwrap();

        let result = store.mark_used(t.id, 2, accepted(t.id, Utc::now())).await.unwrap();
        assert!(matches!(result, Transition::Rejected(ref current) if current.is_unused()));
        assert!(store.attempts_for(t.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_audit_filters_by_ticket() {
        let store = InMemoryTicketStore::new();
        let ticket_id = TicketId::new();
        for ticket in [Some(ticket_id), None, Some(ticket_id)] {
            store
                .append_attempt(RedemptionAttempt {
                    ticket_id: ticket,
                    attempted_at: Utc::now(),
                    outcome: RedemptionOutcome::RejectedInvalid,
                    scanner_id: "gate-1".to_string(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.attempts_for(ticket_id).await.unwrap().len(), 2);
    }
}
