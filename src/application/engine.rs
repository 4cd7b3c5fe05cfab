use super::dedup::{AdmitDecision, PaymentDeduplicator};
use super::issuer::{IssuedTicket, TicketIssuer};
use super::ledger::InventoryLedger;
use super::redemption::{Admission, RedemptionAuthority};
use super::trace_failure;
use crate::config::EngineConfig;
use crate::domain::clock::{Clock, SystemClock};
use crate::domain::ids::{ReservationId, TicketId, TierId};
use crate::domain::inventory::{PriceTier, Reservation};
use crate::domain::payment::{Order, PaymentDelivery, PaymentEvent};
use crate::domain::ports::{Stores, TicketStoreRef};
use crate::domain::redemption::RedemptionAttempt;
use crate::domain::ticket::{EventWindow, Ticket};
use crate::domain::token::TokenSigner;
use crate::error::{EngineError, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// What a payment confirmation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    /// `false` when the event had been processed before.
    pub admitted: bool,
    /// For duplicates, the winner's order if it is visible yet.
    pub order: Option<Order>,
    pub tickets: Vec<IssuedTicket>,
}

/// The main entry point for checkout, confirmation and venue entry.
///
/// `TicketEngine` wires the inventory ledger, the payment deduplicator, the
/// ticket issuer and the redemption authority over one set of stores. It keeps
/// no state of its own, so any number of instances may share the stores.
#[derive(Clone)]
pub struct TicketEngine {
    ledger: InventoryLedger,
    deduplicator: PaymentDeduplicator,
    issuer: TicketIssuer,
    authority: RedemptionAuthority,
    tickets: TicketStoreRef,
    clock: Arc<dyn Clock>,
}

impl TicketEngine {
    /// Creates a new `TicketEngine`.
    ///
    /// # Arguments
    ///
    /// * `stores` - Backends for every store port.
    /// * `config` - Hold duration, entry grace and the token signing key.
    /// * `clock` - Time source for holds, issuance and redemption.
    pub fn new(stores: Stores, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let signer = TokenSigner::new(config.signing_key);
        Self {
            ledger: InventoryLedger::new(stores.ledger.clone(), clock.clone(), config.hold_duration),
            deduplicator: PaymentDeduplicator::new(stores.payments, clock.clone()),
            issuer: TicketIssuer::new(
                stores.ledger,
                stores.tickets.clone(),
                signer.clone(),
                clock.clone(),
                config.entry_grace,
            ),
            authority: RedemptionAuthority::new(stores.tickets.clone(), signer, clock.clone()),
            tickets: stores.tickets,
            clock,
        }
    }

    pub fn with_system_clock(stores: Stores, config: EngineConfig) -> Self {
        Self::new(stores, config, Arc::new(SystemClock))
    }

    pub fn ledger(&self) -> &InventoryLedger {
        &self.ledger
    }

    pub fn deduplicator(&self) -> &PaymentDeduplicator {
        &self.deduplicator
    }

    pub fn issuer(&self) -> &TicketIssuer {
        &self.issuer
    }

    pub fn authority(&self) -> &RedemptionAuthority {
        &self.authority
    }

    pub async fn register_event_window(&self, window: EventWindow) -> Result<()> {
        self.ledger.register_event_window(window).await
    }

    pub async fn create_tier(&self, tier: PriceTier) -> Result<()> {
        self.ledger.create_tier(tier).await
    }

    pub async fn tier(&self, id: &TierId) -> Result<PriceTier> {
        self.ledger.tier(id).await
    }

    pub async fn reserve(
        &self,
        tier_id: &TierId,
        quantity: u32,
        buyer_key: &str,
    ) -> Result<Reservation> {
        self.ledger.reserve(tier_id, quantity, buyer_key).await
    }

    pub async fn release(&self, id: ReservationId) -> Result<Reservation> {
        self.ledger.release(id).await
    }

    pub async fn sweep(&self, tier_id: &TierId) -> Result<usize> {
        self.ledger.release_expired(tier_id).await
    }

    /// Handles one webhook delivery.
    ///
    /// The delivery is checked against the reservation's price, admitted
    /// exactly once, and on the admitted path only the reservation is
    /// committed, the order recorded and the tickets minted. Redeliveries get
    /// `admitted: false` together with whatever the first delivery produced.
    pub async fn confirm_payment(&self, delivery: PaymentDelivery) -> Result<Confirmation> {
        self.check_amount(&delivery)
            .await
            .inspect_err(|e| trace_failure("confirm_payment", e))?;

        match self.deduplicator.admit(&delivery).await? {
            AdmitDecision::Admitted(event) => {
                let (order, tickets) = self.fulfil(&event).await?;
                Ok(Confirmation {
                    admitted: true,
                    order: Some(order),
                    tickets,
                })
            }
            AdmitDecision::Duplicate => {
                let order = self
                    .tickets
                    .order_for_payment(&delivery.external_event_id)
                    .await?;
                let tickets = match &order {
                    Some(order) => self.issuer.tokens_for(order.id).await?,
                    None => Vec::new(),
                };
                Ok(Confirmation {
                    admitted: false,
                    order,
                    tickets,
                })
            }
        }
    }

    /// Finishes an admitted event whose first processing was cut short.
    ///
    /// Every step is idempotent, so running this on a fully processed event
    /// just returns its order and tickets.
    pub async fn recover(&self, external_event_id: &str) -> Result<Confirmation> {
        let event = self
            .deduplicator
            .event(external_event_id)
            .await
            .inspect_err(|e| trace_failure("recover", e))?;
        let (order, tickets) = self.fulfil(&event).await?;
        info!(payment_event = external_event_id, order = %order.id, "Payment event recovered");
        Ok(Confirmation {
            admitted: true,
            order: Some(order),
            tickets,
        })
    }

    pub async fn redeem(&self, token: &str, scanner_id: &str) -> Result<Admission> {
        self.authority.redeem(token, scanner_id).await
    }

    pub async fn void(&self, ticket_id: TicketId) -> Result<Ticket> {
        self.authority.void(ticket_id).await
    }

    pub async fn rotate_token(&self, ticket_id: TicketId) -> Result<IssuedTicket> {
        self.issuer.rotate_token(ticket_id).await
    }

    pub async fn attempts(&self, ticket_id: TicketId) -> Result<Vec<RedemptionAttempt>> {
        self.authority.attempts(ticket_id).await
    }

    pub async fn ticket(&self, ticket_id: TicketId) -> Result<Ticket> {
        self.tickets
            .ticket(ticket_id)
            .await?
            .ok_or(EngineError::TicketNotFound(ticket_id))
    }

    async fn check_amount(&self, delivery: &PaymentDelivery) -> Result<()> {
        delivery.validate()?;
        let reservation = self.ledger.reservation(delivery.reservation_id).await?;
        let tier = self.ledger.tier(&reservation.tier_id).await?;
        let expected = tier.price_of(reservation.quantity)?;
        if delivery.amount_minor_units != expected {
            return Err(EngineError::AmountMismatch {
                expected,
                received: delivery.amount_minor_units,
            });
        }
        Ok(())
    }

    async fn fulfil(&self, event: &PaymentEvent) -> Result<(Order, Vec<IssuedTicket>)> {
        let reservation = self
            .ledger
            .commit(event.reservation_id)
            .await
            .inspect_err(|e| {
                warn!(
                    payment_event = %event.external_event_id,
                    error = %e,
                    "Admitted payment could not be fulfilled"
                )
            })?;
        let tier = self.ledger.tier(&reservation.tier_id).await?;

        let order = Order::for_payment(&reservation, &tier, event, self.clock.now())?;
        let insert = self
            .tickets
            .insert_order_if_absent(order)
            .await
            .inspect_err(|e| trace_failure("confirm_payment", e))?;
        if !insert.was_created() {
            info!(payment_event = %event.external_event_id, "Order already recorded");
        }
        let order = insert.into_inner();
        if order.payment_event_id != event.external_event_id {
            warn!(
                payment_event = %event.external_event_id,
                order = %order.id,
                "Reservation was already paid by another payment event"
            );
        }

        let tickets = self.issuer.issue(&order).await?;
        Ok((order, tickets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::redemption::RedemptionOutcome;
    use crate::domain::ticket::TicketStatus;
    use crate::domain::token::SigningKey;
    use chrono::{DateTime, Duration, Utc};

    fn doors() -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_000_000, 0).unwrap()
    }

    async fn engine(total: u32) -> (TicketEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(doors() - Duration::days(10)));
        let config = EngineConfig::new(SigningKey::new(vec![3u8; 32]).unwrap());
        let engine = TicketEngine::new(Stores::in_memory(), config, clock.clone());
        engine
            .register_event_window(
                EventWindow::new("evt", doors(), doors() + Duration::hours(6)).unwrap(),
            )
            .await
            .unwrap();
        engine
            .create_tier(PriceTier::new(TierId::from("ga"), "evt", 1500, "EUR", total, 4).unwrap())
            .await
            .unwrap();
        (engine, clock)
    }

    fn delivery(id: &str, reservation: &Reservation, amount: i64) -> PaymentDelivery {
        PaymentDelivery {
            external_event_id: id.to_string(),
            reservation_id: reservation.id,
            amount_minor_units: amount,
        }
    }

    #[tokio::test]
    async fn test_checkout_to_entry() {
        let (engine, clock) = engine(10).await;
        let ga = TierId::from("ga");
        let reservation = engine.reserve(&ga, 2, "ana@example.com").await.unwrap();

        let confirmation = engine
            .confirm_payment(delivery("evt_1", &reservation, 3000))
            .await
            .unwrap();
        assert!(confirmation.admitted);
        assert_eq!(confirmation.tickets.len(), 2);
        let order = confirmation.order.unwrap();
        assert_eq!(order.total_minor_units, 3000);
        assert_eq!(confirmation.tickets[0].ticket.holder_email, "ana@example.com");

        let tier = engine.tier(&ga).await.unwrap();
        assert_eq!((tier.reserved_count, tier.sold_count), (0, 2));

        clock.set(doors());
        let admission = engine
            .redeem(&confirmation.tickets[1].token, "gate-1")
            .await
            .unwrap();
        assert_eq!(admission.outcome, RedemptionOutcome::Accepted);
        assert_eq!(admission.ticket.status, TicketStatus::Used);

        let stored = engine.ticket(admission.ticket.id).await.unwrap();
        assert_eq!(stored, admission.ticket);
        assert_eq!(
            engine.ticket(confirmation.tickets[0].ticket.id).await.unwrap().status,
            TicketStatus::Unused
        );
        assert!(matches!(
            engine.ticket(TicketId::new()).await,
            Err(EngineError::TicketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_price_overflow_fails_without_recording() {
        let (engine, _) = engine(10).await;
        let premium = TierId::from("premium");
        let price = i64::MAX / 2 + 1;
        engine
            .create_tier(PriceTier::new(premium.clone(), "evt", price, "EUR", 10, 4).unwrap())
            .await
            .unwrap();
        let reservation = engine.reserve(&premium, 2, "ana@example.com").await.unwrap();

        let result = engine
            .confirm_payment(delivery("evt_big", &reservation, i64::MAX))
            .await;
        assert!(matches!(result, Err(EngineError::ValidationError(_))));
        assert!(engine.deduplicator().event("evt_big").await.is_err());
        assert_eq!(engine.tier(&premium).await.unwrap().sold_count, 0);
    }

    #[tokio::test]
    async fn test_redelivery_returns_original_tickets() {
        let (engine, _) = engine(10).await;
        let reservation = engine
            .reserve(&TierId::from("ga"), 1, "ana@example.com")
            .await
            .unwrap();

        let first = engine
            .confirm_payment(delivery("evt_123", &reservation, 1500))
            .await
            .unwrap();
        let second = engine
            .confirm_payment(delivery("evt_123", &reservation, 1500))
            .await
            .unwrap();

        assert!(first.admitted);
        assert!(!second.admitted);
        assert_eq!(second.order, first.order);
        assert_eq!(second.tickets, first.tickets);
        assert_eq!(engine.tier(&TierId::from("ga")).await.unwrap().sold_count, 1);
    }

    #[tokio::test]
    async fn test_amount_mismatch_is_not_recorded() {
        let (engine, _) = engine(10).await;
        let reservation = engine
            .reserve(&TierId::from("ga"), 2, "ana@example.com")
            .await
            .unwrap();

        assert!(matches!(
            engine
                .confirm_payment(delivery("evt_7", &reservation, 1500))
                .await,
            Err(EngineError::AmountMismatch {
                expected: 3000,
                received: 1500
            })
        ));
        // A corrected redelivery of the same event still goes through.
        let confirmation = engine
            .confirm_payment(delivery("evt_7", &reservation, 3000))
            .await
            .unwrap();
        assert!(confirmation.admitted);
    }

    #[tokio::test]
    async fn test_second_payment_for_same_reservation_mints_nothing() {
        let (engine, _) = engine(10).await;
        let reservation = engine
            .reserve(&TierId::from("ga"), 1, "ana@example.com")
            .await
            .unwrap();

        let first = engine
            .confirm_payment(delivery("evt_a", &reservation, 1500))
            .await
            .unwrap();
        let second = engine
            .confirm_payment(delivery("evt_b", &reservation, 1500))
            .await
            .unwrap();

        assert!(second.admitted);
        assert_eq!(second.order, first.order);
        assert_eq!(second.tickets, first.tickets);
    }

    #[tokio::test]
    async fn test_expired_hold_is_not_fulfilled() {
        let (engine, clock) = engine(10).await;
        let reservation = engine
            .reserve(&TierId::from("ga"), 1, "ana@example.com")
            .await
            .unwrap();

        clock.advance(Duration::minutes(16));
        assert!(matches!(
            engine
                .confirm_payment(delivery("evt_late", &reservation, 1500))
                .await,
            Err(EngineError::ReservationExpired(_))
        ));
        let tier = engine.tier(&TierId::from("ga")).await.unwrap();
        assert_eq!((tier.reserved_count, tier.sold_count), (0, 0));
    }

    #[tokio::test]
    async fn test_recover_is_idempotent() {
        let (engine, _) = engine(10).await;
        let reservation = engine
            .reserve(&TierId::from("ga"), 2, "ana@example.com")
            .await
            .unwrap();
        let confirmation = engine
            .confirm_payment(delivery("evt_r", &reservation, 3000))
            .await
            .unwrap();

        let recovered = engine.recover("evt_r").await.unwrap();
        assert_eq!(recovered.order, confirmation.order);
        assert_eq!(recovered.tickets, confirmation.tickets);

        assert!(matches!(
            engine.recover("evt_unknown").await,
            Err(EngineError::PaymentEventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_finishes_interrupted_admit() {
        let (engine, _) = engine(10).await;
        let reservation = engine
            .reserve(&TierId::from("ga"), 1, "ana@example.com")
            .await
            .unwrap();
        // Admitted, then the process died before committing.
        engine
            .deduplicator()
            .admit(&delivery("evt_crash", &reservation, 1500))
            .await
            .unwrap();

        let redelivered = engine
            .confirm_payment(delivery("evt_crash", &reservation, 1500))
            .await
            .unwrap();
        assert!(!redelivered.admitted);
        assert!(redelivered.order.is_none());

        let recovered = engine.recover("evt_crash").await.unwrap();
        assert_eq!(recovered.tickets.len(), 1);
        assert_eq!(engine.tier(&TierId::from("ga")).await.unwrap().sold_count, 1);
    }

    #[tokio::test]
    async fn test_rotate_then_redeem() {
        let (engine, clock) = engine(10).await;
        let reservation = engine
            .reserve(&TierId::from("ga"), 1, "ana@example.com")
            .await
            .unwrap();
        let issued = engine
            .confirm_payment(delivery("evt_x", &reservation, 1500))
            .await
            .unwrap()
            .tickets
            .remove(0);

        let rotated = engine.rotate_token(issued.ticket.id).await.unwrap();
        clock.set(doors());
        assert!(matches!(
            engine.redeem(&issued.token, "gate-1").await,
            Err(EngineError::StaleToken(_))
        ));
        engine.redeem(&rotated.token, "gate-1").await.unwrap();

        let outcomes: Vec<_> = engine
            .attempts(issued.ticket.id)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.outcome)
            .collect();
        assert_eq!(
            outcomes,
            vec![RedemptionOutcome::RejectedInvalid, RedemptionOutcome::Accepted]
        );
    }
}
