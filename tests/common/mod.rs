#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use turnstile::application::engine::{Confirmation, TicketEngine};
use turnstile::config::EngineConfig;
use turnstile::domain::clock::ManualClock;
use turnstile::domain::ids::{OrderId, TicketId, TierId};
use turnstile::domain::inventory::{PriceTier, Reservation};
use turnstile::domain::payment::{Order, PaymentDelivery, PaymentEvent};
use turnstile::domain::ports::{
    Insert, PaymentEventStore, PaymentEventStoreRef, Stores, TicketStore, TicketStoreRef,
};
use turnstile::domain::redemption::RedemptionAttempt;
use turnstile::domain::ticket::{EventWindow, Ticket, Transition};
use turnstile::domain::token::SigningKey;
use turnstile::error::{EngineError, Result};

pub const SECRET: &str = "integration-test-signing-secret-0123456789";
pub const EVENT: &str = "evt-summer";
pub const TIER: &str = "ga";
pub const PRICE: i64 = 1500;

pub fn doors() -> DateTime<Utc> {
    DateTime::from_timestamp(1_780_000_000, 0).unwrap()
}

pub fn config() -> EngineConfig {
    EngineConfig::new(SigningKey::new(SECRET).unwrap())
}

/// An engine over `stores` whose clock starts a week before doors open.
pub fn engine_on(stores: Stores) -> (TicketEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(doors() - Duration::days(7)));
    (TicketEngine::new(stores, config(), clock.clone()), clock)
}

/// Registers the event window and one tier.
pub async fn setup_event(engine: &TicketEngine, total: u32, per_buyer_limit: u32) {
    engine
        .register_event_window(EventWindow::new(EVENT, doors(), doors() + Duration::hours(6)).unwrap())
        .await
        .unwrap();
    engine
        .create_tier(
            PriceTier::new(TierId::from(TIER), EVENT, PRICE, "EUR", total, per_buyer_limit)
                .unwrap(),
        )
        .await
        .unwrap();
}

pub fn tier() -> TierId {
    TierId::from(TIER)
}

pub fn delivery(external_event_id: &str, reservation: &Reservation) -> PaymentDelivery {
    PaymentDelivery {
        external_event_id: external_event_id.to_string(),
        reservation_id: reservation.id,
        amount_minor_units: PRICE * i64::from(reservation.quantity),
    }
}

/// Reserves `quantity` and pays for it, returning the confirmation.
pub async fn buy(engine: &TicketEngine, buyer: &str, quantity: u32, event_id: &str) -> Confirmation {
    let reservation = engine.reserve(&tier(), quantity, buyer).await.unwrap();
    engine
        .confirm_payment(delivery(event_id, &reservation))
        .await
        .unwrap()
}

fn outage(store: &str) -> EngineError {
    EngineError::IoError(std::io::Error::other(format!("{store} unreachable")))
}

/// Ticket store that can be taken down, wholly or for audit appends only.
pub struct FaultyTickets {
    inner: TicketStoreRef,
    pub down: AtomicBool,
    pub appends_down: AtomicBool,
}

impl FaultyTickets {
    pub fn wrap(inner: TicketStoreRef) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
            appends_down: AtomicBool::new(false),
        })
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(outage("ticket store"));
        }
        Ok(())
    }
}

#[async_trait]
impl TicketStore for FaultyTickets {
    async fn insert_order_if_absent(&self, order: Order) -> Result<Insert<Order>> {
        self.check()?;
        self.inner.insert_order_if_absent(order).await
    }

    async fn order_for_payment(&self, external_event_id: &str) -> Result<Option<Order>> {
        self.check()?;
        self.inner.order_for_payment(external_event_id).await
    }

    async fn insert_batch_if_absent(
        &self,
        order_id: OrderId,
        tickets: Vec<Ticket>,
    ) -> Result<Insert<Vec<Ticket>>> {
        self.check()?;
        self.inner.insert_batch_if_absent(order_id, tickets).await
    }

    async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>> {
        self.check()?;
        self.inner.ticket(id).await
    }

    async fn tickets_for_order(&self, order_id: OrderId) -> Result<Vec<Ticket>> {
        self.check()?;
        self.inner.tickets_for_order(order_id).await
    }

    async fn mark_used(
        &self,
        id: TicketId,
        token_version: u32,
        accepted: RedemptionAttempt,
    ) -> Result<Transition> {
        self.check()?;
        self.inner.mark_used(id, token_version, accepted).await
    }

    async fn mark_void(&self, id: TicketId, now: DateTime<Utc>) -> Result<Transition> {
        self.check()?;
        self.inner.mark_void(id, now).await
    }

    async fn bump_token_version(&self, id: TicketId) -> Result<Transition> {
        self.check()?;
        self.inner.bump_token_version(id).await
    }

    async fn append_attempt(&self, attempt: RedemptionAttempt) -> Result<()> {
        self.check()?;
        if self.appends_down.load(Ordering::SeqCst) {
            return Err(outage("audit trail"));
        }
        self.inner.append_attempt(attempt).await
    }

    async fn attempts_for(&self, ticket_id: TicketId) -> Result<Vec<RedemptionAttempt>> {
        self.check()?;
        self.inner.attempts_for(ticket_id).await
    }
}

/// Payment event log that can be taken down.
pub struct FaultyPayments {
    inner: PaymentEventStoreRef,
    pub down: AtomicBool,
}

impl FaultyPayments {
    pub fn wrap(inner: PaymentEventStoreRef) -> Arc<Self> {
        Arc::new(Self {
            inner,
            down: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PaymentEventStore for FaultyPayments {
    async fn insert_if_absent(&self, event: PaymentEvent) -> Result<bool> {
        if self.down.load(Ordering::SeqCst) {
            return Err(outage("payment log"));
        }
        self.inner.insert_if_absent(event).await
    }

    async fn get(&self, external_event_id: &str) -> Result<Option<PaymentEvent>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(outage("payment log"));
        }
        self.inner.get(external_event_id).await
    }
}
