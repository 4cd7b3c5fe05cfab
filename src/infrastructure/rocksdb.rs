use crate::domain::ids::{OrderId, ReservationId, TicketId, TierId};
use crate::domain::inventory::{PriceTier, Reservation, ReservationState, Settlement, TierLedger};
use crate::domain::payment::{Order, PaymentEvent};
use crate::domain::ports::{Insert, LedgerStore, PaymentEventStore, TicketStore};
use crate::domain::redemption::RedemptionAttempt;
use crate::domain::ticket::{EventWindow, Ticket, Transition};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, Transaction,
    TransactionDB, TransactionDBOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Entry windows keyed by event id.
pub const CF_WINDOWS: &str = "windows";
/// `TierLedger` records keyed by tier id. The lock on this row serializes a tier.
pub const CF_LEDGERS: &str = "ledgers";
pub const CF_RESERVATIONS: &str = "reservations";
/// Payment events keyed by external event id.
pub const CF_PAYMENT_EVENTS: &str = "payment_events";
pub const CF_ORDERS: &str = "orders";
pub const CF_ORDERS_BY_PAYMENT: &str = "orders_by_payment";
pub const CF_ORDERS_BY_RESERVATION: &str = "orders_by_reservation";
pub const CF_TICKETS: &str = "tickets";
/// Ticket ids of each order, in sequence order.
pub const CF_ORDER_TICKETS: &str = "order_tickets";
/// Redemption attempts keyed by `ticket id ++ per-ticket sequence`.
pub const CF_ATTEMPTS: &str = "attempts";
/// Last audit sequence of each ticket, keyed by ticket id.
pub const CF_ATTEMPT_SEQUENCES: &str = "attempt_sequences";

const COLUMN_FAMILIES: [&str; 11] = [
    CF_WINDOWS,
    CF_LEDGERS,
    CF_RESERVATIONS,
    CF_PAYMENT_EVENTS,
    CF_ORDERS,
    CF_ORDERS_BY_PAYMENT,
    CF_ORDERS_BY_RESERVATION,
    CF_TICKETS,
    CF_ORDER_TICKETS,
    CF_ATTEMPTS,
    CF_ATTEMPT_SEQUENCES,
];

/// Audit prefix for attempts whose token never authenticated.
const UNATTRIBUTED: [u8; 16] = [0; 16];

/// A persistent store implementation using RocksDB.
///
/// Implements every store port on one pessimistic `TransactionDB`. Each
/// mutating operation runs in its own transaction and takes row locks with
/// `get_for_update`, always locking the tier ledger before any reservation,
/// so concurrent writers of a tier queue up instead of racing.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<TransactionDB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<TransactionDB>,
}

type Txn<'a> = Transaction<'a, TransactionDB>;

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// # Arguments
    ///
    /// * `path` - The filesystem path where the database will be stored.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(10_000);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = TransactionDB::open_cf_descriptors(&opts, &txn_opts, path, descriptors)?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            EngineError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        decode(self.db.get_cf(self.cf(cf)?, key)?)
    }

    fn reserve_now(&self, hold: Reservation, now: DateTime<Utc>) -> Result<Reservation> {
        let (ledgers, reservations) = (self.cf(CF_LEDGERS)?, self.cf(CF_RESERVATIONS)?);
        let txn = self.db.transaction();
        let key = hold.tier_id.as_str().as_bytes();

        let mut ledger: TierLedger = locked(&txn, ledgers, key)?
            .ok_or_else(|| EngineError::TierNotFound(hold.tier_id.clone()))?;
        lapse(&txn, reservations, &mut ledger, now)?;
        let taken = ledger.take_hold(&hold);
        if taken.is_ok() {
            put(&txn, reservations, hold.id.as_bytes(), &hold)?;
        }
        put(&txn, ledgers, key, &ledger)?;
        txn.commit()?;

        taken.map(|()| hold)
    }

    fn settle_now(
        &self,
        id: ReservationId,
        settle: impl FnOnce(&mut TierLedger, &mut Reservation) -> Result<()>,
    ) -> Result<Reservation> {
        let (ledgers, reservations) = (self.cf(CF_LEDGERS)?, self.cf(CF_RESERVATIONS)?);
        // The tier is immutable on a reservation, so an unlocked read finds the row to lock.
        let tier_id = self
            .read::<Reservation>(CF_RESERVATIONS, id.as_bytes())?
            .ok_or(EngineError::ReservationNotFound(id))?
            .tier_id;

        let txn = self.db.transaction();
        let key = tier_id.as_str().as_bytes();
        let mut ledger: TierLedger =
            locked(&txn, ledgers, key)?.ok_or_else(|| EngineError::TierNotFound(tier_id.clone()))?;
        let mut reservation: Reservation = locked(&txn, reservations, id.as_bytes())?
            .ok_or(EngineError::ReservationNotFound(id))?;

        let outcome = settle(&mut ledger, &mut reservation);
        put(&txn, reservations, id.as_bytes(), &reservation)?;
        put(&txn, ledgers, key, &ledger)?;
        txn.commit()?;

        outcome.map(|()| reservation)
    }

    /// Applies a conditional ticket update. `accepted`, if given, is
    /// recorded in the same transaction when the update applies.
    fn ticket_transition(
        &self,
        id: TicketId,
        apply: impl FnOnce(&mut Ticket) -> bool,
        accepted: Option<&RedemptionAttempt>,
    ) -> Result<Transition> {
        let tickets = self.cf(CF_TICKETS)?;
        let txn = self.db.transaction();
        let Some(mut ticket) = locked::<Ticket>(&txn, tickets, id.as_bytes())? else {
            return Ok(Transition::Missing);
        };
        if !apply(&mut ticket) {
            return Ok(Transition::Rejected(ticket));
        }
        put(&txn, tickets, id.as_bytes(), &ticket)?;
        if let Some(attempt) = accepted {
            self.record(&txn, attempt)?;
        }
        txn.commit()?;
        Ok(Transition::Applied(ticket))
    }

    /// Writes an audit row inside `txn`. Attributed rows take the next
    /// sequence of their ticket; only scans of one ticket contend on it.
    fn record(&self, txn: &Txn<'_>, attempt: &RedemptionAttempt) -> Result<()> {
        let attempts = self.cf(CF_ATTEMPTS)?;
        let key = match attempt.ticket_id {
            Some(ticket_id) => {
                let sequences = self.cf(CF_ATTEMPT_SEQUENCES)?;
                let sequence =
                    locked::<u64>(txn, sequences, ticket_id.as_bytes())?.unwrap_or(0) + 1;
                put(txn, sequences, ticket_id.as_bytes(), &sequence)?;
                [ticket_id.as_bytes().as_slice(), sequence.to_be_bytes().as_slice()].concat()
            }
            None => [
                UNATTRIBUTED.as_slice(),
                attempt.attempted_at.timestamp_micros().to_be_bytes().as_slice(),
                Uuid::new_v4().as_bytes().as_slice(),
            ]
            .concat(),
        };
        put(txn, attempts, key, attempt)
    }

    fn batch(&self, order_id: OrderId) -> Result<Vec<Ticket>> {
        let ids: Vec<TicketId> = self
            .read(CF_ORDER_TICKETS, order_id.as_bytes())?
            .unwrap_or_default();
        let mut tickets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ticket) = self.read(CF_TICKETS, id.as_bytes())? {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }
}

fn decode<T: DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<T>> {
    Ok(bytes
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()?)
}

fn locked<T: DeserializeOwned>(
    txn: &Txn<'_>,
    cf: &ColumnFamily,
    key: impl AsRef<[u8]>,
) -> Result<Option<T>> {
    decode(txn.get_for_update_cf(cf, key, true)?)
}

fn put<T: Serialize>(txn: &Txn<'_>, cf: &ColumnFamily, key: impl AsRef<[u8]>, value: &T) -> Result<()> {
    txn.put_cf(cf, key, serde_json::to_vec(value)?)?;
    Ok(())
}

/// Marks the ledger's expired holds released. The caller holds the ledger row lock.
fn lapse(
    txn: &Txn<'_>,
    reservations: &ColumnFamily,
    ledger: &mut TierLedger,
    now: DateTime<Utc>,
) -> Result<usize> {
    let lapsed = ledger.lapse_expired(now);
    for id in &lapsed {
        if let Some(mut reservation) = locked::<Reservation>(txn, reservations, id.as_bytes())? {
            reservation.release(now);
            put(txn, reservations, id.as_bytes(), &reservation)?;
        }
    }
    Ok(lapsed.len())
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn put_event_window(&self, window: EventWindow) -> Result<()> {
        let value = serde_json::to_vec(&window)?;
        self.db
            .put_cf(self.cf(CF_WINDOWS)?, window.event_id.as_bytes(), value)?;
        Ok(())
    }

    async fn event_window(&self, event_id: &str) -> Result<Option<EventWindow>> {
        self.read(CF_WINDOWS, event_id.as_bytes())
    }

    async fn put_tier(&self, tier: PriceTier) -> Result<()> {
        let ledgers = self.cf(CF_LEDGERS)?;
        let txn = self.db.transaction();
        let key = tier.id.as_str().as_bytes();
        if locked::<TierLedger>(&txn, ledgers, key)?.is_some() {
            return Err(EngineError::ValidationError(format!(
                "Price tier {} already exists",
                tier.id
            )));
        }
        put(&txn, ledgers, key, &TierLedger::new(tier.clone()))?;
        txn.commit()?;
        Ok(())
    }

    async fn tier(&self, id: &TierId) -> Result<Option<PriceTier>> {
        Ok(self
            .read::<TierLedger>(CF_LEDGERS, id.as_str().as_bytes())?
            .map(|ledger| ledger.tier))
    }

    async fn reservation(&self, id: ReservationId) -> Result<Option<Reservation>> {
        self.read(CF_RESERVATIONS, id.as_bytes())
    }

    async fn reserve(&self, hold: Reservation, now: DateTime<Utc>) -> Result<Reservation> {
        self.reserve_now(hold, now)
    }

    async fn commit(&self, id: ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        self.settle_now(id, |ledger, reservation| {
            if reservation.state != ReservationState::Held {
                return reservation.settled();
            }
            match ledger.settle(reservation, now) {
                Settlement::Sold => Ok(()),
                Settlement::Lapsed => Err(EngineError::ReservationExpired(reservation.id)),
            }
        })
    }

    async fn release(&self, id: ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        self.settle_now(id, |ledger, reservation| match reservation.state {
            ReservationState::Released => Ok(()),
            ReservationState::Committed => Err(EngineError::ReservationCommitted(reservation.id)),
            ReservationState::Held => {
                ledger.drop_hold(reservation, now);
                Ok(())
            }
        })
    }

    async fn release_expired(&self, tier: &TierId, now: DateTime<Utc>) -> Result<usize> {
        let (ledgers, reservations) = (self.cf(CF_LEDGERS)?, self.cf(CF_RESERVATIONS)?);
        let txn = self.db.transaction();
        let key = tier.as_str().as_bytes();
        let mut ledger: TierLedger =
            locked(&txn, ledgers, key)?.ok_or_else(|| EngineError::TierNotFound(tier.clone()))?;
        let lapsed = lapse(&txn, reservations, &mut ledger, now)?;
        put(&txn, ledgers, key, &ledger)?;
        txn.commit()?;
        Ok(lapsed)
    }
}

#[async_trait]
impl PaymentEventStore for RocksDBStore {
    async fn insert_if_absent(&self, event: PaymentEvent) -> Result<bool> {
        let events = self.cf(CF_PAYMENT_EVENTS)?;
        let txn = self.db.transaction();
        let key = event.external_event_id.as_bytes();
        if txn.get_for_update_cf(events, key, true)?.is_some() {
            return Ok(false);
        }
        put(&txn, events, key, &event)?;
        txn.commit()?;
        Ok(true)
    }

    async fn get(&self, external_event_id: &str) -> Result<Option<PaymentEvent>> {
        self.read(CF_PAYMENT_EVENTS, external_event_id.as_bytes())
    }
}

#[async_trait]
impl TicketStore for RocksDBStore {
    async fn insert_order_if_absent(&self, order: Order) -> Result<Insert<Order>> {
        let by_payment = self.cf(CF_ORDERS_BY_PAYMENT)?;
        let by_reservation = self.cf(CF_ORDERS_BY_RESERVATION)?;
        let orders = self.cf(CF_ORDERS)?;

        let txn = self.db.transaction();
        let payment_key = order.payment_event_id.as_bytes();
        let reservation_key = order.reservation_id.as_bytes();
        let existing: Option<OrderId> = match locked(&txn, by_payment, payment_key)? {
            Some(id) => Some(id),
            None => locked(&txn, by_reservation, reservation_key)?,
        };
        if let Some(id) = existing {
            let stored = decode(txn.get_cf(orders, id.as_bytes())?)?
                .ok_or(EngineError::OrderNotFound(id))?;
            return Ok(Insert::Existing(stored));
        }

        put(&txn, orders, order.id.as_bytes(), &order)?;
        put(&txn, by_payment, payment_key, &order.id)?;
        put(&txn, by_reservation, reservation_key, &order.id)?;
        txn.commit()?;
        Ok(Insert::Created(order))
    }

    async fn order_for_payment(&self, external_event_id: &str) -> Result<Option<Order>> {
        match self.read::<OrderId>(CF_ORDERS_BY_PAYMENT, external_event_id.as_bytes())? {
            Some(id) => self.read(CF_ORDERS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn insert_batch_if_absent(
        &self,
        order_id: OrderId,
        mut tickets: Vec<Ticket>,
    ) -> Result<Insert<Vec<Ticket>>> {
        let order_tickets = self.cf(CF_ORDER_TICKETS)?;
        let ticket_cf = self.cf(CF_TICKETS)?;

        let txn = self.db.transaction();
        if txn
            .get_for_update_cf(order_tickets, order_id.as_bytes(), true)?
            .is_some()
        {
            drop(txn);
            return Ok(Insert::Existing(self.batch(order_id)?));
        }

        tickets.sort_by_key(|ticket| ticket.sequence);
        let ids: Vec<TicketId> = tickets.iter().map(|ticket| ticket.id).collect();
        for ticket in &tickets {
            put(&txn, ticket_cf, ticket.id.as_bytes(), ticket)?;
        }
        put(&txn, order_tickets, order_id.as_bytes(), &ids)?;
        txn.commit()?;
        Ok(Insert::Created(tickets))
    }

    async fn ticket(&self, id: TicketId) -> Result<Option<Ticket>> {
        self.read(CF_TICKETS, id.as_bytes())
    }

    async fn tickets_for_order(&self, order_id: OrderId) -> Result<Vec<Ticket>> {
        self.batch(order_id)
    }

    async fn mark_used(
        &self,
        id: TicketId,
        token_version: u32,
        accepted: RedemptionAttempt,
    ) -> Result<Transition> {
        self.ticket_transition(
            id,
            |ticket| ticket.redeem(token_version, accepted.attempted_at),
            Some(&accepted),
        )
    }

    async fn mark_void(&self, id: TicketId, now: DateTime<Utc>) -> Result<Transition> {
        self.ticket_transition(id, |ticket| ticket.void(now), None)
    }

    async fn bump_token_version(&self, id: TicketId) -> Result<Transition> {
        self.ticket_transition(id, Ticket::rotate_token, None)
    }

    async fn append_attempt(&self, attempt: RedemptionAttempt) -> Result<()> {
        let txn = self.db.transaction();
        self.record(&txn, &attempt)?;
        txn.commit()?;
        Ok(())
    }

    async fn attempts_for(&self, ticket_id: TicketId) -> Result<Vec<RedemptionAttempt>> {
        let prefix = ticket_id.as_bytes();
        let iter = self.db.iterator_cf(
            self.cf(CF_ATTEMPTS)?,
            IteratorMode::From(prefix, Direction::Forward),
        );

        let mut attempts = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            attempts.push(serde_json::from_slice(&value)?);
        }
        Ok(attempts)
    }
}
