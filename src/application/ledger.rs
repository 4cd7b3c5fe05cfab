use super::trace_failure;
use crate::domain::clock::Clock;
use crate::domain::ids::{ReservationId, TierId};
use crate::domain::inventory::{PriceTier, Reservation};
use crate::domain::ports::LedgerStoreRef;
use crate::domain::ticket::EventWindow;
use crate::error::{EngineError, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::info;

/// Per-tier inventory accounting.
///
/// Holds are taken, committed and released through the store's atomic
/// operations only. Expiry is enforced lazily: every `reserve` lapses stale
/// holds on its tier first, so a lagging sweeper never skews availability.
#[derive(Clone)]
pub struct InventoryLedger {
    store: LedgerStoreRef,
    clock: Arc<dyn Clock>,
    hold_duration: Duration,
}

impl InventoryLedger {
    pub fn new(store: LedgerStoreRef, clock: Arc<dyn Clock>, hold_duration: Duration) -> Self {
        Self {
            store,
            clock,
            hold_duration,
        }
    }

    pub async fn register_event_window(&self, window: EventWindow) -> Result<()> {
        let event_id = window.event_id.clone();
        self.store.put_event_window(window).await?;
        info!(event = %event_id, "Entry window registered");
        Ok(())
    }

    pub async fn create_tier(&self, tier: PriceTier) -> Result<()> {
        let (id, total) = (tier.id.clone(), tier.total_inventory);
        self.store
            .put_tier(tier)
            .await
            .inspect_err(|e| trace_failure("create_tier", e))?;
        info!(tier = %id, total, "Price tier created");
        Ok(())
    }

    pub async fn tier(&self, id: &TierId) -> Result<PriceTier> {
        self.store
            .tier(id)
            .await?
            .ok_or_else(|| EngineError::TierNotFound(id.clone()))
    }

    pub async fn reservation(&self, id: ReservationId) -> Result<Reservation> {
        self.store
            .reservation(id)
            .await?
            .ok_or(EngineError::ReservationNotFound(id))
    }

    /// Holds `quantity` units of a tier for `buyer_key` for the configured hold duration.
    pub async fn reserve(
        &self,
        tier_id: &TierId,
        quantity: u32,
        buyer_key: &str,
    ) -> Result<Reservation> {
        self.reserve_for(tier_id, quantity, buyer_key, self.hold_duration)
            .await
    }

    pub async fn reserve_for(
        &self,
        tier_id: &TierId,
        quantity: u32,
        buyer_key: &str,
        hold_duration: Duration,
    ) -> Result<Reservation> {
        let result = self
            .try_reserve(tier_id, quantity, buyer_key, hold_duration)
            .await;
        match &result {
            Ok(reservation) => info!(
                reservation = %reservation.id,
                tier = %tier_id,
                quantity,
                expires_at = %reservation.expires_at,
                "Inventory held"
            ),
            Err(e) => trace_failure("reserve", e),
        }
        result
    }

    async fn try_reserve(
        &self,
        tier_id: &TierId,
        quantity: u32,
        buyer_key: &str,
        hold_duration: Duration,
    ) -> Result<Reservation> {
        if quantity == 0 {
            return Err(EngineError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }
        let buyer_key = buyer_key.trim();
        if buyer_key.is_empty() {
            return Err(EngineError::ValidationError(
                "Buyer key must not be empty".to_string(),
            ));
        }
        if hold_duration <= Duration::zero() {
            return Err(EngineError::ValidationError(
                "Hold duration must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let hold = Reservation::hold(
            tier_id.clone(),
            quantity,
            buyer_key,
            now,
            now + hold_duration,
        );
        self.store.reserve(hold, now).await
    }

    /// Converts a hold into sold inventory. Safe to retry.
    pub async fn commit(&self, id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .store
            .commit(id, self.clock.now())
            .await
            .inspect_err(|e| trace_failure("commit", e))?;
        info!(reservation = %id, tier = %reservation.tier_id, quantity = reservation.quantity, "Reservation committed");
        Ok(reservation)
    }

    /// Returns a hold's units to the tier. Safe to retry.
    pub async fn release(&self, id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .store
            .release(id, self.clock.now())
            .await
            .inspect_err(|e| trace_failure("release", e))?;
        info!(reservation = %id, tier = %reservation.tier_id, "Reservation released");
        Ok(reservation)
    }

    /// Sweeper entry point. Returns how many holds lapsed.
    pub async fn release_expired(&self, tier_id: &TierId) -> Result<usize> {
        let lapsed = self
            .store
            .release_expired(tier_id, self.clock.now())
            .await
            .inspect_err(|e| trace_failure("release_expired", e))?;
        info!(tier = %tier_id, lapsed, "Expired holds swept");
        Ok(lapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::inventory::ReservationState;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use chrono::{DateTime, Utc};

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_767_000_000, 0).unwrap()
    }

    async fn ledger(total: u32, limit: u32) -> (InventoryLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let ledger = InventoryLedger::new(
            Arc::new(InMemoryLedgerStore::new()),
            clock.clone(),
            Duration::minutes(15),
        );
        let tier = PriceTier::new(TierId::from("ga"), "evt", 2000, "EUR", total, limit).unwrap();
        ledger.create_tier(tier).await.unwrap();
        (ledger, clock)
    }

    #[tokio::test]
    async fn test_reserve_sets_hold_deadline() {
        let (ledger, _) = ledger(10, 4).await;
        let reservation = ledger
            .reserve(&TierId::from("ga"), 2, " ana@example.com ")
            .await
            .unwrap();

        assert_eq!(reservation.state, ReservationState::Held);
        assert_eq!(reservation.buyer_key, "ana@example.com");
        assert_eq!(reservation.expires_at, start() + Duration::minutes(15));
        assert_eq!(ledger.tier(&TierId::from("ga")).await.unwrap().reserved_count, 2);
    }

    #[tokio::test]
    async fn test_reserve_rejects_bad_input() {
        let (ledger, _) = ledger(10, 4).await;
        let ga = TierId::from("ga");
        assert!(matches!(
            ledger.reserve(&ga, 0, "ana").await,
            Err(EngineError::ValidationError(_))
        ));
        assert!(matches!(
            ledger.reserve(&ga, 1, "   ").await,
            Err(EngineError::ValidationError(_))
        ));
        assert!(matches!(
            ledger.reserve(&TierId::from("vip"), 1, "ana").await,
            Err(EngineError::TierNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_after_expiry_fails() {
        let (ledger, clock) = ledger(10, 4).await;
        let reservation = ledger.reserve(&TierId::from("ga"), 1, "ana").await.unwrap();

        clock.advance(Duration::minutes(15));
        assert!(matches!(
            ledger.commit(reservation.id).await,
            Err(EngineError::ReservationExpired(_))
        ));
        // Retrying reports the same thing and does not touch the counters.
        assert!(matches!(
            ledger.commit(reservation.id).await,
            Err(EngineError::ReservationExpired(_))
        ));
        let tier = ledger.tier(&TierId::from("ga")).await.unwrap();
        assert_eq!((tier.reserved_count, tier.sold_count), (0, 0));
    }

    #[tokio::test]
    async fn test_release_committed_is_rejected() {
        let (ledger, _) = ledger(10, 4).await;
        let reservation = ledger.reserve(&TierId::from("ga"), 1, "ana").await.unwrap();
        ledger.commit(reservation.id).await.unwrap();

        assert!(matches!(
            ledger.release(reservation.id).await,
            Err(EngineError::ReservationCommitted(_))
        ));
        assert!(matches!(
            ledger.release(ReservationId::new()).await,
            Err(EngineError::ReservationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweeper_counts_lapsed_holds() {
        let (ledger, clock) = ledger(10, 10).await;
        let ga = TierId::from("ga");
        ledger.reserve(&ga, 1, "ana").await.unwrap();
        ledger.reserve(&ga, 2, "ben").await.unwrap();
        ledger
            .reserve_for(&ga, 3, "cid", Duration::hours(1))
            .await
            .unwrap();

        clock.advance(Duration::minutes(20));
        assert_eq!(ledger.release_expired(&ga).await.unwrap(), 2);
        assert_eq!(ledger.release_expired(&ga).await.unwrap(), 0);
        assert_eq!(ledger.tier(&ga).await.unwrap().reserved_count, 3);
    }
}
