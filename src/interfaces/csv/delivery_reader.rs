use crate::domain::ids::ReservationId;
use crate::domain::payment::PaymentDelivery;
use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize)]
struct DeliveryRow {
    event_id: String,
    reservation_id: ReservationId,
    amount: i64,
}

impl From<DeliveryRow> for PaymentDelivery {
    fn from(row: DeliveryRow) -> Self {
        Self {
            external_event_id: row.event_id,
            reservation_id: row.reservation_id,
            amount_minor_units: row.amount,
        }
    }
}

/// Reads webhook deliveries (`event_id,reservation_id,amount`) from a CSV source.
///
/// Amounts are in minor units. Whitespace around fields is ignored.
pub struct DeliveryReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> DeliveryReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily yields one delivery per row. A malformed row yields an error
    /// and the following rows are still read.
    pub fn deliveries(self) -> impl Iterator<Item = Result<PaymentDelivery>> {
        self.reader
            .into_deserialize::<DeliveryRow>()
            .map(|row| row.map(PaymentDelivery::from).map_err(EngineError::from))
    }
}
