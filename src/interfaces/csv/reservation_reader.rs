use crate::domain::{AssetId, OrgId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ReservationEventType {
    /// Registers an asset; `amount` is its hourly rate, empty for a free one.
    Asset,
    /// Homeowner booking, held until paid.
    Reserve,
    /// Staff booking, confirmed at once.
    Book,
    Pay,
    Cancel,
    Complete,
    /// Expires unpaid reservations past their deadline as of `at`.
    Sweep,
}

/// One row of a reservation events file:
/// `type, org, asset, reservation, start, end, amount, at`.
///
/// `reservation` is a label chosen by the file author and used by later rows
/// to refer to the booking. `at` is when the event happens.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ReservationEvent {
    pub r#type: ReservationEventType,
    pub org: OrgId,
    pub asset: Option<AssetId>,
    pub reservation: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub amount: Option<Decimal>,
    pub at: DateTime<Utc>,
}

impl ReservationEvent {
    pub fn require_asset(&self) -> Result<AssetId> {
        self.asset.ok_or_else(|| self.missing("asset"))
    }

    pub fn require_label(&self) -> Result<&str> {
        self.reservation
            .as_deref()
            .filter(|label| !label.is_empty())
            .ok_or_else(|| self.missing("reservation"))
    }

    pub fn require_window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(self.missing("start and end")),
        }
    }

    fn missing(&self, column: &str) -> LedgerError {
        LedgerError::ValidationError(format!("{:?} event requires {column}", self.r#type))
    }
}

/// Streams reservation events from a CSV source, trimming whitespace.
pub struct ReservationReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ReservationReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: super::reader_builder().from_reader(source),
        }
    }

    pub fn events(self) -> impl Iterator<Item = Result<ReservationEvent>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}
