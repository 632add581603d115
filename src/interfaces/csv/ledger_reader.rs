use crate::domain::money::Amount;
use crate::domain::{DiscountId, OrgId, UnitId};
use crate::error::{LedgerError, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LedgerEventType {
    /// Issues a dues statement: `amount` is the base, `date` the due date.
    Statement,
    /// Dues payment that must match the amount due.
    Exact,
    /// Dues payment whose excess becomes unit credit.
    Advance,
    Expense,
    /// Defines a percentage discount: `amount` is the percentage, `discount`
    /// its id and `months` the minimum months a payment must cover.
    Discount,
}

/// One row of a ledger events file: `type, org, unit, amount, date`. An
/// optional `category` column names the expense category; optional
/// `discount` and `months` columns attach a discount to a payment.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct LedgerEvent {
    pub r#type: LedgerEventType,
    pub org: OrgId,
    pub unit: Option<UnitId>,
    pub amount: Amount,
    pub date: NaiveDate,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub discount: Option<DiscountId>,
    #[serde(default)]
    pub months: Option<u32>,
}

impl LedgerEvent {
    /// Unit of a unit-scoped event.
    pub fn require_unit(&self) -> Result<UnitId> {
        self.unit.ok_or_else(|| {
            LedgerError::ValidationError(format!("{:?} event requires a unit", self.r#type))
        })
    }

    pub fn require_discount(&self) -> Result<DiscountId> {
        self.discount.ok_or_else(|| {
            LedgerError::ValidationError(format!("{:?} event requires a discount id", self.r#type))
        })
    }
}

/// Streams ledger events from a CSV source, trimming whitespace.
pub struct LedgerReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> LedgerReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: super::reader_builder().from_reader(source),
        }
    }

    pub fn events(self) -> impl Iterator<Item = Result<LedgerEvent>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(LedgerError::from))
    }
}
