use super::discount::Discount;
use super::reservation::{ReservationPricing, TimeSlot};
use super::{AssetId, OrgId};
use crate::error::{LedgerError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Rented out at an hourly rate.
    Revenue,
    /// Shared infrastructure, free to book.
    Shared,
}

/// A bookable facility (clubhouse, pool, court).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Asset {
    pub id: AssetId,
    pub org_id: OrgId,
    pub name: String,
    pub kind: AssetKind,
    pub hourly_rate: Option<Decimal>,
    pub capacity: Option<u32>,
    pub deposit_amount: Option<Decimal>,
    pub min_duration_hours: u32,
    pub max_duration_hours: u32,
    pub active: bool,
}

impl Asset {
    pub fn new(id: AssetId, org_id: OrgId, name: impl Into<String>) -> Self {
        Self {
            id,
            org_id,
            name: name.into(),
            kind: AssetKind::Shared,
            hourly_rate: None,
            capacity: None,
            deposit_amount: None,
            min_duration_hours: 1,
            max_duration_hours: 24,
            active: true,
        }
    }

    pub fn with_hourly_rate(mut self, rate: Decimal) -> Self {
        self.kind = AssetKind::Revenue;
        self.hourly_rate = Some(rate);
        self
    }

    pub fn with_deposit(mut self, deposit: Decimal) -> Self {
        self.deposit_amount = Some(deposit);
        self
    }

    pub fn with_duration_bounds(mut self, min_hours: u32, max_hours: u32) -> Self {
        self.min_duration_hours = min_hours;
        self.max_duration_hours = max_hours;
        self
    }

    /// Soft-deletes the asset. Existing reservations are kept.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Prices a booking of `slot`, optionally with one discount.
    pub fn quote(
        &self,
        slot: &TimeSlot,
        discount: Option<&Discount>,
        on: NaiveDate,
    ) -> Result<ReservationPricing> {
        if !self.active {
            return Err(LedgerError::ValidationError(format!(
                "Asset {} is not available for booking",
                self.id
            )));
        }
        let hours = slot.whole_hours();
        if hours < i64::from(self.min_duration_hours) {
            return Err(LedgerError::ValidationError(format!(
                "Minimum reservation is {} hours",
                self.min_duration_hours
            )));
        }
        if hours > i64::from(self.max_duration_hours) {
            return Err(LedgerError::ValidationError(format!(
                "Maximum reservation is {} hours",
                self.max_duration_hours
            )));
        }

        let hourly_rate = self.hourly_rate.unwrap_or(Decimal::ZERO);
        let subtotal = hourly_rate * Decimal::from(hours);
        let (discount_id, discount_amount) = match discount {
            Some(discount) => {
                let applied = discount.apply(subtotal, 1, on)?;
                (Some(applied.discount_id), applied.reduction)
            }
            None => (None, Decimal::ZERO),
        };
        let deposit_amount = self.deposit_amount.unwrap_or(Decimal::ZERO);

        Ok(ReservationPricing {
            hourly_rate,
            hours: hours as u32,
            subtotal,
            discount_id,
            discount_amount,
            deposit_amount,
            total_amount: subtotal - discount_amount + deposit_amount,
        })
    }
}
