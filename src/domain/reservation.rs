//! Reservation lifecycle.
//!
//! ```text
//! PendingPayment --payment covers total--> Confirmed --slot over--> Completed
//!       |                                      |
//!       +--deadline passed--> Expired          |
//!       +--cancel----------> Cancelled <-------+
//! ```
//!
//! `Expired`, `Cancelled` and `Completed` are terminal. A confirmed
//! reservation has no deadline and can never expire.

use super::money::Amount;
use super::transaction::TransactionId;
use super::{AssetId, DiscountId, OrgId, UnitId, UserId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type ReservationId = Uuid;

/// Hours an unpaid homeowner reservation is held when the organization has
/// not configured its own value.
pub const DEFAULT_EXPIRATION_HOURS: u32 = 48;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    PendingPayment,
    Confirmed,
    Completed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }

    /// Whether a reservation in this state holds its time slot.
    pub fn blocks_slot(&self) -> bool {
        matches!(self, Self::PendingPayment | Self::Confirmed)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::PendingPayment => "pending_payment",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unpaid => "unpaid",
            Self::Partial => "partial",
            Self::Paid => "paid",
        };
        f.write_str(label)
    }
}

/// Half-open booking interval `[start, end)`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct TimeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSlot {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(LedgerError::ValidationError(
                "Reservation must end after it starts".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    /// Back-to-back slots do not overlap.
    pub fn overlaps(&self, other: &TimeSlot) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn whole_hours(&self) -> i64 {
        (self.end - self.start).num_hours()
    }
}

/// Price breakdown persisted with the reservation.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ReservationPricing {
    pub hourly_rate: Decimal,
    pub hours: u32,
    pub subtotal: Decimal,
    pub discount_id: Option<DiscountId>,
    pub discount_amount: Decimal,
    pub deposit_amount: Decimal,
    pub total_amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Requester {
    pub user_id: UserId,
    pub name: String,
    pub unit_id: Option<UnitId>,
}

/// Organization-level booking rules.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ReservationConfig {
    pub org_id: OrgId,
    /// Hours until an unpaid homeowner reservation expires. Zero disables
    /// expiration.
    pub expiration_hours: u32,
    pub allow_same_day_booking: bool,
    pub min_advance_hours: u32,
}

impl ReservationConfig {
    pub fn new(org_id: OrgId) -> Self {
        Self {
            org_id,
            expiration_hours: DEFAULT_EXPIRATION_HOURS,
            allow_same_day_booking: true,
            min_advance_hours: 0,
        }
    }

    pub fn with_expiration_hours(mut self, hours: u32) -> Self {
        self.expiration_hours = hours;
        self
    }

    pub fn deadline_from(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.expiration_hours > 0)
            .then(|| created_at + Duration::hours(i64::from(self.expiration_hours)))
    }

    /// Checks advance-notice and same-day rules for a booking made at `now`.
    pub fn check_booking_window(&self, slot: &TimeSlot, now: DateTime<Utc>) -> Result<()> {
        if slot.start < now {
            return Err(LedgerError::ValidationError(
                "Cannot reserve a slot in the past".to_string(),
            ));
        }
        if !self.allow_same_day_booking && slot.start.date_naive() == now.date_naive() {
            return Err(LedgerError::ValidationError(
                "Same-day reservations are not allowed".to_string(),
            ));
        }
        if slot.start < now + Duration::hours(i64::from(self.min_advance_hours)) {
            return Err(LedgerError::ValidationError(format!(
                "Reservations must be made at least {} hours in advance",
                self.min_advance_hours
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub org_id: OrgId,
    pub asset_id: AssetId,
    pub requester: Requester,
    pub purpose: String,
    pub slot: TimeSlot,
    pub pricing: ReservationPricing,
    pub amount_paid: Decimal,
    pub status: ReservationStatus,
    pub payment_status: PaymentStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub income_transaction_id: Option<TransactionId>,
    pub cancelled_by: Option<UserId>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// A homeowner booking: held unpaid until `expires_at`, unless there is
    /// nothing to pay.
    pub fn pending(
        org_id: OrgId,
        asset_id: AssetId,
        requester: Requester,
        slot: TimeSlot,
        pricing: ReservationPricing,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut reservation = Self::build(org_id, asset_id, requester, slot, pricing, now);
        if reservation.pricing.total_amount <= Decimal::ZERO {
            reservation.status = ReservationStatus::Confirmed;
            reservation.payment_status = PaymentStatus::Paid;
        } else {
            reservation.expires_at = expires_at;
        }
        reservation
    }

    /// A staff/board booking: confirmed immediately, never expires.
    pub fn confirmed(
        org_id: OrgId,
        asset_id: AssetId,
        requester: Requester,
        slot: TimeSlot,
        pricing: ReservationPricing,
        now: DateTime<Utc>,
    ) -> Self {
        let mut reservation = Self::build(org_id, asset_id, requester, slot, pricing, now);
        reservation.status = ReservationStatus::Confirmed;
        if reservation.pricing.total_amount <= Decimal::ZERO {
            reservation.payment_status = PaymentStatus::Paid;
        }
        reservation
    }

    fn build(
        org_id: OrgId,
        asset_id: AssetId,
        requester: Requester,
        slot: TimeSlot,
        pricing: ReservationPricing,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            asset_id,
            requester,
            purpose: String::new(),
            slot,
            pricing,
            amount_paid: Decimal::ZERO,
            status: ReservationStatus::PendingPayment,
            payment_status: PaymentStatus::Unpaid,
            expires_at: None,
            income_transaction_id: None,
            cancelled_by: None,
            cancelled_at: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn balance_due(&self) -> Decimal {
        (self.pricing.total_amount - self.amount_paid).max(Decimal::ZERO)
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now > deadline)
    }

    pub fn conflicts_with(&self, other: &Reservation) -> bool {
        self.asset_id == other.asset_id
            && self.id != other.id
            && self.status.blocks_slot()
            && other.status.blocks_slot()
            && self.slot.overlaps(&other.slot)
    }

    /// Records a staff-received payment. Covering the total confirms a
    /// pending reservation and clears its deadline. Paying more than the
    /// balance due is refused.
    pub fn record_payment(&mut self, amount: Amount, at: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("record a payment"));
        }
        if self.status == ReservationStatus::PendingPayment && self.is_past_deadline(at) {
            return Err(LedgerError::InvalidTransition {
                action: "record a payment",
                status: "past the payment deadline".to_string(),
            });
        }
        let due = self.balance_due();
        if amount.value() > due {
            return Err(LedgerError::Overcollection {
                due,
                received: amount.value(),
            });
        }

        self.amount_paid += amount.value();
        if self.amount_paid >= self.pricing.total_amount {
            self.payment_status = PaymentStatus::Paid;
            self.status = ReservationStatus::Confirmed;
            self.expires_at = None;
        } else {
            self.payment_status = PaymentStatus::Partial;
        }
        self.updated_at = at;
        Ok(())
    }

    pub fn cancel(&mut self, by: UserId, reason: &str, at: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid("cancel"));
        }
        self.status = ReservationStatus::Cancelled;
        self.cancelled_by = Some(by);
        self.cancelled_at = Some(at);
        self.cancellation_reason = (!reason.is_empty()).then(|| reason.to_string());
        self.expires_at = None;
        self.updated_at = at;
        Ok(())
    }

    /// Confirmed -> Completed, once the slot is over.
    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != ReservationStatus::Confirmed {
            return Err(self.invalid("complete"));
        }
        if at < self.slot.end {
            return Err(LedgerError::ValidationError(
                "Reservation cannot be completed before its slot ends".to_string(),
            ));
        }
        self.status = ReservationStatus::Completed;
        self.updated_at = at;
        Ok(())
    }

    /// Expires an unpaid reservation whose deadline is strictly before `now`.
    ///
    /// Returns whether the status changed. Calling it on any other
    /// reservation, terminal ones included, is a no-op.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != ReservationStatus::PendingPayment || !self.is_past_deadline(now) {
            return false;
        }
        self.status = ReservationStatus::Expired;
        self.updated_at = now;
        true
    }

    fn invalid(&self, action: &'static str) -> LedgerError {
        LedgerError::InvalidTransition {
            action,
            status: self.status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
    }

    fn pricing(total: Decimal) -> ReservationPricing {
        ReservationPricing {
            hourly_rate: total,
            hours: 1,
            subtotal: total,
            discount_id: None,
            discount_amount: Decimal::ZERO,
            deposit_amount: Decimal::ZERO,
            total_amount: total,
        }
    }

    fn requester() -> Requester {
        Requester {
            user_id: 42,
            name: "Dela Cruz".to_string(),
            unit_id: Some(7),
        }
    }

    fn pending(total: Decimal) -> Reservation {
        let created = at(1, 9);
        let config = ReservationConfig::new(1);
        Reservation::pending(
            1,
            3,
            requester(),
            TimeSlot::new(at(10, 10), at(10, 12)).unwrap(),
            pricing(total),
            config.deadline_from(created),
            created,
        )
    }

    #[test]
    fn test_default_deadline_is_48_hours() {
        let reservation = pending(dec!(500));
        assert_eq!(reservation.status, ReservationStatus::PendingPayment);
        assert_eq!(reservation.expires_at, Some(at(3, 9)));
    }

    #[test]
    fn test_zero_expiration_hours_never_expires() {
        let config = ReservationConfig::new(1).with_expiration_hours(0);
        assert_eq!(config.deadline_from(at(1, 9)), None);
    }

    #[test]
    fn test_slot_overlap() {
        let a = TimeSlot::new(at(10, 10), at(10, 12)).unwrap();
        let b = TimeSlot::new(at(10, 11), at(10, 13)).unwrap();
        let c = TimeSlot::new(at(10, 12), at(10, 14)).unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(TimeSlot::new(at(10, 12), at(10, 12)).is_err());
    }

    #[test]
    fn test_expire_only_after_deadline() {
        let mut reservation = pending(dec!(500));
        assert!(!reservation.expire(at(3, 9)));
        assert_eq!(reservation.status, ReservationStatus::PendingPayment);
        assert!(reservation.expire(at(3, 10)));
        assert_eq!(reservation.status, ReservationStatus::Expired);
    }

    #[test]
    fn test_expire_is_idempotent() {
        let mut reservation = pending(dec!(500));
        assert!(reservation.expire(at(4, 0)));
        assert!(!reservation.expire(at(5, 0)));
        assert_eq!(reservation.status, ReservationStatus::Expired);
    }

    #[test]
    fn test_confirmed_never_expires() {
        let mut reservation = pending(dec!(500));
        reservation
            .record_payment(Amount::new(dec!(500)).unwrap(), at(2, 9))
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert_eq!(reservation.expires_at, None);
        for day in 3..=30 {
            assert!(!reservation.expire(at(day, 0)));
        }
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
    }

    #[test]
    fn test_partial_payment_keeps_deadline() {
        let mut reservation = pending(dec!(500));
        reservation
            .record_payment(Amount::new(dec!(200)).unwrap(), at(2, 9))
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::PendingPayment);
        assert_eq!(reservation.payment_status, PaymentStatus::Partial);
        assert_eq!(reservation.balance_due(), dec!(300));
        assert!(reservation.expire(at(4, 0)));
    }

    #[test]
    fn test_payment_after_deadline_is_rejected() {
        let mut reservation = pending(dec!(500));
        let result = reservation.record_payment(Amount::new(dec!(500)).unwrap(), at(3, 10));
        assert!(matches!(result, Err(LedgerError::InvalidTransition { .. })));
        assert_eq!(reservation.amount_paid, Decimal::ZERO);
    }

    #[test]
    fn test_overpayment_is_rejected() {
        let mut reservation = pending(dec!(500));
        let result = reservation.record_payment(Amount::new(dec!(600)).unwrap(), at(2, 9));
        assert!(matches!(result, Err(LedgerError::Overcollection { .. })));
        assert_eq!(reservation.status, ReservationStatus::PendingPayment);
    }

    #[test]
    fn test_payment_on_terminal_reservation_is_rejected() {
        let mut reservation = pending(dec!(500));
        reservation.cancel(1, "changed plans", at(2, 0)).unwrap();
        assert!(
            reservation
                .record_payment(Amount::new(dec!(500)).unwrap(), at(2, 1))
                .is_err()
        );
        assert_eq!(
            reservation.cancellation_reason.as_deref(),
            Some("changed plans")
        );
    }

    #[test]
    fn test_complete_after_slot() {
        let mut reservation = pending(dec!(500));
        assert!(reservation.complete(at(10, 13)).is_err());
        reservation
            .record_payment(Amount::new(dec!(500)).unwrap(), at(2, 0))
            .unwrap();
        assert!(reservation.complete(at(10, 11)).is_err());
        reservation.complete(at(10, 12)).unwrap();
        assert_eq!(reservation.status, ReservationStatus::Completed);
        assert!(reservation.cancel(1, "", at(11, 0)).is_err());
    }

    #[test]
    fn test_free_booking_confirms_immediately() {
        let reservation = pending(Decimal::ZERO);
        assert_eq!(reservation.status, ReservationStatus::Confirmed);
        assert_eq!(reservation.expires_at, None);
    }

    #[test]
    fn test_booking_window_rules() {
        let mut config = ReservationConfig::new(1);
        config.allow_same_day_booking = false;
        config.min_advance_hours = 24;

        let now = at(10, 8);
        let same_day = TimeSlot::new(at(10, 18), at(10, 20)).unwrap();
        let tomorrow_early = TimeSlot::new(at(11, 6), at(11, 8)).unwrap();
        let later = TimeSlot::new(at(12, 6), at(12, 8)).unwrap();
        let past = TimeSlot::new(at(9, 6), at(9, 8)).unwrap();

        assert!(config.check_booking_window(&same_day, now).is_err());
        assert!(config.check_booking_window(&tomorrow_early, now).is_err());
        assert!(config.check_booking_window(&later, now).is_ok());
        assert!(config.check_booking_window(&past, now).is_err());
    }
}
