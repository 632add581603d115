use super::ledger::LedgerService;
use crate::domain::asset::Asset;
use crate::domain::money::Amount;
use crate::domain::reservation::{
    Requester, Reservation, ReservationConfig, ReservationId, ReservationPricing,
    ReservationStatus, TimeSlot,
};
use crate::domain::transaction::{Transaction, TransactionType};
use crate::domain::{AssetId, DiscountId, OrgId, UserId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const RENTAL_CATEGORY: &str = "Rental Income";

/// Who is booking. Homeowner bookings wait for payment; staff bookings are
/// confirmed on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingChannel {
    Homeowner,
    Staff,
}

#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub org_id: OrgId,
    pub asset_id: AssetId,
    pub requester: Requester,
    pub slot: TimeSlot,
    pub purpose: String,
    pub discount_id: Option<DiscountId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub failed: usize,
}

/// Books assets and moves reservations through their lifecycle.
///
/// Slot conflicts are checked by the store when a reservation is inserted.
/// Payments, cancellations, completions and expirations of existing
/// reservations are serialized here, so an expiration sweep always sees the
/// latest state of a reservation and never overwrites a payment.
pub struct ReservationService {
    ledger: Arc<LedgerService>,
    default_expiration_hours: u32,
    write_guard: Mutex<()>,
}

impl ReservationService {
    pub fn new(ledger: Arc<LedgerService>, default_expiration_hours: u32) -> Self {
        Self {
            ledger,
            default_expiration_hours,
            write_guard: Mutex::new(()),
        }
    }

    pub async fn configure(&self, config: ReservationConfig) -> Result<()> {
        self.ledger.stores().policies.put_reservation_config(config).await
    }

    /// The organization's booking rules, or the defaults.
    pub async fn config_for(&self, org_id: OrgId) -> Result<ReservationConfig> {
        Ok(self
            .ledger
            .stores()
            .policies
            .reservation_config(org_id)
            .await?
            .unwrap_or_else(|| {
                ReservationConfig::new(org_id).with_expiration_hours(self.default_expiration_hours)
            }))
    }

    pub async fn register_asset(&self, asset: Asset) -> Result<()> {
        info!(asset = asset.id, org = asset.org_id, name = %asset.name, "asset registered");
        self.ledger.stores().policies.put_asset(asset).await
    }

    async fn asset(&self, org_id: OrgId, asset_id: AssetId) -> Result<Asset> {
        self.ledger
            .stores()
            .policies
            .asset(asset_id)
            .await?
            .filter(|a| a.org_id == org_id)
            .ok_or_else(|| LedgerError::not_found("Asset", asset_id))
    }

    /// Prices a booking without making it.
    pub async fn quote(&self, request: &ReservationRequest, now: DateTime<Utc>) -> Result<ReservationPricing> {
        let asset = self.asset(request.org_id, request.asset_id).await?;
        let discount = match request.discount_id {
            Some(discount_id) => {
                let discounts = self.ledger.stores().policies.discounts(request.org_id).await?;
                let discount = discounts
                    .into_iter()
                    .find(|d| d.id == discount_id)
                    .ok_or_else(|| LedgerError::not_found("Discount", discount_id))?;
                if !discount.covers_category(Some(RENTAL_CATEGORY)) {
                    return Err(LedgerError::ValidationError(format!(
                        "Discount {discount_id} does not apply to reservations"
                    )));
                }
                Some(discount)
            }
            None => None,
        };
        asset.quote(&request.slot, discount.as_ref(), now.date_naive())
    }

    /// Books a slot. Fails with `SlotUnavailable` when a pending or confirmed
    /// reservation of the same asset overlaps it.
    pub async fn create(
        &self,
        request: ReservationRequest,
        channel: BookingChannel,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let config = self.config_for(request.org_id).await?;
        if channel == BookingChannel::Homeowner {
            config.check_booking_window(&request.slot, now)?;
        }
        let pricing = self.quote(&request, now).await?;

        let mut reservation = match channel {
            BookingChannel::Homeowner => Reservation::pending(
                request.org_id,
                request.asset_id,
                request.requester,
                request.slot,
                pricing,
                config.deadline_from(now),
                now,
            ),
            BookingChannel::Staff => Reservation::confirmed(
                request.org_id,
                request.asset_id,
                request.requester,
                request.slot,
                pricing,
                now,
            ),
        };
        reservation.purpose = request.purpose;

        self.ledger
            .stores()
            .reservations
            .insert_if_available(reservation.clone())
            .await?;
        info!(
            reservation = %reservation.id,
            asset = reservation.asset_id,
            status = %reservation.status,
            total = %reservation.pricing.total_amount,
            expires_at = ?reservation.expires_at,
            "reservation created"
        );
        Ok(reservation)
    }

    pub async fn get(&self, id: ReservationId) -> Result<Reservation> {
        self.ledger
            .stores()
            .reservations
            .get(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Reservation", id))
    }

    /// Reservations holding any part of `window` on the asset.
    pub async fn availability(&self, asset_id: AssetId, window: TimeSlot) -> Result<Vec<Reservation>> {
        self.ledger.stores().reservations.blocking(asset_id, window).await
    }

    pub async fn list(&self, org_id: OrgId, status: Option<ReservationStatus>) -> Result<Vec<Reservation>> {
        let mut reservations: Vec<Reservation> = self
            .ledger
            .stores()
            .reservations
            .all_for_org(org_id)
            .await?
            .into_iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect();
        reservations.sort_by(|a, b| a.slot.start.cmp(&b.slot.start).then(a.created_at.cmp(&b.created_at)));
        Ok(reservations)
    }

    /// Records a payment received by staff and posts it as rental income.
    ///
    /// The reservation is saved before the income is posted; if posting
    /// fails it is put back as it was.
    pub async fn record_payment(
        &self,
        id: ReservationId,
        amount: Amount,
        recorded_by: UserId,
        reference_number: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let _guard = self.write_guard.lock().await;
        let before = self.get(id).await?;
        let mut reservation = before.clone();
        reservation.record_payment(amount, now)?;

        let mut tx = Transaction::new(
            reservation.org_id,
            TransactionType::Income,
            amount,
            RENTAL_CATEGORY,
            now.date_naive(),
            now,
        );
        tx.asset_id = Some(reservation.asset_id);
        tx.payer_name = Some(reservation.requester.name.clone());
        tx.reference_number = reference_number;
        tx.created_by = Some(recorded_by);
        tx.description = format!("Payment for reservation {}", reservation.id);
        let tx = LedgerService::approve_system_income(tx, now)?;
        reservation.income_transaction_id = Some(tx.id);

        let reservations = &self.ledger.stores().reservations;
        reservations.update(reservation.clone()).await?;
        if let Err(err) = self.ledger.post_system_income(&tx).await {
            if let Err(restore) = reservations.update(before).await {
                error!(reservation = %id, error = %restore, "failed to restore reservation");
            }
            return Err(err);
        }
        info!(
            reservation = %reservation.id,
            amount = %amount,
            status = %reservation.status,
            payment = %reservation.payment_status,
            "reservation payment recorded"
        );
        Ok(reservation)
    }

    pub async fn cancel(
        &self,
        id: ReservationId,
        cancelled_by: UserId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let _guard = self.write_guard.lock().await;
        let mut reservation = self.get(id).await?;
        reservation.cancel(cancelled_by, reason, now)?;
        self.ledger.stores().reservations.update(reservation.clone()).await?;
        info!(reservation = %reservation.id, cancelled_by, "reservation cancelled");
        Ok(reservation)
    }

    pub async fn complete(&self, id: ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        let _guard = self.write_guard.lock().await;
        let mut reservation = self.get(id).await?;
        reservation.complete(now)?;
        self.ledger.stores().reservations.update(reservation.clone()).await?;
        info!(reservation = %reservation.id, "reservation completed");
        Ok(reservation)
    }

    /// Expires every unpaid reservation whose deadline is before `now`.
    ///
    /// Safe to run repeatedly and concurrently with payments. A failure on
    /// one reservation is logged and the sweep moves on.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let candidates = self.ledger.stores().reservations.expirable(now).await?;
        let mut report = SweepReport::default();
        for candidate in candidates {
            match self.expire_one(candidate.id, now).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(reservation = %candidate.id, error = %e, "failed to expire reservation");
                    report.failed += 1;
                }
            }
        }
        if report.expired > 0 || report.failed > 0 {
            info!(expired = report.expired, failed = report.failed, "expiration sweep finished");
        }
        Ok(report)
    }

    async fn expire_one(&self, id: ReservationId, now: DateTime<Utc>) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        let mut reservation = self.get(id).await?;
        if !reservation.expire(now) {
            return Ok(false);
        }
        self.ledger.stores().reservations.update(reservation.clone()).await?;
        warn!(
            reservation = %reservation.id,
            asset = reservation.asset_id,
            deadline = ?reservation.expires_at,
            "reservation expired unpaid"
        );
        Ok(true)
    }
}
