//! Storage ports.
//!
//! The application layer only talks to storage through these traits. Every
//! adapter must make `CreditStore::apply` and
//! `ReservationStore::insert_if_available` atomic: the check and the write
//! happen under one lock (or one database transaction).

use super::asset::Asset;
use super::credit::{CreditMovement, UnitCredit};
use super::discount::Discount;
use super::penalty::PenaltyPolicy;
use super::reservation::{Reservation, ReservationConfig, ReservationId, TimeSlot};
use super::statement::{BillingPeriod, DuesStatement, StatementId};
use super::transaction::{Transaction, TransactionId, TransactionStatus, TransactionType};
use super::{AssetId, OrgId, UnitId};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Filter for listing transactions. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub r#type: Option<TransactionType>,
    pub status: Option<TransactionStatus>,
    pub unit_id: Option<UnitId>,
    pub category: Option<String>,
    pub limit: Option<usize>,
}

impl TransactionFilter {
    pub fn matches(&self, tx: &Transaction) -> bool {
        self.start_date.is_none_or(|d| tx.transaction_date >= d)
            && self.end_date.is_none_or(|d| tx.transaction_date <= d)
            && self.r#type.is_none_or(|t| tx.r#type == t)
            && self.status.is_none_or(|s| tx.status == s)
            && self.unit_id.is_none_or(|u| tx.unit_id == Some(u))
            && self
                .category
                .as_deref()
                .is_none_or(|c| tx.category.eq_ignore_ascii_case(c))
    }

    /// Sorts newest first and applies the limit.
    pub fn finish(&self, mut txs: Vec<Transaction>) -> Vec<Transaction> {
        txs.sort_by(|a, b| {
            b.transaction_date
                .cmp(&a.transaction_date)
                .then(b.created_at.cmp(&a.created_at))
        });
        if let Some(limit) = self.limit {
            txs.truncate(limit);
        }
        txs
    }
}

/// Organization-level billing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingConfig {
    pub org_id: OrgId,
    pub monthly_dues: Decimal,
    /// Day of month statements fall due, 1..=28 so it exists every month.
    pub billing_day: u32,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn store(&self, tx: Transaction) -> Result<()>;
    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>>;
    async fn list(&self, org_id: OrgId, filter: &TransactionFilter) -> Result<Vec<Transaction>>;
}

#[async_trait]
pub trait StatementStore: Send + Sync {
    async fn store(&self, statement: DuesStatement) -> Result<()>;
    async fn get(&self, id: StatementId) -> Result<Option<DuesStatement>>;
    async fn for_period(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        period: BillingPeriod,
    ) -> Result<Option<DuesStatement>>;
    /// Unpaid and partially paid statements of a unit, oldest period first.
    async fn open_for_unit(&self, org_id: OrgId, unit_id: UnitId) -> Result<Vec<DuesStatement>>;
    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<DuesStatement>>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Unit ids repeat across organizations, so credit is keyed by both.
    async fn get(&self, org_id: OrgId, unit_id: UnitId) -> Result<Option<UnitCredit>>;
    /// Loads (or creates) the unit's credit, applies the movement and stores
    /// the result as one atomic step.
    async fn apply(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        movement: CreditMovement,
    ) -> Result<UnitCredit>;
    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<UnitCredit>>;
}

#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Inserts the reservation unless a slot-blocking reservation of the same
    /// asset overlaps it. Fails with `SlotUnavailable` otherwise.
    async fn insert_if_available(&self, reservation: Reservation) -> Result<()>;
    /// Replaces an existing reservation.
    async fn update(&self, reservation: Reservation) -> Result<()>;
    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>>;
    /// Slot-blocking reservations of an asset overlapping `window`, by start.
    async fn blocking(&self, asset_id: AssetId, window: TimeSlot) -> Result<Vec<Reservation>>;
    /// Pending reservations whose deadline is before `now`.
    async fn expirable(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>>;
    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<Reservation>>;
}

/// Organization configuration: policies, discounts and the asset catalog.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn put_billing_config(&self, config: BillingConfig) -> Result<()>;
    async fn billing_config(&self, org_id: OrgId) -> Result<Option<BillingConfig>>;
    async fn put_penalty_policy(&self, policy: PenaltyPolicy) -> Result<()>;
    async fn penalty_policy(&self, org_id: OrgId) -> Result<Option<PenaltyPolicy>>;
    async fn put_reservation_config(&self, config: ReservationConfig) -> Result<()>;
    async fn reservation_config(&self, org_id: OrgId) -> Result<Option<ReservationConfig>>;
    async fn put_discount(&self, discount: Discount) -> Result<()>;
    async fn discounts(&self, org_id: OrgId) -> Result<Vec<Discount>>;
    async fn put_asset(&self, asset: Asset) -> Result<()>;
    async fn asset(&self, asset_id: AssetId) -> Result<Option<Asset>>;
}

pub type TransactionStoreRef = Arc<dyn TransactionStore>;
pub type StatementStoreRef = Arc<dyn StatementStore>;
pub type CreditStoreRef = Arc<dyn CreditStore>;
pub type ReservationStoreRef = Arc<dyn ReservationStore>;
pub type PolicyStoreRef = Arc<dyn PolicyStore>;

/// The full set of stores the application services run against.
#[derive(Clone)]
pub struct Stores {
    pub transactions: TransactionStoreRef,
    pub statements: StatementStoreRef,
    pub credits: CreditStoreRef,
    pub reservations: ReservationStoreRef,
    pub policies: PolicyStoreRef,
}
