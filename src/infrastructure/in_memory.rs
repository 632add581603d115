use crate::domain::asset::Asset;
use crate::domain::credit::{CreditMovement, UnitCredit};
use crate::domain::discount::Discount;
use crate::domain::penalty::PenaltyPolicy;
use crate::domain::ports::{
    BillingConfig, CreditStore, PolicyStore, ReservationStore, StatementStore, Stores,
    TransactionFilter, TransactionStore,
};
use crate::domain::reservation::{
    Reservation, ReservationConfig, ReservationId, ReservationStatus, TimeSlot,
};
use crate::domain::statement::{BillingPeriod, DuesStatement, StatementId};
use crate::domain::transaction::{Transaction, TransactionId};
use crate::domain::{AssetId, DiscountId, OrgId, UnitId};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for ledger transactions.
///
/// Uses `Arc<RwLock<HashMap<..>>>` to allow shared concurrent access.
/// Ideal for testing or one-shot CLI runs where persistence is not required.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<TransactionId, Transaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn store(&self, tx: Transaction) -> Result<()> {
        let mut transactions = self.transactions.write().await;
        transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(&tx_id).cloned())
    }

    async fn list(&self, org_id: OrgId, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let transactions = self.transactions.read().await;
        let matching = transactions
            .values()
            .filter(|tx| tx.org_id == org_id && filter.matches(tx))
            .cloned()
            .collect();
        Ok(filter.finish(matching))
    }
}

/// In-memory dues statements.
#[derive(Default, Clone)]
pub struct InMemoryStatementStore {
    statements: Arc<RwLock<HashMap<StatementId, DuesStatement>>>,
}

impl InMemoryStatementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatementStore for InMemoryStatementStore {
    async fn store(&self, statement: DuesStatement) -> Result<()> {
        let mut statements = self.statements.write().await;
        statements.insert(statement.id, statement);
        Ok(())
    }

    async fn get(&self, id: StatementId) -> Result<Option<DuesStatement>> {
        let statements = self.statements.read().await;
        Ok(statements.get(&id).cloned())
    }

    async fn for_period(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        period: BillingPeriod,
    ) -> Result<Option<DuesStatement>> {
        let statements = self.statements.read().await;
        Ok(statements
            .values()
            .find(|s| s.org_id == org_id && s.unit_id == unit_id && s.period == period)
            .cloned())
    }

    async fn open_for_unit(&self, org_id: OrgId, unit_id: UnitId) -> Result<Vec<DuesStatement>> {
        let statements = self.statements.read().await;
        let mut open: Vec<DuesStatement> = statements
            .values()
            .filter(|s| s.org_id == org_id && s.unit_id == unit_id && s.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|s| s.period);
        Ok(open)
    }

    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<DuesStatement>> {
        let statements = self.statements.read().await;
        Ok(statements
            .values()
            .filter(|s| s.org_id == org_id)
            .cloned()
            .collect())
    }
}

/// In-memory unit credit, keyed by organization and unit. `apply` runs
/// under the write lock.
#[derive(Default, Clone)]
pub struct InMemoryCreditStore {
    credits: Arc<RwLock<HashMap<(OrgId, UnitId), UnitCredit>>>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn get(&self, org_id: OrgId, unit_id: UnitId) -> Result<Option<UnitCredit>> {
        let credits = self.credits.read().await;
        Ok(credits.get(&(org_id, unit_id)).cloned())
    }

    async fn apply(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        movement: CreditMovement,
    ) -> Result<UnitCredit> {
        let mut credits = self.credits.write().await;
        let mut credit = credits
            .get(&(org_id, unit_id))
            .cloned()
            .unwrap_or_else(|| UnitCredit::new(org_id, unit_id));
        credit.apply(movement)?;
        credits.insert((org_id, unit_id), credit.clone());
        Ok(credit)
    }

    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<UnitCredit>> {
        let credits = self.credits.read().await;
        Ok(credits
            .values()
            .filter(|c| c.org_id == org_id)
            .cloned()
            .collect())
    }
}

/// In-memory reservations. The overlap check and the insert share the write
/// lock, so two overlapping requests cannot both succeed.
#[derive(Default, Clone)]
pub struct InMemoryReservationStore {
    reservations: Arc<RwLock<HashMap<ReservationId, Reservation>>>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn insert_if_available(&self, reservation: Reservation) -> Result<()> {
        let mut reservations = self.reservations.write().await;
        if reservations
            .values()
            .any(|existing| existing.conflicts_with(&reservation))
        {
            return Err(LedgerError::SlotUnavailable {
                asset: reservation.asset_id,
            });
        }
        reservations.insert(reservation.id, reservation);
        Ok(())
    }

    async fn update(&self, reservation: Reservation) -> Result<()> {
        let mut reservations = self.reservations.write().await;
        if !reservations.contains_key(&reservation.id) {
            return Err(LedgerError::not_found("Reservation", reservation.id));
        }
        reservations.insert(reservation.id, reservation);
        Ok(())
    }

    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>> {
        let reservations = self.reservations.read().await;
        Ok(reservations.get(&id).cloned())
    }

    async fn blocking(&self, asset_id: AssetId, window: TimeSlot) -> Result<Vec<Reservation>> {
        let reservations = self.reservations.read().await;
        let mut blocking: Vec<Reservation> = reservations
            .values()
            .filter(|r| {
                r.asset_id == asset_id && r.status.blocks_slot() && r.slot.overlaps(&window)
            })
            .cloned()
            .collect();
        blocking.sort_by_key(|r| r.slot.start);
        Ok(blocking)
    }

    async fn expirable(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let reservations = self.reservations.read().await;
        Ok(reservations
            .values()
            .filter(|r| {
                r.status == ReservationStatus::PendingPayment
                    && r.is_past_deadline(now)
            })
            .cloned()
            .collect())
    }

    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<Reservation>> {
        let reservations = self.reservations.read().await;
        Ok(reservations
            .values()
            .filter(|r| r.org_id == org_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct PolicyTables {
    billing: HashMap<OrgId, BillingConfig>,
    penalties: HashMap<OrgId, PenaltyPolicy>,
    reservations: HashMap<OrgId, ReservationConfig>,
    discounts: HashMap<DiscountId, Discount>,
    assets: HashMap<AssetId, Asset>,
}

/// In-memory organization configuration.
#[derive(Default, Clone)]
pub struct InMemoryPolicyStore {
    tables: Arc<RwLock<PolicyTables>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn put_billing_config(&self, config: BillingConfig) -> Result<()> {
        self.tables.write().await.billing.insert(config.org_id, config);
        Ok(())
    }

    async fn billing_config(&self, org_id: OrgId) -> Result<Option<BillingConfig>> {
        Ok(self.tables.read().await.billing.get(&org_id).cloned())
    }

    async fn put_penalty_policy(&self, policy: PenaltyPolicy) -> Result<()> {
        self.tables.write().await.penalties.insert(policy.org_id, policy);
        Ok(())
    }

    async fn penalty_policy(&self, org_id: OrgId) -> Result<Option<PenaltyPolicy>> {
        Ok(self.tables.read().await.penalties.get(&org_id).cloned())
    }

    async fn put_reservation_config(&self, config: ReservationConfig) -> Result<()> {
        self.tables
            .write()
            .await
            .reservations
            .insert(config.org_id, config);
        Ok(())
    }

    async fn reservation_config(&self, org_id: OrgId) -> Result<Option<ReservationConfig>> {
        Ok(self.tables.read().await.reservations.get(&org_id).cloned())
    }

    async fn put_discount(&self, discount: Discount) -> Result<()> {
        self.tables.write().await.discounts.insert(discount.id, discount);
        Ok(())
    }

    async fn discounts(&self, org_id: OrgId) -> Result<Vec<Discount>> {
        let tables = self.tables.read().await;
        let mut discounts: Vec<Discount> = tables
            .discounts
            .values()
            .filter(|d| d.org_id == org_id)
            .cloned()
            .collect();
        discounts.sort_by_key(|d| d.id);
        Ok(discounts)
    }

    async fn put_asset(&self, asset: Asset) -> Result<()> {
        self.tables.write().await.assets.insert(asset.id, asset);
        Ok(())
    }

    async fn asset(&self, asset_id: AssetId) -> Result<Option<Asset>> {
        Ok(self.tables.read().await.assets.get(&asset_id).cloned())
    }
}

impl Stores {
    /// A fresh set of in-memory stores.
    pub fn in_memory() -> Self {
        Self {
            transactions: Arc::new(InMemoryTransactionStore::new()),
            statements: Arc::new(InMemoryStatementStore::new()),
            credits: Arc::new(InMemoryCreditStore::new()),
            reservations: Arc::new(InMemoryReservationStore::new()),
            policies: Arc::new(InMemoryPolicyStore::new()),
        }
    }
}
