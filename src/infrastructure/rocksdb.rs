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
use crate::domain::{AssetId, OrgId, UnitId};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_STATEMENTS: &str = "statements";
pub const CF_CREDITS: &str = "credits";
pub const CF_RESERVATIONS: &str = "reservations";
/// Billing configs, penalty policies, reservation configs, discounts and
/// assets, under prefixed string keys.
pub const CF_POLICIES: &str = "policies";

const COLUMN_FAMILIES: [&str; 5] = [
    CF_TRANSACTIONS,
    CF_STATEMENTS,
    CF_CREDITS,
    CF_RESERVATIONS,
    CF_POLICIES,
];

/// A persistent store using RocksDB, one column family per entity.
///
/// Values are JSON. Read-modify-write operations that must be atomic (credit
/// movements, slot-checked inserts) run under a store-wide write lock.
///
/// `Clone` shares the underlying `Arc<DB>` and lock.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a database at `path`, creating missing column
    /// families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// All five ports backed by this database.
    pub fn into_stores(self) -> Stores {
        let store = Arc::new(self);
        Stores {
            transactions: store.clone(),
            statements: store.clone(),
            credits: store.clone(),
            reservations: store.clone(),
            policies: store,
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            LedgerError::InternalError(Box::new(std::io::Error::other(format!(
                "{name} column family not found"
            ))))
        })
    }

    fn put_json<K: AsRef<[u8]>, V: Serialize>(&self, cf: &str, key: K, value: &V) -> Result<()> {
        let bytes = serde_json::to_vec(value).map_err(codec_error)?;
        self.db.put_cf(self.cf(cf)?, key, bytes)?;
        Ok(())
    }

    fn get_json<K: AsRef<[u8]>, V: DeserializeOwned>(&self, cf: &str, key: K) -> Result<Option<V>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(codec_error)?)),
            None => Ok(None),
        }
    }

    /// Decodes every value of a column family whose key starts with `prefix`.
    fn scan_json<V: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<V>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                values.push(serde_json::from_slice(&value).map_err(codec_error)?);
            }
        }
        Ok(values)
    }
}

fn codec_error(e: serde_json::Error) -> LedgerError {
    LedgerError::InternalError(Box::new(e))
}

fn policy_key(kind: &str, id: u32) -> String {
    format!("{kind}/{id:010}")
}

/// Big-endian org id followed by big-endian unit id, so an organization's
/// credits share a key prefix.
fn credit_key(org_id: OrgId, unit_id: UnitId) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&org_id.to_be_bytes());
    key[4..].copy_from_slice(&unit_id.to_be_bytes());
    key
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn store(&self, tx: Transaction) -> Result<()> {
        self.put_json(CF_TRANSACTIONS, tx.id.as_bytes(), &tx)
    }

    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        self.get_json(CF_TRANSACTIONS, tx_id.as_bytes())
    }

    async fn list(&self, org_id: OrgId, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let matching = self
            .scan_json::<Transaction>(CF_TRANSACTIONS, b"")?
            .into_iter()
            .filter(|tx| tx.org_id == org_id && filter.matches(tx))
            .collect();
        Ok(filter.finish(matching))
    }
}

#[async_trait]
impl StatementStore for RocksDBStore {
    async fn store(&self, statement: DuesStatement) -> Result<()> {
        self.put_json(CF_STATEMENTS, statement.id.as_bytes(), &statement)
    }

    async fn get(&self, id: StatementId) -> Result<Option<DuesStatement>> {
        self.get_json(CF_STATEMENTS, id.as_bytes())
    }

    async fn for_period(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        period: BillingPeriod,
    ) -> Result<Option<DuesStatement>> {
        Ok(self
            .scan_json::<DuesStatement>(CF_STATEMENTS, b"")?
            .into_iter()
            .find(|s| s.org_id == org_id && s.unit_id == unit_id && s.period == period))
    }

    async fn open_for_unit(&self, org_id: OrgId, unit_id: UnitId) -> Result<Vec<DuesStatement>> {
        let mut open: Vec<DuesStatement> = self
            .scan_json::<DuesStatement>(CF_STATEMENTS, b"")?
            .into_iter()
            .filter(|s| s.org_id == org_id && s.unit_id == unit_id && s.is_open())
            .collect();
        open.sort_by_key(|s| s.period);
        Ok(open)
    }

    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<DuesStatement>> {
        let mut statements: Vec<DuesStatement> = self
            .scan_json::<DuesStatement>(CF_STATEMENTS, b"")?
            .into_iter()
            .filter(|s| s.org_id == org_id)
            .collect();
        statements.sort_by_key(|s| (s.unit_id, s.period));
        Ok(statements)
    }
}

#[async_trait]
impl CreditStore for RocksDBStore {
    async fn get(&self, org_id: OrgId, unit_id: UnitId) -> Result<Option<UnitCredit>> {
        self.get_json(CF_CREDITS, credit_key(org_id, unit_id))
    }

    async fn apply(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        movement: CreditMovement,
    ) -> Result<UnitCredit> {
        let _guard = self.write_lock.lock().await;
        let mut credit = self
            .get_json::<_, UnitCredit>(CF_CREDITS, credit_key(org_id, unit_id))?
            .unwrap_or_else(|| UnitCredit::new(org_id, unit_id));
        credit.apply(movement)?;
        self.put_json(CF_CREDITS, credit_key(org_id, unit_id), &credit)?;
        Ok(credit)
    }

    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<UnitCredit>> {
        self.scan_json::<UnitCredit>(CF_CREDITS, &org_id.to_be_bytes())
    }
}

#[async_trait]
impl ReservationStore for RocksDBStore {
    async fn insert_if_available(&self, reservation: Reservation) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let existing = self.scan_json::<Reservation>(CF_RESERVATIONS, b"")?;
        if existing.iter().any(|r| r.conflicts_with(&reservation)) {
            return Err(LedgerError::SlotUnavailable {
                asset: reservation.asset_id,
            });
        }
        self.put_json(CF_RESERVATIONS, reservation.id.as_bytes(), &reservation)
    }

    async fn update(&self, reservation: Reservation) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if self
            .get_json::<_, Reservation>(CF_RESERVATIONS, reservation.id.as_bytes())?
            .is_none()
        {
            return Err(LedgerError::not_found("Reservation", reservation.id));
        }
        self.put_json(CF_RESERVATIONS, reservation.id.as_bytes(), &reservation)
    }

    async fn get(&self, id: ReservationId) -> Result<Option<Reservation>> {
        self.get_json(CF_RESERVATIONS, id.as_bytes())
    }

    async fn blocking(&self, asset_id: AssetId, window: TimeSlot) -> Result<Vec<Reservation>> {
        let mut blocking: Vec<Reservation> = self
            .scan_json::<Reservation>(CF_RESERVATIONS, b"")?
            .into_iter()
            .filter(|r| r.asset_id == asset_id && r.status.blocks_slot() && r.slot.overlaps(&window))
            .collect();
        blocking.sort_by_key(|r| r.slot.start);
        Ok(blocking)
    }

    async fn expirable(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        Ok(self
            .scan_json::<Reservation>(CF_RESERVATIONS, b"")?
            .into_iter()
            .filter(|r| r.status == ReservationStatus::PendingPayment && r.is_past_deadline(now))
            .collect())
    }

    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<Reservation>> {
        Ok(self
            .scan_json::<Reservation>(CF_RESERVATIONS, b"")?
            .into_iter()
            .filter(|r| r.org_id == org_id)
            .collect())
    }
}

#[async_trait]
impl PolicyStore for RocksDBStore {
    async fn put_billing_config(&self, config: BillingConfig) -> Result<()> {
        self.put_json(CF_POLICIES, policy_key("billing", config.org_id), &config)
    }

    async fn billing_config(&self, org_id: OrgId) -> Result<Option<BillingConfig>> {
        self.get_json(CF_POLICIES, policy_key("billing", org_id))
    }

    async fn put_penalty_policy(&self, policy: PenaltyPolicy) -> Result<()> {
        self.put_json(CF_POLICIES, policy_key("penalty", policy.org_id), &policy)
    }

    async fn penalty_policy(&self, org_id: OrgId) -> Result<Option<PenaltyPolicy>> {
        self.get_json(CF_POLICIES, policy_key("penalty", org_id))
    }

    async fn put_reservation_config(&self, config: ReservationConfig) -> Result<()> {
        self.put_json(CF_POLICIES, policy_key("reservation", config.org_id), &config)
    }

    async fn reservation_config(&self, org_id: OrgId) -> Result<Option<ReservationConfig>> {
        self.get_json(CF_POLICIES, policy_key("reservation", org_id))
    }

    async fn put_discount(&self, discount: Discount) -> Result<()> {
        self.put_json(CF_POLICIES, policy_key("discount", discount.id), &discount)
    }

    async fn discounts(&self, org_id: OrgId) -> Result<Vec<Discount>> {
        // keys are zero-padded, so the scan is already ordered by id
        Ok(self
            .scan_json::<Discount>(CF_POLICIES, b"discount/")?
            .into_iter()
            .filter(|d| d.org_id == org_id)
            .collect())
    }

    async fn put_asset(&self, asset: Asset) -> Result<()> {
        self.put_json(CF_POLICIES, policy_key("asset", asset.id), &asset)
    }

    async fn asset(&self, asset_id: AssetId) -> Result<Option<Asset>> {
        self.get_json(CF_POLICIES, policy_key("asset", asset_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::{Amount, Balance};
    use crate::domain::reservation::{Requester, ReservationPricing};
    use crate::domain::transaction::TransactionType;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, hour, 0, 0).unwrap()
    }

    fn reservation(start: u32, end: u32) -> Reservation {
        let total = dec!(500);
        Reservation::pending(
            1,
            3,
            Requester {
                user_id: 1,
                name: "Santos".to_string(),
                unit_id: None,
            },
            TimeSlot::new(at(start), at(end)).unwrap(),
            ReservationPricing {
                hourly_rate: dec!(250),
                hours: end - start,
                subtotal: total,
                discount_id: None,
                discount_amount: Decimal::ZERO,
                deposit_amount: Decimal::ZERO,
                total_amount: total,
            },
            None,
            at(0),
        )
    }

    #[tokio::test]
    async fn test_rocksdb_open_cf() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).expect("Failed to open RocksDB");
        for name in COLUMN_FAMILIES {
            assert!(store.db.cf_handle(name).is_some(), "missing {name}");
        }
    }

    #[tokio::test]
    async fn test_rocksdb_transaction_store() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let tx = Transaction::new(
            1,
            TransactionType::Expense,
            Amount::new(dec!(120.50)).unwrap(),
            "Utilities",
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            Utc::now(),
        );
        TransactionStore::store(&store, tx.clone()).await.unwrap();

        assert_eq!(TransactionStore::get(&store, tx.id).await.unwrap(), Some(tx.clone()));
        let listed = store.list(1, &TransactionFilter::default()).await.unwrap();
        assert_eq!(listed, vec![tx]);
        assert!(store.list(2, &TransactionFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rocksdb_credit_apply_is_checked() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let deposit = CreditMovement::deposit(Amount::new(dec!(300)).unwrap(), None, Utc::now());
        store.apply(1, 10, deposit).await.unwrap();
        let overdraw = CreditMovement::deduction(Amount::new(dec!(301)).unwrap(), Utc::now());
        assert!(matches!(
            store.apply(1, 10, overdraw).await,
            Err(LedgerError::InsufficientCredit { .. })
        ));

        let credit = CreditStore::get(&store, 1, 10).await.unwrap().unwrap();
        assert_eq!(credit.balance, Balance::new(dec!(300)));
        assert_eq!(credit.history.len(), 1);
    }

    #[tokio::test]
    async fn test_rocksdb_credit_is_scoped_to_org() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        let deposit = CreditMovement::deposit(Amount::new(dec!(250)).unwrap(), None, Utc::now());
        store.apply(1, 10, deposit).await.unwrap();

        assert_eq!(CreditStore::get(&store, 2, 10).await.unwrap(), None);
        let overdraw = CreditMovement::deduction(Amount::new(dec!(100)).unwrap(), Utc::now());
        assert!(matches!(
            store.apply(2, 10, overdraw).await,
            Err(LedgerError::InsufficientCredit { .. })
        ));
        assert_eq!(CreditStore::all_for_org(&store, 1).await.unwrap().len(), 1);
        assert!(CreditStore::all_for_org(&store, 2).await.unwrap().is_empty());
        let credit = CreditStore::get(&store, 1, 10).await.unwrap().unwrap();
        assert_eq!(credit.balance, Balance::new(dec!(250)));
    }

    #[tokio::test]
    async fn test_rocksdb_refuses_overlapping_reservation() {
        let dir = tempdir().unwrap();
        let store = RocksDBStore::open(dir.path()).unwrap();

        store.insert_if_available(reservation(10, 12)).await.unwrap();
        assert!(matches!(
            store.insert_if_available(reservation(11, 13)).await,
            Err(LedgerError::SlotUnavailable { asset: 3 })
        ));
        store.insert_if_available(reservation(12, 14)).await.unwrap();
        assert_eq!(store.blocking(3, TimeSlot::new(at(0), at(23)).unwrap()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rocksdb_policies_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = RocksDBStore::open(dir.path()).unwrap();
            store
                .put_billing_config(BillingConfig {
                    org_id: 1,
                    monthly_dues: dec!(1500),
                    billing_day: 5,
                })
                .await
                .unwrap();
            store.put_asset(Asset::new(3, 1, "Clubhouse")).await.unwrap();
        }

        let store = RocksDBStore::open(dir.path()).unwrap();
        let config = store.billing_config(1).await.unwrap().unwrap();
        assert_eq!(config.monthly_dues, dec!(1500));
        assert_eq!(store.asset(3).await.unwrap().unwrap().name, "Clubhouse");
        assert!(store.discounts(1).await.unwrap().is_empty());
    }
}
