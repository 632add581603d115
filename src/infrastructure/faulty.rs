//! Store adapters that fail writes on demand, for exercising the paths that
//! must leave state untouched when storage gives out halfway.

use super::in_memory::{InMemoryCreditStore, InMemoryTransactionStore};
use crate::domain::credit::{CreditMovement, UnitCredit};
use crate::domain::ports::{CreditStore, TransactionFilter, TransactionStore};
use crate::domain::transaction::{Transaction, TransactionId};
use crate::domain::{OrgId, UnitId};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

fn write_failure() -> LedgerError {
    LedgerError::InternalError("storage write failed".into())
}

#[derive(Default)]
pub struct FaultyTransactionStore {
    inner: InMemoryTransactionStore,
    failing: AtomicBool,
}

impl FaultyTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionStore for FaultyTransactionStore {
    async fn store(&self, tx: Transaction) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(write_failure());
        }
        self.inner.store(tx).await
    }

    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        self.inner.get(tx_id).await
    }

    async fn list(&self, org_id: OrgId, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        self.inner.list(org_id, filter).await
    }
}

#[derive(Default)]
pub struct FaultyCreditStore {
    inner: InMemoryCreditStore,
    failing: AtomicBool,
}

impl FaultyCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl CreditStore for FaultyCreditStore {
    async fn get(&self, org_id: OrgId, unit_id: UnitId) -> Result<Option<UnitCredit>> {
        self.inner.get(org_id, unit_id).await
    }

    async fn apply(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        movement: CreditMovement,
    ) -> Result<UnitCredit> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(write_failure());
        }
        self.inner.apply(org_id, unit_id, movement).await
    }

    async fn all_for_org(&self, org_id: OrgId) -> Result<Vec<UnitCredit>> {
        self.inner.all_for_org(org_id).await
    }
}
