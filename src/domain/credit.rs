use super::money::{Amount, Balance};
use super::transaction::TransactionId;
use super::{OrgId, UnitId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum CreditEntryKind {
    /// Excess of an advance payment.
    Deposit,
    /// Credit consumed to settle a dues statement.
    DuesDeduction,
}

/// One movement of a unit's credit balance.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CreditEntry {
    pub kind: CreditEntryKind,
    /// Signed: positive for deposits, negative for deductions.
    pub amount: Decimal,
    pub balance_after: Balance,
    pub transaction_id: Option<TransactionId>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A requested change to a unit's credit, applied atomically by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditMovement {
    pub kind: CreditEntryKind,
    pub amount: Amount,
    pub transaction_id: Option<TransactionId>,
    pub description: String,
    pub at: DateTime<Utc>,
}

impl CreditMovement {
    pub fn deposit(amount: Amount, transaction_id: Option<TransactionId>, at: DateTime<Utc>) -> Self {
        Self {
            kind: CreditEntryKind::Deposit,
            amount,
            transaction_id,
            description: "Advance payment deposit".to_string(),
            at,
        }
    }

    pub fn deduction(amount: Amount, at: DateTime<Utc>) -> Self {
        Self {
            kind: CreditEntryKind::DuesDeduction,
            amount,
            transaction_id: None,
            description: "Monthly dues deduction".to_string(),
            at,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Running credit of a unit, built up by advance payments.
///
/// The balance never goes negative: deductions larger than the balance are
/// refused and leave the credit untouched.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct UnitCredit {
    pub org_id: OrgId,
    pub unit_id: UnitId,
    pub balance: Balance,
    pub history: Vec<CreditEntry>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl UnitCredit {
    pub fn new(org_id: OrgId, unit_id: UnitId) -> Self {
        Self {
            org_id,
            unit_id,
            balance: Balance::ZERO,
            history: Vec::new(),
            last_updated: None,
        }
    }

    /// Applies a movement and returns the recorded entry.
    pub fn apply(&mut self, movement: CreditMovement) -> Result<CreditEntry> {
        let amount: Balance = movement.amount.into();
        let signed = match movement.kind {
            CreditEntryKind::Deposit => {
                self.balance += amount;
                amount.value()
            }
            CreditEntryKind::DuesDeduction => {
                if self.balance < amount {
                    return Err(LedgerError::InsufficientCredit {
                        balance: self.balance.value(),
                        requested: amount.value(),
                    });
                }
                self.balance -= amount;
                -amount.value()
            }
        };

        let entry = CreditEntry {
            kind: movement.kind,
            amount: signed,
            balance_after: self.balance,
            transaction_id: movement.transaction_id,
            description: movement.description,
            created_at: movement.at,
        };
        self.history.push(entry.clone());
        self.last_updated = Some(movement.at);
        Ok(entry)
    }

    /// Most recent entries first.
    pub fn recent_history(&self, limit: usize) -> Vec<CreditEntry> {
        self.history.iter().rev().take(limit).cloned().collect()
    }
}
