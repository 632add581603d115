use super::money::Amount;
use super::statement::StatementId;
use super::{AssetId, OrgId, UnitId, UserId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TransactionId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
}

/// Workflow state of a ledger transaction.
///
/// `Draft -> Pending -> Approved`, with `Pending -> Draft` on rejection and
/// `Draft | Pending -> Cancelled`. `Approved` is the posted state: only
/// approved transactions count towards balances and reports.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    #[default]
    Draft,
    Pending,
    Approved,
    Cancelled,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    /// Amount must equal the amount due.
    #[default]
    Exact,
    /// Amount may exceed the amount due; the excess becomes unit credit.
    Advance,
    /// Settled from the unit's credit balance. The cash was counted when the
    /// credit was deposited.
    Credit,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum AdjustmentKind {
    Penalty,
    Discount,
}

/// A penalty or discount line folded into a transaction's net amount.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Adjustment {
    pub kind: AdjustmentKind,
    pub amount: Decimal,
    pub reason: String,
    pub months_overdue: Option<i64>,
    /// Statement a penalty line was assessed on.
    pub statement_id: Option<StatementId>,
}

/// Receipt or supporting document. The file itself lives in external storage.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub url: String,
    pub content_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub org_id: OrgId,
    pub unit_id: Option<UnitId>,
    pub asset_id: Option<AssetId>,
    pub r#type: TransactionType,
    pub status: TransactionStatus,
    pub payment_type: PaymentType,
    /// Amount received or spent, before adjustments.
    pub gross_amount: Amount,
    /// Gross plus penalties minus discounts.
    pub net_amount: Decimal,
    pub adjustments: Vec<Adjustment>,
    pub category: String,
    pub description: String,
    pub payer_name: Option<String>,
    pub reference_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub requires_receipt: bool,
    pub attachments: Vec<Attachment>,
    pub created_by: Option<UserId>,
    pub approved_by: Option<UserId>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        org_id: OrgId,
        r#type: TransactionType,
        amount: Amount,
        category: impl Into<String>,
        transaction_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            unit_id: None,
            asset_id: None,
            r#type,
            status: TransactionStatus::Draft,
            payment_type: PaymentType::Exact,
            gross_amount: amount,
            net_amount: amount.value(),
            adjustments: Vec::new(),
            category: category.into(),
            description: String::new(),
            payer_name: None,
            reference_number: None,
            transaction_date,
            requires_receipt: false,
            attachments: Vec::new(),
            created_by: None,
            approved_by: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_posted(&self) -> bool {
        self.status == TransactionStatus::Approved
    }

    /// Adds an adjustment line and recomputes the net amount.
    pub fn push_adjustment(&mut self, adjustment: Adjustment) {
        match adjustment.kind {
            AdjustmentKind::Penalty => self.net_amount += adjustment.amount,
            AdjustmentKind::Discount => self.net_amount -= adjustment.amount,
        }
        self.adjustments.push(adjustment);
    }

    pub fn attach(&mut self, attachment: Attachment, now: DateTime<Utc>) -> Result<()> {
        if self.status == TransactionStatus::Cancelled {
            return Err(self.invalid("attach a receipt"));
        }
        self.attachments.push(attachment);
        self.updated_at = now;
        Ok(())
    }

    /// Draft -> Pending. A receipt must be attached when one is required.
    pub fn submit(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != TransactionStatus::Draft {
            return Err(self.invalid("submit"));
        }
        if self.requires_receipt && self.attachments.is_empty() {
            return Err(LedgerError::ValidationError(
                "Receipt attachment is required for this transaction".to_string(),
            ));
        }
        self.status = TransactionStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    /// Pending -> Approved.
    pub fn approve(&mut self, approver: UserId, now: DateTime<Utc>) -> Result<()> {
        if self.status != TransactionStatus::Pending {
            return Err(self.invalid("approve"));
        }
        self.status = TransactionStatus::Approved;
        self.approved_by = Some(approver);
        self.approved_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Pending -> Draft, keeping the reason in the description.
    pub fn reject(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if self.status != TransactionStatus::Pending {
            return Err(self.invalid("reject"));
        }
        self.status = TransactionStatus::Draft;
        self.annotate("REJECTED", reason);
        self.updated_at = now;
        Ok(())
    }

    /// Draft | Pending -> Cancelled. Posted transactions stay on the books.
    pub fn cancel(&mut self, reason: &str, now: DateTime<Utc>) -> Result<()> {
        if !matches!(
            self.status,
            TransactionStatus::Draft | TransactionStatus::Pending
        ) {
            return Err(self.invalid("cancel"));
        }
        self.status = TransactionStatus::Cancelled;
        self.annotate("CANCELLED", reason);
        self.updated_at = now;
        Ok(())
    }

    fn annotate(&mut self, tag: &str, reason: &str) {
        if reason.is_empty() {
            return;
        }
        if !self.description.is_empty() {
            self.description.push('\n');
        }
        self.description.push_str(&format!("[{tag}: {reason}]"));
    }

    fn invalid(&self, action: &'static str) -> LedgerError {
        LedgerError::InvalidTransition {
            action,
            status: self.status.to_string(),
        }
    }
}
