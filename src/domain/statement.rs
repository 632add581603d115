use super::money::Balance;
use super::penalty::{PenaltyAssessment, PenaltyPolicy};
use super::transaction::TransactionId;
use super::{OrgId, UnitId};
use crate::error::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type StatementId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum StatementStatus {
    Unpaid,
    Partial,
    Paid,
}

/// Billing month of a statement. Orders by year, then month.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}/{}", self.month, self.year)
    }
}

/// Monthly dues bill of one unit.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DuesStatement {
    pub id: StatementId,
    pub org_id: OrgId,
    pub unit_id: UnitId,
    pub period: BillingPeriod,
    pub base_amount: Decimal,
    pub discount_amount: Decimal,
    pub penalty_amount: Decimal,
    /// `base - discount + penalty`.
    pub net_amount: Decimal,
    pub amount_paid: Decimal,
    /// Late penalty on this statement already charged elsewhere, either
    /// carried into a later statement or collected with a payment.
    #[serde(default)]
    pub penalty_assessed: Decimal,
    pub status: StatementStatus,
    pub due_date: NaiveDate,
    pub paid_date: Option<NaiveDate>,
    pub payment_transaction_id: Option<TransactionId>,
}

impl DuesStatement {
    pub fn new(
        org_id: OrgId,
        unit_id: UnitId,
        period: BillingPeriod,
        base_amount: Decimal,
        discount_amount: Decimal,
        penalty_amount: Decimal,
        due_date: NaiveDate,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            unit_id,
            period,
            base_amount,
            discount_amount,
            penalty_amount,
            net_amount: base_amount - discount_amount + penalty_amount,
            amount_paid: Decimal::ZERO,
            penalty_assessed: Decimal::ZERO,
            status: StatementStatus::Unpaid,
            due_date,
            paid_date: None,
            payment_transaction_id: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status != StatementStatus::Paid
    }

    pub fn balance_due(&self) -> Balance {
        Balance::new((self.net_amount - self.amount_paid).max(Decimal::ZERO))
    }

    /// Unpaid part of the dues themselves, excluding penalties carried into
    /// this statement. Late penalties accrue on this, so they never compound.
    pub fn penalty_principal(&self) -> Decimal {
        self.balance_due()
            .value()
            .min(self.base_amount - self.discount_amount)
            .max(Decimal::ZERO)
    }

    /// Penalty accrued on this statement as of `as_of` that has not been
    /// charged yet. `None` while nothing new is owed.
    pub fn penalty_increment(
        &self,
        policy: &PenaltyPolicy,
        as_of: NaiveDate,
    ) -> Result<Option<PenaltyAssessment>> {
        let principal = self.penalty_principal();
        let accrued = policy.penalty_for(principal, self.due_date, as_of)?;
        let increment = accrued - self.penalty_assessed;
        if increment <= Decimal::ZERO {
            return Ok(None);
        }
        Ok(Some(PenaltyAssessment {
            statement_id: self.id,
            label: format!("Late penalty for {}", self.period),
            principal,
            rate: policy.rate,
            months_overdue: policy.months_overdue(self.due_date, as_of),
            amount: increment,
        }))
    }

    pub fn mark_penalty_assessed(&mut self, amount: Decimal) {
        self.penalty_assessed += amount;
    }

    /// Records a payment towards the statement and updates its status.
    pub fn record_payment(
        &mut self,
        amount: Decimal,
        on: NaiveDate,
        transaction_id: Option<TransactionId>,
    ) {
        self.amount_paid += amount;
        if self.amount_paid >= self.net_amount {
            self.status = StatementStatus::Paid;
            self.paid_date = Some(on);
        } else if self.amount_paid > Decimal::ZERO {
            self.status = StatementStatus::Partial;
        }
        if transaction_id.is_some() {
            self.payment_transaction_id = transaction_id;
        }
    }

    /// Marks the remaining balance as paid.
    pub fn settle(&mut self, on: NaiveDate, transaction_id: Option<TransactionId>) {
        let remaining = self.balance_due().value();
        self.record_payment(remaining, on, transaction_id);
    }
}
