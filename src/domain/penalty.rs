//! Late-payment penalties.
//!
//! Penalties accrue as simple interest on the unpaid balance of a dues
//! statement, once per elapsed month after the grace period. Nothing here
//! compounds: the principal is always the unpaid balance, never a balance that
//! already contains interest from this calculation.

use super::money::round_cents;
use super::statement::StatementId;
use super::OrgId;
use crate::error::{LedgerError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Length of a penalty month in days.
pub const DAYS_PER_MONTH: i64 = 30;

/// Computes `principal × monthly_rate × elapsed_months`, rounded to cents.
///
/// `monthly_rate` is a fraction (0.02 for 2%). Negative elapsed time is an
/// error rather than a zero penalty.
pub fn simple_interest(
    principal: Decimal,
    monthly_rate: Decimal,
    elapsed_months: i64,
) -> Result<Decimal> {
    if elapsed_months < 0 {
        return Err(LedgerError::ValidationError(format!(
            "Elapsed months cannot be negative: {elapsed_months}"
        )));
    }
    if monthly_rate < Decimal::ZERO {
        return Err(LedgerError::ValidationError(
            "Penalty rate cannot be negative".to_string(),
        ));
    }
    Ok(round_cents(principal * monthly_rate * Decimal::from(elapsed_months)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyBasis {
    /// `rate` is a monthly percentage of the unpaid balance.
    Percent,
    /// `rate` is a fixed fee charged per elapsed month.
    Flat,
}

impl std::str::FromStr for PenaltyBasis {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "percent" | "percentage" => Ok(Self::Percent),
            "flat" => Ok(Self::Flat),
            other => Err(LedgerError::ConfigError(format!(
                "unknown penalty basis '{other}'"
            ))),
        }
    }
}

/// Organization-level late payment policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyPolicy {
    pub org_id: OrgId,
    pub basis: PenaltyBasis,
    /// Percentage points per month for `Percent` (2.00 means 2%), currency
    /// per month for `Flat`.
    pub rate: Decimal,
    pub grace_period_days: u32,
}

impl PenaltyPolicy {
    /// Validates and builds a policy. Negative rates are rejected here so that
    /// a stored policy is always applicable.
    pub fn new(
        org_id: OrgId,
        basis: PenaltyBasis,
        rate: Decimal,
        grace_period_days: u32,
    ) -> Result<Self> {
        if rate < Decimal::ZERO {
            return Err(LedgerError::ConfigError(format!(
                "penalty rate cannot be negative: {rate}"
            )));
        }
        Ok(Self {
            org_id,
            basis,
            rate,
            grace_period_days,
        })
    }

    /// Monthly rate as a fraction, e.g. 0.02 for a 2.00 percent policy.
    pub fn monthly_rate(&self) -> Decimal {
        match self.basis {
            PenaltyBasis::Percent => self.rate / Decimal::ONE_HUNDRED,
            PenaltyBasis::Flat => self.rate,
        }
    }

    /// Months overdue once the grace period has lapsed.
    ///
    /// Zero while `as_of` is on or before the end of the grace period. After
    /// that, every started 30-day block up to the first counts as one month;
    /// later months are whole 30-day blocks.
    ///
    /// Months are counted from the end of the grace period, not from the due
    /// date: with a 15-day grace, 74 days past due is 59 days into penalties
    /// and so one month, where counting from the due date would give two.
    pub fn months_overdue(&self, due_date: NaiveDate, as_of: NaiveDate) -> i64 {
        let days_after_grace = (as_of - due_date).num_days() - i64::from(self.grace_period_days);
        if days_after_grace <= 0 {
            0
        } else {
            (days_after_grace / DAYS_PER_MONTH).max(1)
        }
    }

    /// Penalty on `principal` for a statement due on `due_date`, as of `as_of`.
    pub fn penalty_for(
        &self,
        principal: Decimal,
        due_date: NaiveDate,
        as_of: NaiveDate,
    ) -> Result<Decimal> {
        if principal <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        let months = self.months_overdue(due_date, as_of);
        match self.basis {
            PenaltyBasis::Percent => simple_interest(principal, self.monthly_rate(), months),
            PenaltyBasis::Flat => Ok(round_cents(self.rate * Decimal::from(months))),
        }
    }
}

/// One penalty line for an overdue statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyAssessment {
    pub statement_id: StatementId,
    pub label: String,
    pub principal: Decimal,
    pub rate: Decimal,
    pub months_overdue: i64,
    pub amount: Decimal,
}
