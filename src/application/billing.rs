use super::ledger::{DUES_CATEGORY, LedgerService};
use crate::domain::credit::CreditMovement;
use crate::domain::discount::select_best;
use crate::domain::money::{Amount, Balance};
use crate::domain::penalty::PenaltyAssessment;
use crate::domain::ports::BillingConfig;
use crate::domain::statement::{BillingPeriod, DuesStatement, StatementId};
use crate::domain::transaction::{PaymentType, Transaction, TransactionType};
use crate::domain::{OrgId, UnitId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Result of a billing run over many units.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BillingRun {
    pub generated: usize,
    pub already_billed: usize,
    pub failed: usize,
}

/// Where a unit stands as of a date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitPosition {
    pub unit_id: UnitId,
    pub outstanding: Balance,
    pub pending_penalties: Decimal,
    pub credit: Balance,
}

/// Generates monthly dues statements.
///
/// A new statement is `base - discount + penalties`, where the discount is the
/// single best one for monthly dues and the penalties are those accrued on
/// the unit's older open statements since they were last charged. Unit credit
/// is then applied to the new statement automatically.
pub struct BillingEngine {
    ledger: Arc<LedgerService>,
}

impl BillingEngine {
    pub fn new(ledger: Arc<LedgerService>) -> Self {
        Self { ledger }
    }

    pub async fn configure(&self, config: BillingConfig) -> Result<()> {
        if !(1..=28).contains(&config.billing_day) {
            return Err(LedgerError::ConfigError(format!(
                "billing day must be between 1 and 28, got {}",
                config.billing_day
            )));
        }
        if config.monthly_dues < Decimal::ZERO {
            return Err(LedgerError::ConfigError(
                "monthly dues cannot be negative".to_string(),
            ));
        }
        self.ledger.stores().policies.put_billing_config(config).await
    }

    /// Penalties that the next statement of the unit would carry.
    pub async fn carried_penalties(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        as_of: NaiveDate,
    ) -> Result<Vec<PenaltyAssessment>> {
        self.ledger.pending_penalties(org_id, unit_id, as_of).await
    }

    /// Generates the unit's statement for `period` from the organization's
    /// billing config. Idempotent: an existing statement for the period is
    /// returned unchanged.
    pub async fn generate_statement_for_unit(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        period: BillingPeriod,
        now: DateTime<Utc>,
    ) -> Result<(DuesStatement, bool)> {
        let config = self
            .ledger
            .stores()
            .policies
            .billing_config(org_id)
            .await?
            .ok_or_else(|| {
                LedgerError::ConfigError(format!("organization {org_id} has no billing config"))
            })?;
        let due_date = NaiveDate::from_ymd_opt(period.year, period.month, config.billing_day)
            .ok_or_else(|| LedgerError::ValidationError(format!("invalid billing period {period}")))?;
        self.issue_statement(org_id, unit_id, period, config.monthly_dues, due_date, now)
            .await
    }

    /// Issues a statement with an explicit base amount and due date.
    ///
    /// Returns the statement and whether it was created by this call.
    pub async fn issue_statement(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        period: BillingPeriod,
        base: Decimal,
        due_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<(DuesStatement, bool)> {
        let _guard = self.ledger.lock().await;
        let stores = self.ledger.stores();

        if let Some(existing) = stores.statements.for_period(org_id, unit_id, period).await? {
            return Ok((existing, false));
        }

        let discounts = stores.policies.discounts(org_id).await?;
        let discount = select_best(&discounts, base, 1, Some(DUES_CATEGORY), due_date);
        let discount_amount = discount.as_ref().map_or(Decimal::ZERO, |d| d.reduction);

        let mut open = stores.statements.open_for_unit(org_id, unit_id).await?;
        let penalties = self.ledger.assess(org_id, &open, due_date).await?;
        for penalty in &penalties {
            if let Some(older) = open.iter_mut().find(|s| s.id == penalty.statement_id) {
                older.mark_penalty_assessed(penalty.amount);
                stores.statements.store(older.clone()).await?;
            }
        }
        let carried: Decimal = penalties.iter().map(|p| p.amount).sum();

        let statement = DuesStatement::new(
            org_id,
            unit_id,
            period,
            base,
            discount_amount,
            carried,
            due_date,
        );
        stores.statements.store(statement.clone()).await?;
        info!(
            statement_id = %statement.id,
            unit = unit_id,
            period = %period,
            base = %base,
            discount = %discount_amount,
            penalties = %carried,
            "statement generated"
        );

        let statement = self.apply_credit(statement, now).await?;
        Ok((statement, true))
    }

    /// Applies the unit's credit to an open statement. Returns the amount
    /// applied, if any.
    pub async fn apply_credit_to_statement(
        &self,
        statement_id: StatementId,
        now: DateTime<Utc>,
    ) -> Result<Option<Decimal>> {
        let _guard = self.ledger.lock().await;
        let statement = self
            .ledger
            .stores()
            .statements
            .get(statement_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Statement", statement_id))?;
        let before = statement.amount_paid;
        let after = self.apply_credit(statement, now).await?;
        let applied = after.amount_paid - before;
        Ok((applied > Decimal::ZERO).then_some(applied))
    }

    /// Deducts `min(credit, balance due)` from the unit's credit, posts it as
    /// dues income and records it on the statement. Caller holds the lock.
    ///
    /// The deduction goes first since it is the step that can be refused. If
    /// a later write fails the credit is given back and the statement
    /// restored.
    async fn apply_credit(&self, statement: DuesStatement, now: DateTime<Utc>) -> Result<DuesStatement> {
        let stores = self.ledger.stores();
        let credit = stores
            .credits
            .get(statement.org_id, statement.unit_id)
            .await?
            .map_or(Balance::ZERO, |c| c.balance);
        let due = statement.balance_due();
        if !statement.is_open() || !credit.is_positive() || !due.is_positive() {
            return Ok(statement);
        }
        let applied = Amount::new(credit.value().min(due.value()))?;
        let today = now.date_naive();

        let mut tx = Transaction::new(
            statement.org_id,
            TransactionType::Income,
            applied,
            DUES_CATEGORY,
            today,
            now,
        );
        tx.unit_id = Some(statement.unit_id);
        tx.payment_type = PaymentType::Credit;
        tx.description = format!("Auto-deducted from credit for {}", statement.period);
        let tx = LedgerService::approve_system_income(tx, now)?;

        let mut paid = statement.clone();
        paid.record_payment(applied.value(), today, Some(tx.id));

        let mut movement = CreditMovement::deduction(applied, now)
            .with_description(format!("Dues for {}", statement.period));
        movement.transaction_id = Some(tx.id);
        stores
            .credits
            .apply(statement.org_id, statement.unit_id, movement)
            .await?;

        if let Err(err) = stores.statements.store(paid.clone()).await {
            self.refund(&statement, applied, &tx, now).await;
            return Err(err);
        }
        if let Err(err) = self.ledger.post_system_income(&tx).await {
            if let Err(restore) = stores.statements.store(statement.clone()).await {
                error!(statement_id = %statement.id, error = %restore, "failed to restore statement");
            }
            self.refund(&statement, applied, &tx, now).await;
            return Err(err);
        }

        info!(
            statement_id = %paid.id,
            unit = paid.unit_id,
            applied = %applied,
            status = ?paid.status,
            "credit applied to statement"
        );
        Ok(paid)
    }

    /// Gives back credit taken for a statement whose payment did not go through.
    async fn refund(&self, statement: &DuesStatement, amount: Amount, tx: &Transaction, now: DateTime<Utc>) {
        let movement = CreditMovement::deposit(amount, Some(tx.id), now)
            .with_description(format!("Reversal of dues deduction for {}", statement.period));
        match self
            .ledger
            .stores()
            .credits
            .apply(statement.org_id, statement.unit_id, movement)
            .await
        {
            Ok(_) => info!(unit = statement.unit_id, amount = %amount, "credit deduction reversed"),
            Err(err) => error!(unit = statement.unit_id, error = %err, "failed to reverse credit deduction"),
        }
    }

    /// Generates `period` statements for every listed unit. A failure on one
    /// unit is logged and does not stop the run.
    pub async fn generate_monthly_statements(
        &self,
        org_id: OrgId,
        period: BillingPeriod,
        units: &[UnitId],
        now: DateTime<Utc>,
    ) -> BillingRun {
        let mut run = BillingRun::default();
        for &unit_id in units {
            match self.generate_statement_for_unit(org_id, unit_id, period, now).await {
                Ok((_, true)) => run.generated += 1,
                Ok((_, false)) => run.already_billed += 1,
                Err(e) => {
                    error!(unit = unit_id, period = %period, error = %e, "statement generation failed");
                    run.failed += 1;
                }
            }
        }
        info!(
            org = org_id,
            period = %period,
            generated = run.generated,
            already_billed = run.already_billed,
            failed = run.failed,
            "billing run finished"
        );
        run
    }

    /// Outstanding dues, uncharged penalties and credit of every unit that has
    /// a statement or a credit balance, ordered by unit.
    pub async fn unit_positions(&self, org_id: OrgId, as_of: NaiveDate) -> Result<Vec<UnitPosition>> {
        let stores = self.ledger.stores();
        let mut positions: BTreeMap<UnitId, UnitPosition> = BTreeMap::new();

        let statements = stores.statements.all_for_org(org_id).await?;
        let policy = stores.policies.penalty_policy(org_id).await?;
        for statement in statements.iter().filter(|s| s.is_open()) {
            let position = positions
                .entry(statement.unit_id)
                .or_insert_with(|| UnitPosition::empty(statement.unit_id));
            position.outstanding += statement.balance_due();
            if let Some(policy) = &policy
                && let Some(penalty) = statement.penalty_increment(policy, as_of)?
            {
                position.pending_penalties += penalty.amount;
            }
        }
        for statement in &statements {
            positions
                .entry(statement.unit_id)
                .or_insert_with(|| UnitPosition::empty(statement.unit_id));
        }
        for credit in stores.credits.all_for_org(org_id).await? {
            positions
                .entry(credit.unit_id)
                .or_insert_with(|| UnitPosition::empty(credit.unit_id))
                .credit = credit.balance;
        }
        Ok(positions.into_values().collect())
    }
}

impl UnitPosition {
    fn empty(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            outstanding: Balance::ZERO,
            pending_penalties: Decimal::ZERO,
            credit: Balance::ZERO,
        }
    }
}
