use crate::domain::credit::{CreditEntry, CreditMovement, UnitCredit};
use crate::domain::discount::DiscountApplication;
use crate::domain::money::{Amount, Balance};
use crate::domain::penalty::PenaltyAssessment;
use crate::domain::ports::{Stores, TransactionFilter};
use crate::domain::statement::{DuesStatement, StatementId};
use crate::domain::transaction::{
    Adjustment, AdjustmentKind, Attachment, PaymentType, Transaction, TransactionId,
    TransactionStatus, TransactionType,
};
use crate::domain::{AssetId, DiscountId, OrgId, UnitId, UserId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Approver recorded on transactions the system posts by itself.
pub const SYSTEM_USER: UserId = 0;

pub const DUES_CATEGORY: &str = "Monthly Dues";

/// An income entry as staff submit it.
#[derive(Debug, Clone)]
pub struct IncomeRequest {
    pub org_id: OrgId,
    pub unit_id: Option<UnitId>,
    pub asset_id: Option<AssetId>,
    /// Amount applied to dues (or other income) before penalties and discounts.
    pub amount: Amount,
    pub payment_type: PaymentType,
    pub category: String,
    pub description: String,
    pub payer_name: Option<String>,
    pub reference_number: Option<String>,
    pub transaction_date: NaiveDate,
    pub discount_id: Option<DiscountId>,
    /// Months of dues the payment covers, for discount eligibility.
    pub months: u32,
    pub requires_receipt: bool,
    pub created_by: Option<UserId>,
}

impl IncomeRequest {
    /// A dues payment by a unit.
    pub fn dues(
        org_id: OrgId,
        unit_id: UnitId,
        amount: Amount,
        payment_type: PaymentType,
        transaction_date: NaiveDate,
    ) -> Self {
        Self {
            org_id,
            unit_id: Some(unit_id),
            asset_id: None,
            amount,
            payment_type,
            category: DUES_CATEGORY.to_string(),
            description: String::new(),
            payer_name: None,
            reference_number: None,
            transaction_date,
            discount_id: None,
            months: 1,
            requires_receipt: false,
            created_by: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExpenseRequest {
    pub org_id: OrgId,
    pub unit_id: Option<UnitId>,
    pub asset_id: Option<AssetId>,
    pub amount: Amount,
    pub category: String,
    pub description: String,
    pub transaction_date: NaiveDate,
    pub requires_receipt: bool,
    pub created_by: Option<UserId>,
}

/// Outcome of validating a unit payment against its oldest open statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentPlan {
    pub statement_id: Option<StatementId>,
    /// Unpaid balance of the statement the payment settles.
    pub amount_due: Decimal,
    /// Late penalties accrued on the unit's open statements, collected with
    /// this payment.
    pub penalties: Decimal,
    pub credit_to_add: Decimal,
}

impl PaymentPlan {
    pub fn total_due(&self) -> Decimal {
        self.amount_due + self.penalties
    }
}

/// Validates a unit payment.
///
/// `collected` is what the payer hands over: penalties included, discounts
/// taken off. It is held against the balance of the oldest open statement
/// plus the pending `penalties`. `Exact` must match that total. `Advance`
/// may exceed it and the excess becomes credit; with nothing due the whole
/// amount is credit. Collecting less than is due is refused either way.
pub fn plan_payment(
    open: Option<&DuesStatement>,
    penalties: Decimal,
    collected: Decimal,
    payment_type: PaymentType,
) -> Result<PaymentPlan> {
    if payment_type == PaymentType::Credit {
        return Err(LedgerError::ValidationError(
            "Credit payments are applied by billing, not recorded".to_string(),
        ));
    }
    let Some(statement) = open else {
        return match payment_type {
            PaymentType::Exact | PaymentType::Credit => Err(LedgerError::NoOutstandingDues),
            PaymentType::Advance => Ok(PaymentPlan {
                statement_id: None,
                amount_due: Decimal::ZERO,
                penalties: Decimal::ZERO,
                credit_to_add: collected,
            }),
        };
    };

    let mut plan = PaymentPlan {
        statement_id: Some(statement.id),
        amount_due: statement.balance_due().value(),
        penalties,
        credit_to_add: Decimal::ZERO,
    };
    let due = plan.total_due();
    if collected < due {
        return Err(LedgerError::Underpayment {
            due,
            received: collected,
        });
    }
    match payment_type {
        PaymentType::Exact if collected > due => Err(LedgerError::Overcollection {
            due,
            received: collected,
        }),
        PaymentType::Exact | PaymentType::Credit => Ok(plan),
        PaymentType::Advance => {
            plan.credit_to_add = collected - due;
            Ok(plan)
        }
    }
}

fn penalty_total(tx: &Transaction, statement_id: Option<StatementId>) -> Decimal {
    tx.adjustments
        .iter()
        .filter(|a| a.kind == AdjustmentKind::Penalty)
        .filter(|a| statement_id.is_none() || a.statement_id == statement_id)
        .map(|a| a.amount)
        .sum()
}

/// Preview of how an income entry will be recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breakdown {
    pub gross_amount: Decimal,
    pub penalties: Vec<PenaltyAssessment>,
    pub total_penalties: Decimal,
    pub discount: Option<DiscountApplication>,
    pub net_amount: Decimal,
    pub plan: Option<PaymentPlan>,
}

impl Breakdown {
    pub fn credit_to_add(&self) -> Option<Decimal> {
        self.plan
            .as_ref()
            .map(|p| p.credit_to_add)
            .filter(|c| *c > Decimal::ZERO)
    }
}

/// Statement and credit changes an approval makes.
struct Settlement {
    unit_id: UnitId,
    plan: PaymentPlan,
    /// Each touched statement before and after the payment.
    statements: Vec<(DuesStatement, DuesStatement)>,
    credit: Option<Amount>,
}

#[derive(Debug, Clone)]
pub struct Approval {
    pub transaction: Transaction,
    pub settled_statement: Option<StatementId>,
    pub credit_added: Option<Decimal>,
}

/// Posted totals over a date range.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSummary {
    pub income: Decimal,
    pub expense: Decimal,
    pub net: Decimal,
    pub income_by_category: BTreeMap<String, Decimal>,
    pub expense_by_category: BTreeMap<String, Decimal>,
}

/// Records income and expenses and drives them through the approval
/// workflow.
///
/// Every mutation runs under one write guard so that validating a payment
/// against the open statements and settling them cannot interleave with
/// another payment or a billing run for the same organization.
pub struct LedgerService {
    stores: Stores,
    write_guard: Arc<Mutex<()>>,
}

impl LedgerService {
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_guard.lock().await
    }

    /// Oldest unpaid or partially paid statement of a unit.
    pub async fn current_dues(&self, org_id: OrgId, unit_id: UnitId) -> Result<Option<DuesStatement>> {
        let open = self.stores.statements.open_for_unit(org_id, unit_id).await?;
        Ok(open.into_iter().next())
    }

    /// Validates a dues payment of `amount` as `record_income` would on
    /// `as_of`: pending penalties are collected on top of the amount.
    pub async fn validate_payment(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        amount: Amount,
        payment_type: PaymentType,
        as_of: NaiveDate,
    ) -> Result<PaymentPlan> {
        let open = self.stores.statements.open_for_unit(org_id, unit_id).await?;
        let penalties: Decimal = self
            .assess(org_id, &open, as_of)
            .await?
            .iter()
            .map(|p| p.amount)
            .sum();
        plan_payment(open.first(), penalties, amount.value() + penalties, payment_type)
    }

    /// Penalties accrued on the unit's open statements and not charged yet.
    pub async fn pending_penalties(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        as_of: NaiveDate,
    ) -> Result<Vec<PenaltyAssessment>> {
        let open = self.stores.statements.open_for_unit(org_id, unit_id).await?;
        self.assess(org_id, &open, as_of).await
    }

    pub(crate) async fn assess(
        &self,
        org_id: OrgId,
        open: &[DuesStatement],
        as_of: NaiveDate,
    ) -> Result<Vec<PenaltyAssessment>> {
        let Some(policy) = self.stores.policies.penalty_policy(org_id).await? else {
            return Ok(Vec::new());
        };
        open.iter()
            .filter_map(|s| s.penalty_increment(&policy, as_of).transpose())
            .collect()
    }

    /// Computes gross, penalties, discount and net for an income entry
    /// without recording anything. Fails the same way recording would.
    pub async fn preview_breakdown(&self, request: &IncomeRequest) -> Result<Breakdown> {
        let gross = request.amount.value();

        let (open, penalties) = match request.unit_id {
            Some(unit_id) => {
                let open = self
                    .stores
                    .statements
                    .open_for_unit(request.org_id, unit_id)
                    .await?;
                let penalties = self
                    .assess(request.org_id, &open, request.transaction_date)
                    .await?;
                (open, penalties)
            }
            None => (Vec::new(), Vec::new()),
        };

        let discount = match request.discount_id {
            Some(discount_id) => {
                let discounts = self.stores.policies.discounts(request.org_id).await?;
                let discount = discounts
                    .iter()
                    .find(|d| d.id == discount_id)
                    .ok_or_else(|| LedgerError::not_found("Discount", discount_id))?;
                if !discount.covers_category(Some(&request.category)) {
                    return Err(LedgerError::ValidationError(format!(
                        "Discount {} does not apply to {}",
                        discount.id, request.category
                    )));
                }
                Some(discount.apply(gross, request.months, request.transaction_date)?)
            }
            None => None,
        };

        let total_penalties: Decimal = penalties.iter().map(|p| p.amount).sum();
        let reduction = discount.as_ref().map_or(Decimal::ZERO, |d| d.reduction);
        let net_amount = gross + total_penalties - reduction;
        let plan = match request.unit_id {
            Some(_) => Some(plan_payment(
                open.first(),
                total_penalties,
                net_amount,
                request.payment_type,
            )?),
            None => None,
        };
        Ok(Breakdown {
            gross_amount: gross,
            penalties,
            total_penalties,
            discount,
            net_amount,
            plan,
        })
    }

    /// Records an income entry as a draft. Returns the transaction and the
    /// credit an advance payment will add once approved.
    pub async fn record_income(
        &self,
        request: IncomeRequest,
        now: DateTime<Utc>,
    ) -> Result<(Transaction, Option<Decimal>)> {
        let _guard = self.lock().await;
        let breakdown = self.preview_breakdown(&request).await?;

        let mut tx = Transaction::new(
            request.org_id,
            TransactionType::Income,
            request.amount,
            request.category,
            request.transaction_date,
            now,
        );
        tx.unit_id = request.unit_id;
        tx.asset_id = request.asset_id;
        tx.payment_type = request.payment_type;
        tx.description = request.description;
        tx.payer_name = request.payer_name;
        tx.reference_number = request.reference_number;
        tx.requires_receipt = request.requires_receipt;
        tx.created_by = request.created_by;
        for penalty in &breakdown.penalties {
            tx.push_adjustment(Adjustment {
                kind: AdjustmentKind::Penalty,
                amount: penalty.amount,
                reason: penalty.label.clone(),
                months_overdue: Some(penalty.months_overdue),
                statement_id: Some(penalty.statement_id),
            });
        }
        if let Some(discount) = &breakdown.discount {
            tx.push_adjustment(Adjustment {
                kind: AdjustmentKind::Discount,
                amount: discount.reduction,
                reason: discount.name.clone(),
                months_overdue: None,
                statement_id: None,
            });
        }

        self.stores.transactions.store(tx.clone()).await?;
        info!(
            tx_id = %tx.id,
            org = tx.org_id,
            unit = ?tx.unit_id,
            gross = %tx.gross_amount,
            net = %tx.net_amount,
            "income recorded"
        );
        Ok((tx, breakdown.credit_to_add()))
    }

    pub async fn record_expense(&self, request: ExpenseRequest, now: DateTime<Utc>) -> Result<Transaction> {
        let _guard = self.lock().await;
        let mut tx = Transaction::new(
            request.org_id,
            TransactionType::Expense,
            request.amount,
            request.category,
            request.transaction_date,
            now,
        );
        tx.unit_id = request.unit_id;
        tx.asset_id = request.asset_id;
        tx.description = request.description;
        tx.requires_receipt = request.requires_receipt;
        tx.created_by = request.created_by;

        self.stores.transactions.store(tx.clone()).await?;
        info!(tx_id = %tx.id, org = tx.org_id, amount = %tx.gross_amount, "expense recorded");
        Ok(tx)
    }

    pub async fn get(&self, tx_id: TransactionId) -> Result<Transaction> {
        self.stores
            .transactions
            .get(tx_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("Transaction", tx_id))
    }

    pub async fn list_transactions(
        &self,
        org_id: OrgId,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        self.stores.transactions.list(org_id, filter).await
    }

    pub async fn add_attachment(
        &self,
        tx_id: TransactionId,
        attachment: Attachment,
        now: DateTime<Utc>,
    ) -> Result<Transaction> {
        self.update(tx_id, |tx| tx.attach(attachment, now)).await
    }

    pub async fn submit_for_approval(&self, tx_id: TransactionId, now: DateTime<Utc>) -> Result<Transaction> {
        self.update(tx_id, |tx| tx.submit(now)).await
    }

    pub async fn reject(&self, tx_id: TransactionId, reason: &str, now: DateTime<Utc>) -> Result<Transaction> {
        let tx = self.update(tx_id, |tx| tx.reject(reason, now)).await?;
        warn!(tx_id = %tx.id, reason, "transaction rejected");
        Ok(tx)
    }

    pub async fn cancel(&self, tx_id: TransactionId, reason: &str, now: DateTime<Utc>) -> Result<Transaction> {
        let tx = self.update(tx_id, |tx| tx.cancel(reason, now)).await?;
        info!(tx_id = %tx.id, reason, "transaction cancelled");
        Ok(tx)
    }

    async fn update<F>(&self, tx_id: TransactionId, change: F) -> Result<Transaction>
    where
        F: FnOnce(&mut Transaction) -> Result<()>,
    {
        let _guard = self.lock().await;
        let mut tx = self.get(tx_id).await?;
        change(&mut tx)?;
        self.stores.transactions.store(tx.clone()).await?;
        Ok(tx)
    }

    /// Posts a pending transaction.
    ///
    /// For unit income the payment is validated again against the current
    /// dues, the oldest open statement is settled, penalties collected with it
    /// are marked as charged, and the excess of an advance payment is added to
    /// the unit's credit. A failed write puts the transaction and statements
    /// back the way they were.
    pub async fn approve(
        &self,
        tx_id: TransactionId,
        approver: UserId,
        now: DateTime<Utc>,
    ) -> Result<Approval> {
        let _guard = self.lock().await;
        let pending = self.get(tx_id).await?;
        let mut tx = pending.clone();
        tx.approve(approver, now)?;

        let settlement = match (tx.r#type, tx.unit_id) {
            (TransactionType::Income, Some(unit_id)) => Some(self.settlement(&tx, unit_id).await?),
            _ => None,
        };

        self.stores.transactions.store(tx.clone()).await?;
        if let Some(settlement) = &settlement
            && let Err(err) = self.apply_settlement(&tx, settlement, now).await
        {
            self.roll_back(pending, settlement).await;
            return Err(err);
        }

        info!(tx_id = %tx.id, approver, "transaction approved");
        Ok(Approval {
            settled_statement: settlement.as_ref().and_then(|s| s.plan.statement_id),
            credit_added: settlement
                .as_ref()
                .and_then(|s| s.credit.map(|c| c.value())),
            transaction: tx,
        })
    }

    /// Works out what approving a unit payment changes, without writing.
    async fn settlement(&self, tx: &Transaction, unit_id: UnitId) -> Result<Settlement> {
        let open = self.stores.statements.open_for_unit(tx.org_id, unit_id).await?;
        let charged = penalty_total(tx, None);
        let accrued: Decimal = self
            .assess(tx.org_id, &open, tx.transaction_date)
            .await?
            .iter()
            .map(|p| p.amount)
            .sum();
        if accrued != charged {
            return Err(LedgerError::ValidationError(format!(
                "Penalties of unit {unit_id} changed from {charged} to {accrued} since the entry was recorded"
            )));
        }
        let plan = plan_payment(open.first(), charged, tx.net_amount, tx.payment_type)?;

        let mut statements = Vec::new();
        for before in open {
            let collected = penalty_total(tx, Some(before.id));
            let settles = plan.statement_id == Some(before.id);
            if !settles && collected.is_zero() {
                continue;
            }
            let mut after = before.clone();
            if collected > Decimal::ZERO {
                after.mark_penalty_assessed(collected);
            }
            if settles {
                after.record_payment(plan.amount_due, tx.transaction_date, Some(tx.id));
            }
            statements.push((before, after));
        }

        let credit = if plan.credit_to_add > Decimal::ZERO {
            Some(Amount::new(plan.credit_to_add)?)
        } else {
            None
        };
        Ok(Settlement {
            unit_id,
            plan,
            statements,
            credit,
        })
    }

    async fn apply_settlement(
        &self,
        tx: &Transaction,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for (_, after) in &settlement.statements {
            self.stores.statements.store(after.clone()).await?;
        }
        // last, so a failure never leaves credit to take back
        if let Some(amount) = settlement.credit {
            let movement = CreditMovement::deposit(amount, Some(tx.id), now)
                .with_description(format!("Advance payment credit from transaction {}", tx.id));
            let credit = self
                .stores
                .credits
                .apply(tx.org_id, settlement.unit_id, movement)
                .await?;
            info!(
                unit = settlement.unit_id,
                added = %amount,
                balance = %credit.balance,
                "credit deposited"
            );
        }
        Ok(())
    }

    async fn roll_back(&self, pending: Transaction, settlement: &Settlement) {
        for (before, _) in &settlement.statements {
            if let Err(err) = self.stores.statements.store(before.clone()).await {
                error!(statement = %before.id, error = %err, "failed to restore statement");
            }
        }
        let tx_id = pending.id;
        if let Err(err) = self.stores.transactions.store(pending).await {
            error!(tx_id = %tx_id, error = %err, "failed to restore transaction");
        }
        warn!(tx_id = %tx_id, "approval rolled back");
    }

    /// Takes income the system itself collects straight to posted, bypassing
    /// the staff workflow. Nothing is stored yet.
    pub(crate) fn approve_system_income(mut tx: Transaction, now: DateTime<Utc>) -> Result<Transaction> {
        tx.submit(now)?;
        tx.approve(SYSTEM_USER, now)?;
        Ok(tx)
    }

    pub(crate) async fn post_system_income(&self, tx: &Transaction) -> Result<()> {
        self.stores.transactions.store(tx.clone()).await?;
        info!(tx_id = %tx.id, category = %tx.category, amount = %tx.net_amount, "income posted");
        Ok(())
    }

    pub async fn credit_balance(&self, org_id: OrgId, unit_id: UnitId) -> Result<Balance> {
        Ok(self
            .stores
            .credits
            .get(org_id, unit_id)
            .await?
            .map_or(Balance::ZERO, |c| c.balance))
    }

    pub async fn credit_history(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        limit: usize,
    ) -> Result<Vec<CreditEntry>> {
        Ok(self
            .stores
            .credits
            .get(org_id, unit_id)
            .await?
            .map(|c| c.recent_history(limit))
            .unwrap_or_default())
    }

    /// Deposits credit backed by a posted income transaction of the unit.
    pub async fn add_credit(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        amount: Amount,
        tx_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<UnitCredit> {
        let _guard = self.lock().await;
        let tx = self.get(tx_id).await?;
        if !tx.is_posted() || tx.r#type != TransactionType::Income || tx.unit_id != Some(unit_id) {
            return Err(LedgerError::ValidationError(format!(
                "Credit needs a posted income transaction of unit {unit_id}"
            )));
        }
        self.stores
            .credits
            .apply(org_id, unit_id, CreditMovement::deposit(amount, Some(tx_id), now))
            .await
    }

    /// Takes credit off a unit's balance. Refused when the balance is short.
    pub async fn deduct_credit(
        &self,
        org_id: OrgId,
        unit_id: UnitId,
        amount: Amount,
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<UnitCredit> {
        let _guard = self.lock().await;
        self.stores
            .credits
            .apply(
                org_id,
                unit_id,
                CreditMovement::deduction(amount, now).with_description(description),
            )
            .await
    }

    /// Totals of posted income and expenses between two dates, inclusive.
    /// Dues settled from credit are left out of income: the cash was counted
    /// when the credit was deposited.
    pub async fn period_summary(
        &self,
        org_id: OrgId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<LedgerSummary> {
        let filter = TransactionFilter {
            start_date: Some(start),
            end_date: Some(end),
            status: Some(TransactionStatus::Approved),
            ..TransactionFilter::default()
        };
        let posted = self.stores.transactions.list(org_id, &filter).await?;

        let mut summary = LedgerSummary::default();
        for tx in posted.into_iter().filter(|tx| tx.payment_type != PaymentType::Credit) {
            let (total, by_category) = match tx.r#type {
                TransactionType::Income => (&mut summary.income, &mut summary.income_by_category),
                TransactionType::Expense => (&mut summary.expense, &mut summary.expense_by_category),
            };
            *total += tx.net_amount;
            *by_category.entry(tx.category.clone()).or_default() += tx.net_amount;
        }
        summary.net = summary.income - summary.expense;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::discount::{Discount, DiscountKind};
    use crate::domain::penalty::{PenaltyBasis, PenaltyPolicy};
    use crate::domain::statement::{BillingPeriod, StatementStatus};
    use crate::infrastructure::faulty::FaultyCreditStore;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn amount(value: Decimal) -> Amount {
        Amount::new(value).unwrap()
    }

    async fn service_with_statement(base: Decimal) -> (LedgerService, DuesStatement) {
        let service = LedgerService::new(Stores::in_memory());
        let statement = DuesStatement::new(
            1,
            10,
            BillingPeriod { year: 2024, month: 1 },
            base,
            Decimal::ZERO,
            Decimal::ZERO,
            date(2024, 1, 5),
        );
        service.stores().statements.store(statement.clone()).await.unwrap();
        (service, statement)
    }

    async fn record_and_approve(service: &LedgerService, request: IncomeRequest) -> Approval {
        let (tx, _) = service.record_income(request, Utc::now()).await.unwrap();
        service.submit_for_approval(tx.id, Utc::now()).await.unwrap();
        service.approve(tx.id, 7, Utc::now()).await.unwrap()
    }

    #[test]
    fn test_plan_payment_rules() {
        let statement = DuesStatement::new(
            1,
            10,
            BillingPeriod { year: 2024, month: 1 },
            dec!(1500),
            Decimal::ZERO,
            Decimal::ZERO,
            date(2024, 1, 5),
        );
        let open = Some(&statement);

        assert!(plan_payment(open, Decimal::ZERO, dec!(1500), PaymentType::Exact).is_ok());
        assert!(matches!(
            plan_payment(open, Decimal::ZERO, dec!(2000), PaymentType::Exact),
            Err(LedgerError::Overcollection { .. })
        ));
        assert!(matches!(
            plan_payment(open, Decimal::ZERO, dec!(1000), PaymentType::Advance),
            Err(LedgerError::Underpayment { .. })
        ));
        let plan = plan_payment(open, Decimal::ZERO, dec!(2000), PaymentType::Advance).unwrap();
        assert_eq!(plan.credit_to_add, dec!(500));

        assert!(matches!(
            plan_payment(None, Decimal::ZERO, dec!(100), PaymentType::Exact),
            Err(LedgerError::NoOutstandingDues)
        ));
        let plan = plan_payment(None, Decimal::ZERO, dec!(100), PaymentType::Advance).unwrap();
        assert_eq!(plan.credit_to_add, dec!(100));
        assert_eq!(plan.statement_id, None);
    }

    #[test]
    fn test_plan_payment_counts_pending_penalties() {
        let statement = DuesStatement::new(
            1,
            10,
            BillingPeriod { year: 2024, month: 1 },
            dec!(1000),
            Decimal::ZERO,
            Decimal::ZERO,
            date(2024, 1, 5),
        );
        let open = Some(&statement);

        let plan = plan_payment(open, dec!(40), dec!(1040), PaymentType::Exact).unwrap();
        assert_eq!(plan.amount_due, dec!(1000));
        assert_eq!(plan.total_due(), dec!(1040));
        assert_eq!(plan.credit_to_add, Decimal::ZERO);

        assert!(matches!(
            plan_payment(open, dec!(40), dec!(1000), PaymentType::Exact),
            Err(LedgerError::Underpayment { due, received }) if due == dec!(1040) && received == dec!(1000)
        ));
        let plan = plan_payment(open, dec!(40), dec!(1100), PaymentType::Advance).unwrap();
        assert_eq!(plan.credit_to_add, dec!(60));
    }

    #[tokio::test]
    async fn test_exact_payment_settles_statement() {
        let (service, statement) = service_with_statement(dec!(1500)).await;
        let request = IncomeRequest::dues(1, 10, amount(dec!(1500)), PaymentType::Exact, date(2024, 1, 5));

        let approval = record_and_approve(&service, request).await;

        assert_eq!(approval.settled_statement, Some(statement.id));
        assert_eq!(approval.credit_added, None);
        let stored = service.stores().statements.get(statement.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StatementStatus::Paid);
        assert_eq!(stored.payment_transaction_id, Some(approval.transaction.id));
    }

    #[tokio::test]
    async fn test_advance_payment_adds_excess_as_credit() {
        let (service, _) = service_with_statement(dec!(1500)).await;
        let request = IncomeRequest::dues(1, 10, amount(dec!(2000)), PaymentType::Advance, date(2024, 1, 5));

        let (tx, credit_to_add) = service.record_income(request, Utc::now()).await.unwrap();
        assert_eq!(credit_to_add, Some(dec!(500)));
        // nothing moves before approval
        assert_eq!(service.credit_balance(1, 10).await.unwrap(), Balance::ZERO);

        service.submit_for_approval(tx.id, Utc::now()).await.unwrap();
        let approval = service.approve(tx.id, 7, Utc::now()).await.unwrap();

        assert_eq!(approval.credit_added, Some(dec!(500)));
        assert_eq!(service.credit_balance(1, 10).await.unwrap(), Balance::new(dec!(500)));
        let history = service.credit_history(1, 10, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].transaction_id, Some(tx.id));
    }

    #[tokio::test]
    async fn test_exact_payment_refused_without_dues() {
        let service = LedgerService::new(Stores::in_memory());
        let request = IncomeRequest::dues(1, 10, amount(dec!(100)), PaymentType::Exact, date(2024, 1, 5));
        assert!(matches!(
            service.record_income(request, Utc::now()).await,
            Err(LedgerError::NoOutstandingDues)
        ));
        assert!(service
            .list_transactions(1, &TransactionFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_approval_revalidates_against_current_dues() {
        let (service, _) = service_with_statement(dec!(1500)).await;
        let first = IncomeRequest::dues(1, 10, amount(dec!(1500)), PaymentType::Exact, date(2024, 1, 5));
        let second = first.clone();

        let (tx_a, _) = service.record_income(first, Utc::now()).await.unwrap();
        let (tx_b, _) = service.record_income(second, Utc::now()).await.unwrap();
        service.submit_for_approval(tx_a.id, Utc::now()).await.unwrap();
        service.submit_for_approval(tx_b.id, Utc::now()).await.unwrap();
        service.approve(tx_a.id, 7, Utc::now()).await.unwrap();

        assert!(matches!(
            service.approve(tx_b.id, 7, Utc::now()).await,
            Err(LedgerError::NoOutstandingDues)
        ));
        assert_eq!(service.get(tx_b.id).await.unwrap().status, TransactionStatus::Pending);
    }

    async fn put_late_policy(service: &LedgerService) {
        service
            .stores()
            .policies
            .put_penalty_policy(PenaltyPolicy::new(1, PenaltyBasis::Percent, dec!(2), 15).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_penalties_collected_once() {
        let (service, statement) = service_with_statement(dec!(1000)).await;
        put_late_policy(&service).await;

        let late = date(2024, 3, 21);
        let pending = service.pending_penalties(1, 10, late).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount, dec!(40.00));
        assert_eq!(pending[0].months_overdue, 2);

        let plan = service
            .validate_payment(1, 10, amount(dec!(1000)), PaymentType::Exact, late)
            .await
            .unwrap();
        assert_eq!(plan.total_due(), dec!(1040.00));

        let request = IncomeRequest::dues(1, 10, amount(dec!(1000)), PaymentType::Exact, late);
        let breakdown = service.preview_breakdown(&request).await.unwrap();
        assert_eq!(breakdown.net_amount, dec!(1040.00));
        assert_eq!(breakdown.plan.as_ref().unwrap().total_due(), breakdown.net_amount);

        let approval = record_and_approve(&service, request).await;
        assert_eq!(approval.transaction.net_amount, dec!(1040.00));
        assert_eq!(approval.credit_added, None);

        let stored = service.stores().statements.get(statement.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StatementStatus::Paid);
        assert_eq!(stored.amount_paid, dec!(1000));
        assert_eq!(stored.penalty_assessed, dec!(40.00));
        assert_eq!(stored.amount_paid + stored.penalty_assessed, approval.transaction.net_amount);
        assert!(service.pending_penalties(1, 10, late).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_penalties_changed_before_approval_are_not_charged_twice() {
        let (service, statement) = service_with_statement(dec!(1000)).await;
        put_late_policy(&service).await;
        let late = date(2024, 3, 21);

        let request = IncomeRequest::dues(1, 10, amount(dec!(1000)), PaymentType::Exact, late);
        let (tx, _) = service.record_income(request, Utc::now()).await.unwrap();
        service.submit_for_approval(tx.id, Utc::now()).await.unwrap();

        // a billing run carries the same penalty into a newer statement
        let mut carried = statement.clone();
        carried.mark_penalty_assessed(dec!(40));
        service.stores().statements.store(carried).await.unwrap();

        assert!(matches!(
            service.approve(tx.id, 7, Utc::now()).await,
            Err(LedgerError::ValidationError(_))
        ));
        let stored = service.stores().statements.get(statement.id).await.unwrap().unwrap();
        assert_eq!(stored.penalty_assessed, dec!(40));
        assert_eq!(stored.amount_paid, Decimal::ZERO);
        assert_eq!(service.get(tx.id).await.unwrap().status, TransactionStatus::Pending);
    }

    async fn put_annual_discount(service: &LedgerService) {
        let discount = Discount::new(
            3,
            1,
            "Annual prepay",
            DiscountKind::Percentage,
            dec!(10),
            12,
            None,
            None,
            date(2024, 1, 1),
        )
        .unwrap();
        service.stores().policies.put_discount(discount).await.unwrap();
    }

    #[tokio::test]
    async fn test_breakdown_with_discount() {
        let (service, _) = service_with_statement(dec!(1500)).await;
        put_annual_discount(&service).await;

        let mut request =
            IncomeRequest::dues(1, 10, amount(dec!(18000)), PaymentType::Advance, date(2024, 1, 5));
        request.discount_id = Some(3);
        request.months = 12;

        let breakdown = service.preview_breakdown(&request).await.unwrap();
        assert_eq!(breakdown.discount.as_ref().unwrap().reduction, dec!(1800.00));
        assert_eq!(breakdown.net_amount, dec!(16200.00));
        // credit is what is left of the net after the dues are settled
        assert_eq!(breakdown.credit_to_add(), Some(dec!(14700.00)));

        request.months = 6;
        assert!(matches!(
            service.preview_breakdown(&request).await,
            Err(LedgerError::DiscountNotEligible { required: 12, months: 6, .. })
        ));
    }

    #[tokio::test]
    async fn test_approved_payment_reconciles_with_net_amount() {
        let (service, statement) = service_with_statement(dec!(1000)).await;
        put_late_policy(&service).await;
        put_annual_discount(&service).await;

        let late = date(2024, 3, 21);
        let mut request = IncomeRequest::dues(1, 10, amount(dec!(12000)), PaymentType::Advance, late);
        request.discount_id = Some(3);
        request.months = 12;

        let (tx, credit_to_add) = service.record_income(request, Utc::now()).await.unwrap();
        // 12000 + 40 penalty - 1200 discount
        assert_eq!(tx.net_amount, dec!(10840.00));
        assert_eq!(credit_to_add, Some(dec!(9800.00)));

        service.submit_for_approval(tx.id, Utc::now()).await.unwrap();
        let approval = service.approve(tx.id, 7, Utc::now()).await.unwrap();
        assert_eq!(approval.settled_statement, Some(statement.id));
        assert_eq!(approval.credit_added, Some(dec!(9800.00)));

        let stored = service.stores().statements.get(statement.id).await.unwrap().unwrap();
        let credit = service.credit_balance(1, 10).await.unwrap();
        assert_eq!(stored.status, StatementStatus::Paid);
        assert_eq!(
            stored.amount_paid + stored.penalty_assessed + credit.value(),
            approval.transaction.net_amount
        );

        let summary = service.period_summary(1, date(2024, 3, 1), date(2024, 3, 31)).await.unwrap();
        assert_eq!(summary.income, dec!(10840.00));
    }

    #[tokio::test]
    async fn test_failed_credit_write_rolls_back_approval() {
        let credits = Arc::new(FaultyCreditStore::new());
        let mut stores = Stores::in_memory();
        stores.credits = credits.clone();
        let service = LedgerService::new(stores);
        let statement = DuesStatement::new(
            1,
            10,
            BillingPeriod { year: 2024, month: 1 },
            dec!(1500),
            Decimal::ZERO,
            Decimal::ZERO,
            date(2024, 1, 5),
        );
        service.stores().statements.store(statement.clone()).await.unwrap();

        let request = IncomeRequest::dues(1, 10, amount(dec!(2000)), PaymentType::Advance, date(2024, 1, 5));
        let (tx, _) = service.record_income(request, Utc::now()).await.unwrap();
        service.submit_for_approval(tx.id, Utc::now()).await.unwrap();

        credits.fail_writes(true);
        assert!(matches!(
            service.approve(tx.id, 7, Utc::now()).await,
            Err(LedgerError::InternalError(_))
        ));
        assert_eq!(service.get(tx.id).await.unwrap().status, TransactionStatus::Pending);
        let stored = service.stores().statements.get(statement.id).await.unwrap().unwrap();
        assert_eq!(stored.status, StatementStatus::Unpaid);
        assert_eq!(stored.amount_paid, Decimal::ZERO);

        credits.fail_writes(false);
        let approval = service.approve(tx.id, 7, Utc::now()).await.unwrap();
        assert_eq!(approval.credit_added, Some(dec!(500)));
        assert_eq!(service.credit_balance(1, 10).await.unwrap(), Balance::new(dec!(500)));
    }

    #[tokio::test]
    async fn test_credit_is_kept_per_organization() {
        let service = LedgerService::new(Stores::in_memory());
        let request = IncomeRequest::dues(1, 10, amount(dec!(300)), PaymentType::Advance, date(2024, 2, 1));
        record_and_approve(&service, request).await;

        assert_eq!(service.credit_balance(1, 10).await.unwrap(), Balance::new(dec!(300)));
        assert_eq!(service.credit_balance(2, 10).await.unwrap(), Balance::ZERO);
        assert!(service.credit_history(2, 10, 10).await.unwrap().is_empty());
        assert!(matches!(
            service.deduct_credit(2, 10, amount(dec!(100)), "dues", Utc::now()).await,
            Err(LedgerError::InsufficientCredit { .. })
        ));
        assert_eq!(service.credit_balance(1, 10).await.unwrap(), Balance::new(dec!(300)));
    }

    #[tokio::test]
    async fn test_reject_then_cancel() {
        let service = LedgerService::new(Stores::in_memory());
        let tx = service
            .record_expense(
                ExpenseRequest {
                    org_id: 1,
                    unit_id: None,
                    asset_id: None,
                    amount: amount(dec!(250)),
                    category: "Maintenance".to_string(),
                    description: "Pool pump".to_string(),
                    transaction_date: date(2024, 2, 1),
                    requires_receipt: false,
                    created_by: Some(4),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        service.submit_for_approval(tx.id, Utc::now()).await.unwrap();
        let rejected = service.reject(tx.id, "missing quote", Utc::now()).await.unwrap();
        assert_eq!(rejected.status, TransactionStatus::Draft);
        let cancelled = service.cancel(tx.id, "duplicate", Utc::now()).await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
        assert!(cancelled.description.contains("[REJECTED: missing quote]"));
        assert!(cancelled.description.contains("[CANCELLED: duplicate]"));
    }

    #[tokio::test]
    async fn test_period_summary_counts_posted_only() {
        let service = LedgerService::new(Stores::in_memory());
        let expense = |value: Decimal, category: &str| ExpenseRequest {
            org_id: 1,
            unit_id: None,
            asset_id: None,
            amount: amount(value),
            category: category.to_string(),
            description: String::new(),
            transaction_date: date(2024, 2, 10),
            requires_receipt: false,
            created_by: None,
        };

        let posted = service.record_expense(expense(dec!(300), "Utilities"), Utc::now()).await.unwrap();
        service.submit_for_approval(posted.id, Utc::now()).await.unwrap();
        service.approve(posted.id, 1, Utc::now()).await.unwrap();
        service.record_expense(expense(dec!(999), "Utilities"), Utc::now()).await.unwrap();

        let advance = IncomeRequest::dues(1, 10, amount(dec!(700)), PaymentType::Advance, date(2024, 2, 12));
        record_and_approve(&service, advance).await;

        let summary = service.period_summary(1, date(2024, 2, 1), date(2024, 2, 29)).await.unwrap();
        assert_eq!(summary.income, dec!(700));
        assert_eq!(summary.expense, dec!(300));
        assert_eq!(summary.net, dec!(400));
        assert_eq!(summary.expense_by_category.get("Utilities"), Some(&dec!(300)));
    }

    #[tokio::test]
    async fn test_add_credit_requires_posted_income() {
        let service = LedgerService::new(Stores::in_memory());
        let request = IncomeRequest::dues(1, 10, amount(dec!(200)), PaymentType::Advance, date(2024, 2, 1));
        let (draft, _) = service.record_income(request, Utc::now()).await.unwrap();

        assert!(matches!(
            service.add_credit(1, 10, amount(dec!(50)), draft.id, Utc::now()).await,
            Err(LedgerError::ValidationError(_))
        ));
        assert!(matches!(
            service.deduct_credit(1, 10, amount(dec!(50)), "test", Utc::now()).await,
            Err(LedgerError::InsufficientCredit { .. })
        ));
    }
}
