use super::money::round_cents;
use super::{DiscountId, OrgId};
use crate::error::{LedgerError, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Percentage,
    Flat,
}

/// A configured discount.
///
/// Construction goes through [`Discount::new`], which rejects configurations
/// that could never apply (non-positive value, percentages over 100, inverted
/// or already-ended validity windows).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    pub id: DiscountId,
    pub org_id: OrgId,
    pub name: String,
    pub kind: DiscountKind,
    /// Percentage points for `Percentage`, currency for `Flat`.
    pub value: Decimal,
    /// Minimum number of months paid in one go to qualify.
    pub min_months: u32,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
    /// Categories the discount applies to. Empty means every category.
    pub categories: Vec<String>,
    pub active: bool,
}

/// Result of applying a discount to a base amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountApplication {
    pub discount_id: DiscountId,
    pub name: String,
    pub base: Decimal,
    pub reduction: Decimal,
    pub reduced: Decimal,
}

impl Discount {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: DiscountId,
        org_id: OrgId,
        name: impl Into<String>,
        kind: DiscountKind,
        value: Decimal,
        min_months: u32,
        valid_from: Option<NaiveDate>,
        valid_until: Option<NaiveDate>,
        configured_on: NaiveDate,
    ) -> Result<Self> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::ConfigError(
                "discount value must be positive".to_string(),
            ));
        }
        if kind == DiscountKind::Percentage && value > Decimal::ONE_HUNDRED {
            return Err(LedgerError::ConfigError(format!(
                "percentage discount cannot exceed 100: {value}"
            )));
        }
        if let (Some(from), Some(until)) = (valid_from, valid_until)
            && from > until
        {
            return Err(LedgerError::ConfigError(format!(
                "discount window starts {from} after it ends {until}"
            )));
        }
        if let Some(until) = valid_until
            && until < configured_on
        {
            return Err(LedgerError::ConfigError(format!(
                "discount window already ended on {until}"
            )));
        }

        Ok(Self {
            id,
            org_id,
            name: name.into(),
            kind,
            value,
            min_months,
            valid_from,
            valid_until,
            categories: Vec::new(),
            active: true,
        })
    }

    /// Restricts the discount to the given categories.
    pub fn for_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_within_window(&self, on: NaiveDate) -> bool {
        self.valid_from.is_none_or(|from| from <= on) && self.valid_until.is_none_or(|until| on <= until)
    }

    pub fn covers_category(&self, category: Option<&str>) -> bool {
        match category {
            Some(category) if !self.categories.is_empty() => {
                self.categories.iter().any(|c| c.eq_ignore_ascii_case(category))
            }
            _ => true,
        }
    }

    /// Amount this discount takes off `base`, never more than `base` itself.
    pub fn reduction_for(&self, base: Decimal) -> Decimal {
        let raw = match self.kind {
            DiscountKind::Percentage => round_cents(base * self.value / Decimal::ONE_HUNDRED),
            DiscountKind::Flat => self.value,
        };
        raw.min(base).max(Decimal::ZERO)
    }

    /// Applies the discount to `base` for a payment covering `months` months.
    pub fn apply(&self, base: Decimal, months: u32, on: NaiveDate) -> Result<DiscountApplication> {
        if !self.active || !self.is_within_window(on) {
            return Err(LedgerError::DiscountOutsideWindow { id: self.id });
        }
        if months < self.min_months {
            return Err(LedgerError::DiscountNotEligible {
                id: self.id,
                required: self.min_months,
                months,
            });
        }
        let reduction = self.reduction_for(base);
        Ok(DiscountApplication {
            discount_id: self.id,
            name: self.name.clone(),
            base,
            reduction,
            reduced: base - reduction,
        })
    }

    /// Soft-deletes the discount.
    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Picks the single discount to apply.
///
/// Only active, in-window, eligible discounts covering `category` are
/// considered. The largest reduction wins; ties go to the lowest id.
pub fn select_best<'a, I>(
    discounts: I,
    base: Decimal,
    months: u32,
    category: Option<&str>,
    on: NaiveDate,
) -> Option<DiscountApplication>
where
    I: IntoIterator<Item = &'a Discount>,
{
    discounts
        .into_iter()
        .filter(|d| d.covers_category(category))
        .filter_map(|d| d.apply(base, months, on).ok())
        .min_by(|a, b| {
            b.reduction
                .cmp(&a.reduction)
                .then(a.discount_id.cmp(&b.discount_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn percentage(id: DiscountId, value: Decimal) -> Discount {
        Discount::new(
            id,
            1,
            format!("{value}% off"),
            DiscountKind::Percentage,
            value,
            1,
            None,
            None,
            date(2024, 1, 1),
        )
        .unwrap()
    }

    #[test]
    fn test_percentage_discount_reduces_base() {
        let discount = percentage(1, dec!(10));
        let applied = discount.apply(dec!(1500), 1, date(2024, 2, 1)).unwrap();
        assert_eq!(applied.reduction, dec!(150.00));
        assert_eq!(applied.reduced, dec!(1350.00));
    }

    #[test]
    fn test_flat_discount_is_capped_at_base() {
        let discount = Discount::new(
            2,
            1,
            "Senior",
            DiscountKind::Flat,
            dec!(200),
            1,
            None,
            None,
            date(2024, 1, 1),
        )
        .unwrap();
        let applied = discount.apply(dec!(150), 1, date(2024, 1, 2)).unwrap();
        assert_eq!(applied.reduction, dec!(150));
        assert_eq!(applied.reduced, Decimal::ZERO);
    }

    #[test]
    fn test_config_rejects_ended_window() {
        let result = Discount::new(
            3,
            1,
            "Holiday",
            DiscountKind::Flat,
            dec!(50),
            1,
            Some(date(2023, 12, 1)),
            Some(date(2023, 12, 31)),
            date(2024, 1, 15),
        );
        assert!(matches!(result, Err(LedgerError::ConfigError(_))));
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let today = date(2024, 1, 1);
        assert!(
            Discount::new(4, 1, "zero", DiscountKind::Flat, dec!(0), 1, None, None, today).is_err()
        );
        assert!(
            Discount::new(4, 1, "too much", DiscountKind::Percentage, dec!(101), 1, None, None, today)
                .is_err()
        );
        assert!(
            Discount::new(
                4,
                1,
                "inverted",
                DiscountKind::Flat,
                dec!(5),
                1,
                Some(date(2024, 3, 1)),
                Some(date(2024, 2, 1)),
                today
            )
            .is_err()
        );
    }

    #[test]
    fn test_apply_outside_window_is_rejected() {
        let discount = Discount::new(
            5,
            1,
            "Q1 promo",
            DiscountKind::Percentage,
            dec!(5),
            1,
            Some(date(2024, 1, 1)),
            Some(date(2024, 3, 31)),
            date(2024, 1, 1),
        )
        .unwrap();

        assert!(matches!(
            discount.apply(dec!(100), 1, date(2023, 12, 31)),
            Err(LedgerError::DiscountOutsideWindow { id: 5 })
        ));
        assert!(matches!(
            discount.apply(dec!(100), 1, date(2024, 4, 1)),
            Err(LedgerError::DiscountOutsideWindow { id: 5 })
        ));
        assert!(discount.apply(dec!(100), 1, date(2024, 3, 31)).is_ok());
    }

    #[test]
    fn test_apply_requires_minimum_months() {
        let mut discount = percentage(6, dec!(10));
        discount.min_months = 12;
        assert!(matches!(
            discount.apply(dec!(1200), 6, date(2024, 1, 1)),
            Err(LedgerError::DiscountNotEligible {
                required: 12,
                months: 6,
                ..
            })
        ));
        assert!(discount.apply(dec!(1200), 12, date(2024, 1, 1)).is_ok());
    }

    #[test]
    fn test_inactive_discount_never_applies() {
        let mut discount = percentage(7, dec!(10));
        discount.deactivate();
        assert!(discount.apply(dec!(100), 1, date(2024, 1, 1)).is_err());
    }

    #[test]
    fn test_select_best_applies_at_most_one() {
        let small = percentage(1, dec!(5));
        let large = percentage(2, dec!(15));
        let flat = Discount::new(
            3,
            1,
            "Flat 100",
            DiscountKind::Flat,
            dec!(100),
            1,
            None,
            None,
            date(2024, 1, 1),
        )
        .unwrap();

        let all = [small, large, flat];
        let best = select_best(&all, dec!(1000), 1, None, date(2024, 1, 1)).unwrap();
        assert_eq!(best.discount_id, 2);
        assert_eq!(best.reduced, dec!(850.00));
    }

    #[test]
    fn test_select_best_ties_prefer_lowest_id() {
        let all = [percentage(9, dec!(10)), percentage(4, dec!(10))];
        let best = select_best(&all, dec!(100), 1, None, date(2024, 1, 1)).unwrap();
        assert_eq!(best.discount_id, 4);
    }

    #[test]
    fn test_select_best_filters_categories_and_eligibility() {
        let rental_only = percentage(1, dec!(50)).for_categories(["Rental Income"]);
        let mut yearly = percentage(2, dec!(20));
        yearly.min_months = 12;

        let all = [rental_only, yearly];
        assert!(select_best(&all, dec!(100), 1, Some("Monthly Dues"), date(2024, 1, 1)).is_none());
        let best = select_best(&all, dec!(100), 1, Some("rental income"), date(2024, 1, 1)).unwrap();
        assert_eq!(best.discount_id, 1);
    }
}
