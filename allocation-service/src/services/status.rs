//! Invoice status calculator.

use crate::models::InvoiceStatus;
use chrono::NaiveDate;
use rust_decimal::Decimal;

/// Fraction of the invoice amount that counts as fully paid (absorbs rounding).
pub fn paid_tolerance() -> Decimal {
    Decimal::new(999, 3)
}

/// Derive an invoice's status from its amount and the sum of its allocations.
///
/// `paid` at ≥ 99.9% of the amount, `partial` for any smaller positive sum,
/// otherwise `overdue` once the due date has passed and `unpaid` before that.
pub fn calculate_status(
    amount: Decimal,
    allocated: Decimal,
    due_date: Option<NaiveDate>,
    today: NaiveDate,
) -> InvoiceStatus {
    let paid_floor = amount * paid_tolerance();
    if allocated >= paid_floor {
        InvoiceStatus::Paid
    } else if allocated > Decimal::ZERO {
        InvoiceStatus::Partial
    } else if due_date.is_some_and(|due| due < today) {
        InvoiceStatus::Overdue
    } else {
        InvoiceStatus::Unpaid
    }
}

/// Amount still payable on an invoice.
pub fn remaining_balance(amount: Decimal, allocated: Decimal) -> Decimal {
    (amount - allocated).max(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn day(y: i32, m: u32, dd: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, dd).unwrap()
    }

    #[test]
    fn fully_allocated_is_paid() {
        let status = calculate_status(d("1000"), d("1000"), None, day(2026, 1, 1));
        assert_eq!(status, InvoiceStatus::Paid);
    }

    #[test]
    fn rounding_shortfall_within_tolerance_is_paid() {
        let status = calculate_status(d("1000"), d("999.00"), None, day(2026, 1, 1));
        assert_eq!(status, InvoiceStatus::Paid);
    }

    #[test]
    fn just_below_tolerance_is_partial() {
        let status = calculate_status(d("1000"), d("998.99"), None, day(2026, 1, 1));
        assert_eq!(status, InvoiceStatus::Partial);
    }

    #[test]
    fn partial_wins_over_overdue() {
        let status = calculate_status(d("500"), d("200"), Some(day(2025, 1, 1)), day(2026, 1, 1));
        assert_eq!(status, InvoiceStatus::Partial);
    }

    #[test]
    fn nothing_paid_after_due_date_is_overdue() {
        let status = calculate_status(d("500"), Decimal::ZERO, Some(day(2025, 12, 31)), day(2026, 1, 1));
        assert_eq!(status, InvoiceStatus::Overdue);
    }

    #[test]
    fn due_today_is_not_overdue() {
        let status = calculate_status(d("500"), Decimal::ZERO, Some(day(2026, 1, 1)), day(2026, 1, 1));
        assert_eq!(status, InvoiceStatus::Unpaid);
    }

    #[test]
    fn no_due_date_is_unpaid() {
        let status = calculate_status(d("500"), Decimal::ZERO, None, day(2026, 1, 1));
        assert_eq!(status, InvoiceStatus::Unpaid);
    }

    #[test]
    fn remaining_never_negative() {
        assert_eq!(remaining_balance(d("100"), d("150")), Decimal::ZERO);
        assert_eq!(remaining_balance(d("100"), d("40")), d("60"));
    }
}
