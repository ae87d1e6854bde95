use chrono::NaiveDate;

use crate::config::PenaltyPolicy;
use crate::money::Money;
use crate::types::Bill;

/// result of a penalty recalculation pass (spec.md §4.7)
#[derive(Debug, Clone)]
pub struct RecalcResult {
    pub updated_bills: Vec<Bill>,
    pub total_penalties_added: Money,
    pub bills_updated: u32,
}

/// whole months elapsed between two dates, counting only complete
/// month boundaries crossed (a day-of-month still short of `from`'s
/// day does not count as a full month).
fn whole_months_between(from: NaiveDate, to: NaiveDate) -> i64 {
    if to <= from {
        return 0;
    }
    let mut months = (to.year() - from.year()) as i64 * 12 + (to.month() as i64 - from.month() as i64);
    if to.day() < from.day() {
        months -= 1;
    }
    months.max(0)
}

/// pure recalculation of compounding monthly penalties on overdue base
/// balances (spec.md §4.7). reconstitutes from the stored bills passed in
/// rather than trusting any cached total; deterministic (two runs over
/// the same inputs produce identical outputs).
///
/// grounded on the teacher's grace-period penalty engine combined with its
/// monthly compounding loop: each elapsed month accrues
/// `round(principal * penaltyRate)` into the penalty total and folds it
/// back into the principal before the next month's accrual.
pub fn recalculate(bills: Vec<Bill>, as_of: NaiveDate, policy: &PenaltyPolicy) -> RecalcResult {
    let mut updated_bills = Vec::with_capacity(bills.len());
    let mut total_penalties_added = Money::ZERO;
    let mut bills_updated = 0u32;

    for mut bill in bills {
        let grace_cutoff = bill.due_date + policy.grace_period();
        let base_owed = bill.base_owed();

        if grace_cutoff >= as_of || !base_owed.is_positive() {
            // within grace period, or fully paid: preserve the stored
            // penalty amount. it may represent historical penalty already
            // satisfied by `penaltyPaid`.
            updated_bills.push(bill);
            continue;
        }

        let months_elapsed = whole_months_between(grace_cutoff, as_of);
        if months_elapsed == 0 {
            updated_bills.push(bill);
            continue;
        }

        let mut principal = base_owed;
        let mut accrued_penalty = Money::ZERO;
        for _ in 0..months_elapsed {
            let monthly_penalty = principal * policy.penalty_rate;
            accrued_penalty += monthly_penalty;
            principal += monthly_penalty;
        }

        if accrued_penalty != bill.penalty_amount {
            total_penalties_added += accrued_penalty - bill.penalty_amount;
            bill.penalty_amount = accrued_penalty;
            bills_updated += 1;
        }
        updated_bills.push(bill);
    }

    RecalcResult { updated_bills, total_penalties_added, bills_updated }
}
