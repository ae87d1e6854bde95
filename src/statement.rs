use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapters::{DuesAdapter, WaterAdapter};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::credit::{CreditLedgerService, CreditSource};
use crate::errors::{BillingError, Result};
use crate::fiscal;
use crate::money::Money;
use crate::storage::{DocFilter, Storage};
use crate::types::{Bill, BillStatus, ModuleType, Transaction};

/// the kind of a statement line item (spec.md §4.8). used only to drive
/// sort order (`chargeBeforePayment` on a tied date, `penalty` after its
/// bill's `charge`) and column placement; it is not itself a priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemType {
    Charge,
    Penalty,
    Payment,
    CreditAdjustment,
}

fn sort_order(t: LineItemType) -> u8 {
    match t {
        LineItemType::Charge => 0,
        LineItemType::Penalty => 1,
        LineItemType::Payment => 2,
        LineItemType::CreditAdjustment => 2,
    }
}

/// one row of a statement's chronological line, with the running balance
/// after it was applied (spec.md §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub date: NaiveDate,
    pub description: String,
    pub charge: Money,
    pub payment: Money,
    pub balance: Money,
    pub item_type: LineItemType,
    pub category: String,
    pub transaction_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub expected_balance: Money,
    pub actual_balance: Money,
    pub discrepancy_centavos: i64,
    /// false when unpaid bills remain in the window: the tick-and-tie
    /// check is only meaningful once every bill is settled (spec.md §4.8).
    pub checked: bool,
}

/// the composed statement (spec.md §4.8, §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub opening_balance: Money,
    pub closing_balance: Money,
    pub line_items: Vec<LineItem>,
    pub reconciliation: Reconciliation,
}

/// one ungrouped candidate event before sorting, filtering, and balance
/// accumulation.
struct RawEvent {
    date: NaiveDate,
    item_type: LineItemType,
    description: String,
    category: String,
    charge: Money,
    payment: Money,
    signed_amount: Money,
    transaction_ref: Option<String>,
    /// `Some(module)` for bill-derived charge/penalty events, so the
    /// 15-day HOA preview window (spec.md §4.6.5/§4.8) can tell an HOA
    /// charge from a water charge; `None` for payments and manual credit
    /// entries, which are never filtered.
    source_module: Option<ModuleType>,
}

fn start_of_day_utc(date: NaiveDate, tz: chrono_tz::Tz) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is always a valid time");
    tz.from_local_datetime(&naive).earliest().expect("every calendar date has a resolvable local midnight").with_timezone(&Utc)
}

/// read-only reconstruction of a unit's chronological transaction history
/// with a running balance (spec.md §4.8). depends on both adapters, the
/// credit ledger, and the stored transactions: the only component that
/// reads across all of them.
///
/// grounded on the teacher's `FacilityView::from_facility` idiom: a
/// read-only projection assembled from the same stored state the mutating
/// components write, never itself persisted.
pub struct StatementComposer<'s> {
    storage: &'s dyn Storage,
    clock: &'s dyn Clock,
}

impl<'s> StatementComposer<'s> {
    pub fn new(storage: &'s dyn Storage, clock: &'s dyn Clock) -> Self {
        StatementComposer { storage, clock }
    }

    fn list_transactions_for_unit(&self, client_id: &str, unit_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let filter = DocFilter::FieldEquals { field: "unitId".to_string(), value: json!(unit_id) };
        let docs = self.storage.list_docs(&format!("clients/{}/transactions", client_id), Some(filter))?;
        let mut transactions = Vec::with_capacity(docs.len());
        for (_, value) in docs {
            let txn: Transaction = serde_json::from_value(value).map_err(|e| BillingError::Storage(e.to_string()))?;
            if txn.date >= start && txn.date < end {
                transactions.push(txn);
            }
        }
        transactions.sort_by_key(|t| t.date);
        Ok(transactions)
    }

    fn bill_charge_events(bills: &[Bill], module: ModuleType, charge_label: &str, penalty_label: &str) -> Vec<RawEvent> {
        let mut events = Vec::new();
        for bill in bills {
            if bill.base_charge.is_positive() {
                events.push(RawEvent {
                    date: bill.due_date,
                    item_type: LineItemType::Charge,
                    description: format!("{} ({})", charge_label, bill.period),
                    category: match module {
                        ModuleType::Hoa => "hoa_dues".to_string(),
                        ModuleType::Water => "water_consumption".to_string(),
                    },
                    charge: bill.base_charge,
                    payment: Money::ZERO,
                    signed_amount: bill.base_charge,
                    transaction_ref: None,
                    source_module: Some(module),
                });
            }
            if bill.penalty_amount.is_positive() {
                events.push(RawEvent {
                    date: bill.due_date,
                    item_type: LineItemType::Penalty,
                    description: format!("{} ({})", penalty_label, bill.period),
                    category: match module {
                        ModuleType::Hoa => "hoa_penalties".to_string(),
                        ModuleType::Water => "water_penalties".to_string(),
                    },
                    charge: bill.penalty_amount,
                    payment: Money::ZERO,
                    signed_amount: bill.penalty_amount,
                    transaction_ref: None,
                    source_module: Some(module),
                });
            }
        }
        events
    }

    /// produce the chronological line-item stream for `unitId` over
    /// `fiscalYear`, with a running balance (spec.md §4.8).
    ///
    /// `exclude_future_bills`, when set, drops bill-derived charge/penalty
    /// events dated after today except HOA charges within the 15-day
    /// preview window before their due date; payments and manual credit
    /// entries are never filtered (spec.md §4.8 step 5).
    pub fn compose(&self, client_id: &str, unit_id: &str, config: &ClientConfig, fiscal_year: i32, exclude_future_bills: bool) -> Result<Statement> {
        let (fy_start, fy_end) = fiscal::fiscal_year_bounds(fiscal_year, config.fiscal_year_start_month);
        let fy_start_utc = start_of_day_utc(fy_start, config.timezone);
        let fy_end_utc = start_of_day_utc(fy_end, config.timezone);
        let today = fiscal::local_date(self.clock.now(), config.timezone);

        let dues_adapter = DuesAdapter::new(self.storage);
        let water_adapter = WaterAdapter::new(self.storage);
        let credit_ledger = CreditLedgerService::new(self.storage);

        let hoa_bills = dues_adapter.materialize_bills(client_id, unit_id, fiscal_year, config)?;
        let hoa_recalc = crate::penalty::recalculate(hoa_bills, today, &config.hoa_penalty);

        let water_bills = water_adapter.bills_for_unit_in_range(client_id, unit_id, fy_start, fy_end)?;
        let water_recalc = crate::penalty::recalculate(water_bills, today, &config.water.penalty);

        let unpaid_bills_remain =
            hoa_recalc.updated_bills.iter().any(|b| b.status() != BillStatus::Paid) || water_recalc.updated_bills.iter().any(|b| b.status() != BillStatus::Paid);

        let mut events = Self::bill_charge_events(&hoa_recalc.updated_bills, ModuleType::Hoa, "HOA dues", "HOA penalty");
        events.extend(Self::bill_charge_events(&water_recalc.updated_bills, ModuleType::Water, "Water bill", "Water penalty"));

        for txn in self.list_transactions_for_unit(client_id, unit_id, fy_start_utc, fy_end_utc)? {
            let txn_date = fiscal::local_date(txn.date, config.timezone);
            for allocation in &txn.allocations {
                let (item_type, category, description) = match allocation {
                    crate::types::Allocation::HoaMonth { target_name, category_id, .. } => (LineItemType::Payment, category_id.clone(), format!("HOA payment ({})", target_name)),
                    crate::types::Allocation::HoaPenalty { target_name, category_id, .. } => (LineItemType::Payment, category_id.clone(), format!("HOA penalty payment ({})", target_name)),
                    crate::types::Allocation::WaterConsumption { target_name, category_id, .. } => {
                        (LineItemType::Payment, category_id.clone(), format!("Water payment ({})", target_name))
                    }
                    crate::types::Allocation::WaterPenalty { target_name, category_id, .. } => {
                        (LineItemType::Payment, category_id.clone(), format!("Water penalty payment ({})", target_name))
                    }
                    crate::types::Allocation::CreditAdded { .. } => (LineItemType::CreditAdjustment, "credit_added".to_string(), "Payment credit".to_string()),
                    crate::types::Allocation::CreditUsed { .. } => (LineItemType::CreditAdjustment, "credit_used".to_string(), "Credit applied".to_string()),
                };
                let amount = allocation.amount();
                events.push(RawEvent {
                    date: txn_date,
                    item_type,
                    description,
                    category,
                    charge: Money::ZERO,
                    payment: amount.abs(),
                    signed_amount: -amount,
                    transaction_ref: Some(txn.id.clone()),
                    source_module: None,
                });
            }
        }

        for entry in credit_ledger.history(client_id, unit_id)? {
            if entry.source != CreditSource::Manual {
                continue;
            }
            if entry.timestamp < fy_start_utc || entry.timestamp >= fy_end_utc {
                continue;
            }
            events.push(RawEvent {
                date: fiscal::local_date(entry.timestamp, config.timezone),
                item_type: LineItemType::CreditAdjustment,
                description: if entry.note.is_empty() { "Manual credit adjustment".to_string() } else { entry.note.clone() },
                category: "credit_manual".to_string(),
                charge: Money::ZERO,
                payment: entry.amount.abs(),
                signed_amount: -entry.amount,
                transaction_ref: entry.transaction_id.clone(),
                source_module: None,
            });
        }

        if exclude_future_bills {
            events.retain(|e| {
                if e.source_module.is_none() {
                    return true; // payments and manual credit are never filtered
                }
                if e.date <= today {
                    return true;
                }
                // 15-day HOA preview window (spec.md §4.8 step 5, asymmetric: water never previewed)
                e.source_module == Some(ModuleType::Hoa) && e.date - chrono::Duration::days(15) <= today
            });
        }

        events.sort_by(|a, b| a.date.cmp(&b.date).then(sort_order(a.item_type).cmp(&sort_order(b.item_type))));

        let opening_balance = -credit_ledger.balance_as_of(client_id, unit_id, fy_start_utc)?;
        let mut balance = opening_balance;
        let mut line_items = Vec::with_capacity(events.len());
        for event in events {
            balance += event.signed_amount;
            line_items.push(LineItem {
                date: event.date,
                description: event.description,
                charge: event.charge,
                payment: event.payment,
                balance,
                item_type: event.item_type,
                category: event.category,
                transaction_ref: event.transaction_ref,
            });
        }
        let closing_balance = line_items.last().map(|li| li.balance).unwrap_or(opening_balance);

        let current_credit_balance = credit_ledger.balance(client_id, unit_id)?;
        let expected_balance = -current_credit_balance;
        let reconciliation = if unpaid_bills_remain {
            Reconciliation { expected_balance, actual_balance: closing_balance, discrepancy_centavos: 0, checked: false }
        } else {
            let discrepancy = (closing_balance - expected_balance).centavos();
            if discrepancy.abs() > 1 {
                tracing::warn!(client_id, unit_id, discrepancy_centavos = discrepancy, "statement reconciliation discrepancy exceeds tolerance");
            } else if discrepancy != 0 {
                tracing::warn!(client_id, unit_id, discrepancy_centavos = discrepancy, "statement reconciliation within tolerance, using credit ledger as truth");
            }
            Reconciliation { expected_balance, actual_balance: closing_balance, discrepancy_centavos: discrepancy, checked: true }
        };

        Ok(Statement { opening_balance, closing_balance, line_items, reconciliation })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::{DuesFrequency, PenaltyPolicy, WaterConfig};
    use crate::credit::{CreditEntry, CreditEntryType};
    use crate::engine::{PaymentData, UnifiedPaymentEngine};
    use crate::money::Rate;
    use crate::storage::MemoryStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn config() -> ClientConfig {
        ClientConfig::new(
            1,
            DuesFrequency::Monthly,
            PenaltyPolicy::new(Rate::from_percentage_points(5), 5),
            WaterConfig {
                penalty: PenaltyPolicy::new(Rate::from_percentage_points(5), 5),
                rate_per_m3: Money::from_pesos(25),
                minimum_charge: Money::from_pesos(50),
                ancillary_rates: BTreeMap::new(),
            },
            chrono_tz::America::Cancun,
        )
        .unwrap()
    }

    fn seed_monthly_doc(storage: &MemoryStore, client_id: &str, unit_id: &str, fiscal_year: i32, scheduled: i64) {
        let doc = json!({
            "scheduledAmount": scheduled * 100,
            "payments": (0..12).map(|_| json!({"amount": 0, "basePaid": 0, "penaltyPaid": 0, "notes": []})).collect::<Vec<_>>(),
            "totalPaid": 0,
        });
        storage.set_doc(&format!("clients/{}/units/{}/dues/{}", client_id, unit_id, fiscal_year), doc).unwrap();
    }

    #[test]
    fn test_opening_balance_is_negated_credit() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config();
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let credit_ledger = CreditLedgerService::new(&store);
        credit_ledger
            .append(
                "c1",
                "u1",
                CreditEntry {
                    id: "seed".into(),
                    timestamp: Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap(),
                    amount: Money::from_pesos(100),
                    entry_type: CreditEntryType::StartingBalance,
                    source: CreditSource::Import,
                    transaction_id: None,
                    note: String::new(),
                },
            )
            .unwrap();

        let composer = StatementComposer::new(&store, &clock);
        let statement = composer.compose("c1", "u1", &cfg, 2026, false).unwrap();
        assert_eq!(statement.opening_balance, Money::from_pesos(-100));
    }

    #[test]
    fn test_payment_reduces_running_balance_and_ties_out() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config();
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let engine = UnifiedPaymentEngine::new(&store, &clock);
        let preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(150), None).unwrap();
        let payment_data = PaymentData { payment_method: "cash".into(), reference: None, notes: None, account_id: "a".into(), account_type: "bank".into(), user_id: "u".into() };
        engine.record("c1", "u1", &cfg, payment_data, &preview).unwrap();

        let composer = StatementComposer::new(&store, &clock);
        let statement = composer.compose("c1", "u1", &cfg, 2026, false).unwrap();
        let payment_line = statement.line_items.iter().find(|li| li.item_type == LineItemType::Payment);
        assert!(payment_line.is_some());
        assert_eq!(payment_line.unwrap().payment, Money::from_pesos(150));
    }

    #[test]
    fn test_future_bills_excluded_outside_preview_window() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config();
        // today = 2025-01-15; index 11 (December, due 2025-12-01) is far outside the 15-day window
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let composer = StatementComposer::new(&store, &clock);
        let statement = composer.compose("c1", "u1", &cfg, 2026, true).unwrap();
        assert!(statement.line_items.iter().all(|li| li.date <= NaiveDate::from_ymd_opt(2025, 1, 30).unwrap()));
    }
}
