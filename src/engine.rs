use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapters::dues::{self, BillPaymentEffect, DuesAdapter};
use crate::adapters::water::{WaterAdapter, WaterPaymentEffect};
use crate::clock::Clock;
use crate::config::ClientConfig;
use crate::credit::{CreditEntry, CreditEntryType, CreditLedgerService, CreditSource};
use crate::errors::{BillingError, Result};
use crate::events::{Event, EventStore};
use crate::fiscal;
use crate::money::Money;
use crate::storage::Storage;
use crate::types::{Allocation, Bill, BillStatus, ModuleType, Transaction, TransactionType};

/// the priority tier a bill is assigned during distribution (spec.md
/// §4.6.3). tier 99 (excluded future water) never reaches this type:
/// it is filtered out before aggregation.
const TIER_PAST_DUE_HOA: u8 = 1;
const TIER_PAST_DUE_WATER: u8 = 2;
const TIER_CURRENT_HOA: u8 = 3;
const TIER_CURRENT_WATER: u8 = 4;
const TIER_FUTURE_HOA: u8 = 5;

/// one aggregated bill carrying the tier metadata the engine needs to
/// sort and distribute, without re-deriving it mid-pass (spec.md §4.6.2).
struct AggregatedBill {
    bill: Bill,
    tier: u8,
    month_index: Option<u32>,
    quarter_index: Option<u32>,
}

/// the result of applying available funds to one bill in tier order
/// (spec.md §4.6.4): penalty first, then base, fully paying a bill before
/// funds roll to the next.
struct BillEffect {
    bill_id: String,
    module_type: ModuleType,
    base_paid: Money,
    penalty_paid: Money,
    new_status: BillStatus,
}

/// consume `funds` against `bills` in order, penalty-then-base per bill,
/// fully satisfying each before moving on. only bills that receive an
/// actual payment this pass appear in the result (spec.md §8: "no other
/// bill is touched" on an exact-fit payment).
fn distribute_bills(bills: &[Bill], funds: Money) -> (Vec<BillEffect>, Money) {
    let mut remaining = funds;
    let mut effects = Vec::new();
    for bill in bills {
        let penalty_paid = remaining.min(bill.penalty_owed());
        remaining -= penalty_paid;
        let base_paid = remaining.min(bill.base_owed());
        remaining -= base_paid;
        if penalty_paid.is_positive() || base_paid.is_positive() {
            let new_status = crate::types::derive_status(
                bill.base_paid + base_paid,
                bill.base_charge,
                bill.penalty_paid + penalty_paid,
                bill.penalty_amount,
            );
            effects.push(BillEffect { bill_id: bill.bill_id.clone(), module_type: bill.module_type, base_paid, penalty_paid, new_status });
        }
    }
    (effects, remaining)
}

/// one HOA month (or quarter) touched by a payment, in the preview
/// response shape of spec.md §6.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthAffected {
    pub month_index: Option<u32>,
    pub quarter_index: Option<u32>,
    pub bill_period: String,
    pub base_paid: Money,
    pub penalty_paid: Money,
    pub status: BillStatus,
}

/// one water bill touched by a payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillAffected {
    pub bill_period: String,
    pub base_paid: Money,
    pub penalty_paid: Money,
    pub status: BillStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoaDistribution {
    pub bills_paid: Vec<String>,
    pub total_paid: Money,
    pub months_affected: Vec<MonthAffected>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaterDistribution {
    pub bills_paid: Vec<String>,
    pub total_paid: Money,
    pub bills_affected: Vec<BillAffected>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditSummary {
    pub used: Money,
    pub added: Money,
    pub r#final: Money,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionSummary {
    pub total_bills: u32,
    pub total_allocated: Money,
    pub allocation_count: u32,
}

/// the engine's read-only preview of a payment's effect (spec.md §4.6.1,
/// §6.2). carries the bill-level effects the commit path needs, so
/// `record` never has to recompute distribution from scratch, only
/// re-validate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Distribution {
    pub total_amount: Money,
    pub current_credit_balance: Money,
    pub new_credit_balance: Money,
    pub hoa: HoaDistribution,
    pub water: WaterDistribution,
    pub credit: CreditSummary,
    pub summary: DistributionSummary,
    pub allocations: Vec<Allocation>,
    pub payment_date: DateTime<Utc>,
    /// the amount the caller actually requested, before the zero-amount
    /// substitution of spec.md §4.6.5. `record` treats a zero requested
    /// amount as a no-op regardless of what `totalAmount` shows.
    pub requested_amount: Money,
    #[serde(skip)]
    hoa_effects_by_year: BTreeMap<i32, Vec<(String, Money, Money)>>,
    #[serde(skip)]
    water_effects: Vec<(String, Money, Money, Money)>,
}

/// caller-supplied metadata for a payment being recorded (spec.md §6.2).
pub struct PaymentData {
    pub payment_method: String,
    pub reference: Option<String>,
    pub notes: Option<String>,
    pub account_id: String,
    pub account_type: String,
    pub user_id: String,
}

/// aggregates unpaid bills from both streams, prioritizes them, distributes
/// an incoming payment plus available credit across them, and atomically
/// commits the result (spec.md §4.6). the only writer in the payment flow.
///
/// grounded on the teacher's `PaymentProcessor::process` waterfall (tiered
/// bucket consumption against a payment amount) generalized from a single
/// facility's fee/penalty/interest/principal buckets to this domain's
/// cross-stream, multi-bill tier policy.
pub struct UnifiedPaymentEngine<'s> {
    storage: &'s dyn Storage,
    clock: &'s dyn Clock,
    events: Mutex<EventStore>,
}

impl<'s> UnifiedPaymentEngine<'s> {
    pub fn new(storage: &'s dyn Storage, clock: &'s dyn Clock) -> Self {
        UnifiedPaymentEngine { storage, clock, events: Mutex::new(EventStore::new()) }
    }

    /// drain the domain events emitted by `preview`/`record` calls so far
    /// (teacher's append-and-drain `EventStore` pattern, spec.md §9's
    /// "deterministic testing" rationale for injected components).
    pub fn take_events(&self) -> Vec<Event> {
        self.events.lock().expect("event store mutex poisoned").take_events()
    }

    fn emit(&self, event: Event) {
        self.events.lock().expect("event store mutex poisoned").emit(event);
    }

    /// pure with respect to persisted state: computes but never writes
    /// (spec.md §4.6.1).
    pub fn preview(
        &self,
        client_id: &str,
        unit_id: &str,
        config: &ClientConfig,
        amount: Money,
        payment_date: Option<DateTime<Utc>>,
    ) -> Result<Distribution> {
        let payment_date = payment_date.unwrap_or_else(|| self.clock.now());
        self.emit(Event::PaymentPreviewed { client_id: client_id.to_string(), unit_id: unit_id.to_string(), amount, timestamp: payment_date });
        let local_date = fiscal::local_date(payment_date, config.timezone);
        let current_fy = fiscal::fiscal_year_of(local_date, config.fiscal_year_start_month);

        let dues_adapter = DuesAdapter::new(self.storage);
        let water_adapter = WaterAdapter::new(self.storage);
        let credit_ledger = CreditLedgerService::new(self.storage);

        let mut hoa_bills = dues_adapter.rollback_prior_year(client_id, unit_id, current_fy, config)?;
        hoa_bills.extend(dues_adapter.materialize_bills(client_id, unit_id, current_fy, config)?);
        let hoa_recalc = crate::penalty::recalculate(hoa_bills, local_date, &config.hoa_penalty);

        let water_bills = water_adapter.select_unpaid(client_id, unit_id)?;
        let water_recalc = crate::penalty::recalculate(water_bills, local_date, &config.water.penalty);

        let bills_updated = hoa_recalc.bills_updated + water_recalc.bills_updated;
        if bills_updated > 0 {
            self.emit(Event::PenaltiesRecalculated {
                client_id: client_id.to_string(),
                unit_id: unit_id.to_string(),
                bills_updated,
                total_penalties_added: hoa_recalc.total_penalties_added + water_recalc.total_penalties_added,
                timestamp: payment_date,
            });
        }

        let is_zero_amount_preview = amount.is_zero();

        let current_water_period = current_water_bounds(local_date, config);

        let mut combined = Vec::new();
        for bill in hoa_recalc.updated_bills {
            let (bill_fy, month_index, quarter_index) = dues::parse_bill_id(&bill.bill_id)?;
            let is_current_year = bill_fy == current_fy;
            let current_position = fiscal_current_position(local_date, config);
            let bill_position = month_index.or(quarter_index).unwrap_or(0);
            let tier = if !is_current_year || bill_position < current_position {
                TIER_PAST_DUE_HOA
            } else if bill_position == current_position {
                TIER_CURRENT_HOA
            } else {
                TIER_FUTURE_HOA
            };
            if is_zero_amount_preview && tier == TIER_FUTURE_HOA {
                // spec.md §4.6.5: the zero-amount "what would credit cover"
                // preview strips future-prepayment entries entirely.
                continue;
            }
            combined.push(AggregatedBill { bill, tier, month_index, quarter_index });
        }
        for bill in water_recalc.updated_bills {
            let tier = if bill.due_date < current_water_period.0 {
                TIER_PAST_DUE_WATER
            } else if bill.due_date < current_water_period.1 {
                TIER_CURRENT_WATER
            } else {
                continue; // tier 99: future water is excluded, water is strictly postpaid
            };
            combined.push(AggregatedBill { bill, tier, month_index: None, quarter_index: None });
        }

        combined.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then(a.bill.due_date.cmp(&b.bill.due_date))
                .then(a.bill.module_type.cmp(&b.bill.module_type))
                .then(a.bill.period.cmp(&b.bill.period))
        });

        let current_credit = credit_ledger.balance(client_id, unit_id)?;
        let mut total_funds = amount + current_credit;

        let mut hoa = HoaDistribution::default();
        let mut water = WaterDistribution::default();
        let mut allocations = Vec::new();
        let mut hoa_effects_by_year: BTreeMap<i32, Vec<(String, Money, Money)>> = BTreeMap::new();
        let mut water_effects: Vec<(String, Money, Money, Money)> = Vec::new();
        let mut total_bills_processed = 0u32;

        for tier in TIER_PAST_DUE_HOA..=TIER_FUTURE_HOA {
            let tier_bills: Vec<&AggregatedBill> = combined.iter().filter(|b| b.tier == tier).collect();
            if tier_bills.is_empty() {
                continue;
            }
            total_bills_processed += tier_bills.len() as u32;
            let bills_only: Vec<Bill> = tier_bills.iter().map(|b| b.bill.clone()).collect();
            let (effects, remaining) = distribute_bills(&bills_only, total_funds);
            total_funds = remaining;

            for effect in effects {
                let meta = tier_bills.iter().find(|b| b.bill.bill_id == effect.bill_id).expect("effect bill came from tier_bills");
                match effect.module_type {
                    ModuleType::Hoa => {
                        hoa.total_paid += effect.base_paid + effect.penalty_paid;
                        if effect.new_status == BillStatus::Paid {
                            hoa.bills_paid.push(effect.bill_id.clone());
                        }
                        hoa.months_affected.push(MonthAffected {
                            month_index: meta.month_index,
                            quarter_index: meta.quarter_index,
                            bill_period: meta.bill.period.clone(),
                            base_paid: effect.base_paid,
                            penalty_paid: effect.penalty_paid,
                            status: effect.new_status,
                        });
                        if effect.base_paid.is_positive() {
                            allocations.push(Allocation::HoaMonth {
                                target_id: meta.bill.bill_id.clone(),
                                target_name: meta.bill.period.clone(),
                                amount: effect.base_paid,
                                category_id: "hoa_dues".to_string(),
                            });
                        }
                        if effect.penalty_paid.is_positive() {
                            allocations.push(Allocation::HoaPenalty {
                                target_id: meta.bill.bill_id.clone(),
                                target_name: meta.bill.period.clone(),
                                amount: effect.penalty_paid,
                                category_id: "hoa_penalties".to_string(),
                            });
                        }
                        let (bill_fy, _, _) = dues::parse_bill_id(&meta.bill.bill_id)?;
                        hoa_effects_by_year.entry(bill_fy).or_default().push((meta.bill.period.clone(), effect.base_paid, effect.penalty_paid));
                    }
                    ModuleType::Water => {
                        water.total_paid += effect.base_paid + effect.penalty_paid;
                        if effect.new_status == BillStatus::Paid {
                            water.bills_paid.push(effect.bill_id.clone());
                        }
                        water.bills_affected.push(BillAffected {
                            bill_period: meta.bill.period.clone(),
                            base_paid: effect.base_paid,
                            penalty_paid: effect.penalty_paid,
                            status: effect.new_status,
                        });
                        if effect.base_paid.is_positive() {
                            allocations.push(Allocation::WaterConsumption {
                                target_id: meta.bill.bill_id.clone(),
                                target_name: meta.bill.period.clone(),
                                amount: effect.base_paid,
                                category_id: "water_consumption".to_string(),
                            });
                        }
                        if effect.penalty_paid.is_positive() {
                            allocations.push(Allocation::WaterPenalty {
                                target_id: meta.bill.bill_id.clone(),
                                target_name: meta.bill.period.clone(),
                                amount: effect.penalty_paid,
                                category_id: "water_penalties".to_string(),
                            });
                        }
                        water_effects.push((meta.bill.period.clone(), effect.base_paid, effect.penalty_paid, meta.bill.penalty_amount));
                    }
                }
            }
        }

        let net_credit_added = total_funds - current_credit;
        if net_credit_added.is_positive() {
            allocations.push(Allocation::CreditAdded { target_id: unit_id.to_string(), target_name: "credit".to_string(), amount: net_credit_added });
        } else if net_credit_added.is_negative() {
            allocations.push(Allocation::CreditUsed { target_id: unit_id.to_string(), target_name: "credit".to_string(), amount: net_credit_added });
        }

        let total_allocated = allocations.iter().fold(Money::ZERO, |acc, a| acc + a.amount());
        let allocation_count = allocations.len() as u32;

        let (current_credit_balance, new_credit_balance, credit) = if is_zero_amount_preview {
            // spec.md §4.6.5: credit fields are zeroed on the sanitized
            // zero-amount response. the bill coverage shown is
            // hypothetical, not a real credit draw.
            (Money::ZERO, Money::ZERO, CreditSummary::default())
        } else {
            let used = if net_credit_added.is_negative() { -net_credit_added } else { Money::ZERO };
            let added = if net_credit_added.is_positive() { net_credit_added } else { Money::ZERO };
            (current_credit, total_funds, CreditSummary { used, added, r#final: total_funds })
        };

        Ok(Distribution {
            total_amount: amount,
            current_credit_balance,
            new_credit_balance,
            hoa,
            water,
            credit,
            summary: DistributionSummary { total_bills: total_bills_processed, total_allocated, allocation_count },
            allocations,
            payment_date,
            requested_amount: amount,
            hoa_effects_by_year,
            water_effects,
        })
    }

    /// re-validates `preview` against current state and, on match,
    /// performs the atomic batch write of spec.md §5.3. returns `None`
    /// for a zero-amount request (spec.md §8: "record is a no-op").
    pub fn record(&self, client_id: &str, unit_id: &str, config: &ClientConfig, payment_data: PaymentData, preview: &Distribution) -> Result<Option<String>> {
        if preview.requested_amount.is_zero() {
            return Ok(None);
        }

        let fresh = self.preview(client_id, unit_id, config, preview.requested_amount, Some(preview.payment_date))?;
        let divergence = (fresh.summary.total_allocated - preview.summary.total_allocated).centavos().abs();
        if divergence > 1 {
            self.emit(Event::StaleStateDetected {
                client_id: client_id.to_string(),
                unit_id: unit_id.to_string(),
                divergence_centavos: divergence,
                timestamp: fresh.payment_date,
            });
            return Err(BillingError::StaleState { divergence_centavos: divergence });
        }

        if fresh.summary.total_allocated != fresh.requested_amount {
            return Err(BillingError::AllocationMismatch {
                allocated: fresh.summary.total_allocated.centavos(),
                amount: fresh.requested_amount.centavos(),
            });
        }

        let transaction_id = Uuid::new_v4().to_string();
        let mut note_text = format!("Unified payment via {}", payment_data.payment_method);
        if let Some(notes) = &payment_data.notes {
            note_text.push_str(": ");
            note_text.push_str(notes);
        }

        let dues_adapter = DuesAdapter::new(self.storage);
        let water_adapter = WaterAdapter::new(self.storage);
        let credit_ledger = CreditLedgerService::new(self.storage);

        let mut batch = self.storage.batch();

        let transaction = Transaction {
            id: transaction_id.clone(),
            date: fresh.payment_date,
            amount: fresh.requested_amount,
            transaction_type: TransactionType::Income,
            category_id: Transaction::category_id_for(&fresh.allocations),
            allocations: fresh.allocations.clone(),
            unit_id: unit_id.to_string(),
        };
        let transaction_value = serde_json::to_value(&transaction).map_err(|e| BillingError::Storage(e.to_string()))?;
        batch.set(&format!("clients/{}/transactions/{}", client_id, transaction_id), transaction_value);

        for (fiscal_year, period_effects) in &fresh.hoa_effects_by_year {
            let effects: Vec<BillPaymentEffect> = period_effects
                .iter()
                .map(|(period, base_paid, penalty_paid)| BillPaymentEffect {
                    period: period.clone(),
                    base_paid: *base_paid,
                    penalty_paid: *penalty_paid,
                    note_text: note_text.clone(),
                })
                .collect();
            dues_adapter.apply_payment_to_batch(&mut *batch, client_id, unit_id, *fiscal_year, config, &transaction_id, fresh.payment_date, &effects)?;
        }

        if !fresh.water_effects.is_empty() {
            let effects: Vec<WaterPaymentEffect> = fresh
                .water_effects
                .iter()
                .map(|(period, base_paid, penalty_paid, new_penalty_amount)| WaterPaymentEffect {
                    period: period.clone(),
                    base_paid: *base_paid,
                    penalty_paid: *penalty_paid,
                    new_penalty_amount: *new_penalty_amount,
                    method: payment_data.payment_method.clone(),
                    reference: payment_data.reference.clone(),
                })
                .collect();
            water_adapter.apply_payment_to_batch(&mut *batch, client_id, unit_id, &transaction_id, fresh.payment_date, &effects)?;
        }

        let net_credit_added = fresh.new_credit_balance - fresh.current_credit_balance;
        if net_credit_added != Money::ZERO {
            let entry_type = if net_credit_added.is_positive() { CreditEntryType::CreditAdded } else { CreditEntryType::CreditUsed };
            let entry = CreditEntry {
                id: Uuid::new_v4().to_string(),
                timestamp: fresh.payment_date,
                amount: net_credit_added,
                entry_type,
                source: CreditSource::UnifiedPayment,
                transaction_id: Some(transaction_id.clone()),
                note: note_text.clone(),
            };
            credit_ledger.append_to_batch(&mut *batch, client_id, unit_id, entry)?;
            self.emit(Event::CreditAppended {
                client_id: client_id.to_string(),
                unit_id: unit_id.to_string(),
                amount: net_credit_added,
                resulting_balance: fresh.new_credit_balance,
                timestamp: fresh.payment_date,
            });
        }

        batch.commit()?;

        tracing::info!(client_id, unit_id, transaction_id = %transaction_id, amount = fresh.requested_amount.centavos(), "unified payment recorded");
        self.emit(Event::PaymentRecorded {
            client_id: client_id.to_string(),
            unit_id: unit_id.to_string(),
            transaction_id: transaction_id.clone(),
            amount: fresh.requested_amount,
            timestamp: fresh.payment_date,
        });
        for bill_id in fresh.hoa.bills_paid.iter().chain(fresh.water.bills_paid.iter()) {
            self.emit(Event::BillPaid { client_id: client_id.to_string(), unit_id: unit_id.to_string(), bill_id: bill_id.clone(), timestamp: fresh.payment_date });
        }

        Ok(Some(transaction_id))
    }
}

/// the fiscal position (month index or quarter number) that `local_date`
/// falls in, matching whichever unit `config.dues_frequency` bills in.
fn fiscal_current_position(local_date: chrono::NaiveDate, config: &ClientConfig) -> u32 {
    match config.dues_frequency {
        crate::config::DuesFrequency::Monthly => fiscal::fiscal_month_index_of(local_date, config.fiscal_year_start_month),
        crate::config::DuesFrequency::Quarterly => fiscal::fiscal_quarter_of(local_date, config.fiscal_year_start_month),
    }
}

/// `[start, end)` bounds of the fiscal quarter containing `local_date`,
/// used to classify water bills into past-due/current/future tiers
/// without parsing a bill id (water bills carry no fiscal-quarter-encoded
/// id the way dues bills do).
fn current_water_bounds(local_date: chrono::NaiveDate, config: &ClientConfig) -> (chrono::NaiveDate, chrono::NaiveDate) {
    let fy = fiscal::fiscal_year_of(local_date, config.fiscal_year_start_month);
    let q = fiscal::fiscal_quarter_of(local_date, config.fiscal_year_start_month);
    let start = fiscal::due_date_of_fiscal_quarter(fy, q, config.fiscal_year_start_month);
    let end = if q < 4 {
        fiscal::due_date_of_fiscal_quarter(fy, q + 1, config.fiscal_year_start_month)
    } else {
        fiscal::fiscal_year_bounds(fy + 1, config.fiscal_year_start_month).0
    };
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::{DuesFrequency, PenaltyPolicy, WaterConfig};
    use crate::money::Rate;
    use crate::storage::MemoryStore;
    use chrono::{NaiveDate, TimeZone};
    use serde_json::json;
    use std::collections::BTreeMap as StdBTreeMap;

    fn config(frequency: DuesFrequency) -> ClientConfig {
        ClientConfig::new(
            1,
            frequency,
            PenaltyPolicy::new(Rate::from_percentage_points(5), 5),
            WaterConfig {
                penalty: PenaltyPolicy::new(Rate::from_percentage_points(5), 5),
                rate_per_m3: Money::from_pesos(25),
                minimum_charge: Money::from_pesos(50),
                ancillary_rates: StdBTreeMap::new(),
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

    fn seed_water_period(storage: &MemoryStore, client_id: &str, period: &str, unit_id: &str, base_charge: i64, due: NaiveDate) {
        let doc = json!({
            "bills": {
                "units": {
                    unit_id: {
                        "baseCharge": base_charge * 100,
                        "basePaid": 0,
                        "penaltyAmount": 0,
                        "penaltyPaid": 0,
                        "paidAmount": 0,
                        "dueDate": due,
                        "payments": [],
                    }
                }
            }
        });
        storage.set_doc(&format!("clients/{}/projects/waterBills/bills/{}", client_id, period), doc).unwrap();
    }

    fn payment_data() -> PaymentData {
        PaymentData {
            payment_method: "cash".into(),
            reference: None,
            notes: None,
            account_id: "acct1".into(),
            account_type: "bank".into(),
            user_id: "user1".into(),
        }
    }

    // fiscal_year_start_month = 1 means fiscal year 2026 spans calendar
    // 2025 (fiscal years are named by their *ending* calendar year, per
    // fiscal.rs), so a dues document seeded under fiscal year 2026 is
    // "current" for payment dates in calendar 2025.

    #[test]
    fn test_exact_payment_pays_one_bill_no_credit_change() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config(DuesFrequency::Monthly);
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let engine = UnifiedPaymentEngine::new(&store, &clock);

        let preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(150), None).unwrap();
        assert_eq!(preview.hoa.total_paid, Money::from_pesos(150));
        assert_eq!(preview.credit.used, Money::ZERO);
        assert_eq!(preview.credit.added, Money::ZERO);

        let txn_id = engine.record("c1", "u1", &cfg, payment_data(), &preview).unwrap();
        assert!(txn_id.is_some());

        let bills = DuesAdapter::new(&store).materialize_bills("c1", "u1", 2026, &cfg).unwrap();
        assert_eq!(bills[0].status(), BillStatus::Paid);
        assert_eq!(bills[1].status(), BillStatus::Unpaid);

        let events = engine.take_events();
        assert!(events.iter().any(|e| matches!(e, Event::PaymentPreviewed { .. })));
        assert!(events.iter().any(|e| matches!(e, Event::PaymentRecorded { transaction_id, .. } if Some(transaction_id.clone()) == txn_id)));
        assert!(events.iter().any(|e| matches!(e, Event::BillPaid { .. })));
        assert!(engine.take_events().is_empty(), "take_events drains the store");
    }

    #[test]
    fn test_water_postpaid_rule_future_untouched_excess_to_credit() {
        let store = MemoryStore::new();
        // a long grace period keeps this scenario (spec.md §8 #2) free of
        // penalty accrual, so it isolates the postpaid tiering rule
        // rather than also exercising `penalty::recalculate`.
        let mut cfg = config(DuesFrequency::Monthly);
        cfg.water.penalty = PenaltyPolicy::new(Rate::from_percentage_points(5), 3650);
        // current date in Q2 (fiscal months 3..5 under start_month=1 -> calendar Apr-Jun)
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let clock = TestClock::at(now);

        seed_water_period(&store, "c1", "2026-Q1", "u1", 200, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        seed_water_period(&store, "c1", "2026-Q2", "u1", 180, NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());
        seed_water_period(&store, "c1", "2026-Q3", "u1", 150, NaiveDate::from_ymd_opt(2026, 7, 1).unwrap());

        let engine = UnifiedPaymentEngine::new(&store, &clock);
        let preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(400), None).unwrap();

        assert_eq!(preview.water.total_paid, Money::from_pesos(380));
        assert_eq!(preview.credit.added, Money::from_pesos(20));
        assert_eq!(preview.water.bills_affected.len(), 2);

        engine.record("c1", "u1", &cfg, payment_data(), &preview).unwrap();
        let remaining = WaterAdapter::new(&store).select_unpaid("c1", "u1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].period, "2026-Q3");
    }

    #[test]
    fn test_hoa_prepayment_allowed_into_future_tier() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config(DuesFrequency::Monthly);
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let engine = UnifiedPaymentEngine::new(&store, &clock);

        // pay current month plus enough for the next month (future, tier 5)
        let preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(300), None).unwrap();
        assert_eq!(preview.hoa.total_paid, Money::from_pesos(300));
        assert_eq!(preview.credit.added, Money::ZERO);
        let future_entry = preview.hoa.months_affected.iter().find(|m| m.month_index == Some(1));
        assert!(future_entry.is_some());
    }

    #[test]
    fn test_penalty_paid_before_base_within_a_bill() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 1000);
        let cfg = config(DuesFrequency::Monthly);
        // push the due date far enough into the grace+penalty window to accrue exactly one tranche
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap());
        let engine = UnifiedPaymentEngine::new(&store, &clock);

        let preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(10), None).unwrap();
        let first = &preview.hoa.months_affected[0];
        assert_eq!(first.penalty_paid, Money::from_pesos(10));
        assert_eq!(first.base_paid, Money::ZERO);
        assert_eq!(first.status, BillStatus::Partial);
    }

    #[test]
    fn test_zero_amount_preview_shows_coverage_but_record_is_noop() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config(DuesFrequency::Monthly);
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let credit_ledger = CreditLedgerService::new(&store);
        credit_ledger
            .append(
                "c1",
                "u1",
                CreditEntry {
                    id: "seed".into(),
                    timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                    amount: Money::from_pesos(150),
                    entry_type: CreditEntryType::StartingBalance,
                    source: CreditSource::Manual,
                    transaction_id: None,
                    note: String::new(),
                },
            )
            .unwrap();

        let engine = UnifiedPaymentEngine::new(&store, &clock);
        let preview = engine.preview("c1", "u1", &cfg, Money::ZERO, None).unwrap();
        assert_eq!(preview.hoa.total_paid, Money::from_pesos(150));
        assert_eq!(preview.current_credit_balance, Money::ZERO);
        assert_eq!(preview.new_credit_balance, Money::ZERO);

        let result = engine.record("c1", "u1", &cfg, payment_data(), &preview).unwrap();
        assert!(result.is_none());
        // no transaction was written, and credit balance is unchanged
        assert_eq!(credit_ledger.balance("c1", "u1").unwrap(), Money::from_pesos(150));
        let bills = DuesAdapter::new(&store).materialize_bills("c1", "u1", 2026, &cfg).unwrap();
        assert_eq!(bills[0].status(), BillStatus::Unpaid);
    }

    #[test]
    fn test_stale_state_detected_on_concurrent_payment() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config(DuesFrequency::Monthly);
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let engine = UnifiedPaymentEngine::new(&store, &clock);

        let preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(150), None).unwrap();

        // a concurrent payment pays off the same bill before this one commits
        let concurrent_preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(150), None).unwrap();
        engine.record("c1", "u1", &cfg, payment_data(), &concurrent_preview).unwrap();

        let result = engine.record("c1", "u1", &cfg, payment_data(), &preview);
        assert!(matches!(result, Err(BillingError::StaleState { .. })));
    }

    #[test]
    fn test_quarterly_payment_splits_across_three_slots() {
        let store = MemoryStore::new();
        seed_monthly_doc(&store, "c1", "u1", 2026, 150);
        let cfg = config(DuesFrequency::Quarterly);
        let clock = TestClock::at(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
        let engine = UnifiedPaymentEngine::new(&store, &clock);

        let preview = engine.preview("c1", "u1", &cfg, Money::from_pesos(450), None).unwrap();
        engine.record("c1", "u1", &cfg, payment_data(), &preview).unwrap();

        let doc = DuesAdapter::new(&store).materialize_bills("c1", "u1", 2026, &cfg).unwrap();
        assert_eq!(doc[0].status(), BillStatus::Paid);
    }
}
