use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{ClientConfig, DuesFrequency};
use crate::errors::{BillingError, Result};
use crate::fiscal;
use crate::money::Money;
use crate::storage::Storage;
use crate::types::{derive_status, Bill, BillStatus, ModuleType, Note, PaymentRecord};

/// one fiscal-month slot of a dues document (spec.md §3.3)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthSlot {
    #[serde(default)]
    pub amount: Money,
    #[serde(default)]
    pub base_paid: Money,
    #[serde(default)]
    pub penalty_paid: Money,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Vec<Note>,
    /// write-through cache of `bill_status(...)`; recomputed on every
    /// `apply_to_slot` (spec.md §4.4 write path), never trusted on read.
    #[serde(default)]
    pub status: BillStatus,
}

/// one document per (client, unit, fiscal year) for the dues stream
/// (spec.md §3.3). `penalties` preserves imported legacy entries verbatim;
/// this engine never computes from them, only carries them through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuesDocument {
    pub scheduled_amount: Money,
    pub payments: [MonthSlot; 12],
    #[serde(default)]
    pub penalties: Option<Value>,
    #[serde(default)]
    pub total_paid: Money,
    /// legacy mirrored credit fields; read-tolerated, always stripped on write
    #[serde(default, skip_serializing)]
    pub credit_balance: Option<Value>,
    #[serde(default, skip_serializing)]
    pub credit_balance_history: Option<Value>,
}

/// the scheduled charge for a bill produced from a quarterly document:
/// three months' worth.
fn quarterly_charge(scheduled: Money) -> Money {
    scheduled * 3
}

/// a single bill-level payment effect to apply to a dues document
/// (write path input, spec.md §4.4). `period` matches the `period` field
/// materialized by `materialize_bills` for the affected bill.
pub struct BillPaymentEffect {
    pub period: String,
    pub base_paid: Money,
    pub penalty_paid: Money,
    pub note_text: String,
}

fn bill_status(slot_or_sum_base_paid: Money, base_charge: Money, penalty_paid: Money, penalty_amount: Money) -> BillStatus {
    derive_status(slot_or_sum_base_paid, base_charge, penalty_paid, penalty_amount)
}

/// translates a stored dues document into bills and applies payment
/// effects back onto per-slot payment summaries (spec.md §4.4).
pub struct DuesAdapter<'s> {
    storage: &'s dyn Storage,
}

impl<'s> DuesAdapter<'s> {
    pub fn new(storage: &'s dyn Storage) -> Self {
        DuesAdapter { storage }
    }

    fn doc_path(client_id: &str, unit_id: &str, fiscal_year: i32) -> String {
        format!("clients/{}/units/{}/dues/{}", client_id, unit_id, fiscal_year)
    }

    fn load_doc(&self, client_id: &str, unit_id: &str, fiscal_year: i32) -> Result<Option<DuesDocument>> {
        let path = Self::doc_path(client_id, unit_id, fiscal_year);
        match self.storage.get_doc(&path)? {
            Some(value) => {
                let doc: DuesDocument = serde_json::from_value(value).map_err(|e| BillingError::Storage(e.to_string()))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// materialize a dues document into monthly or quarterly bills,
    /// per spec.md §4.4. materialized bills are never persisted.
    pub fn materialize_bills(&self, client_id: &str, unit_id: &str, fiscal_year: i32, config: &ClientConfig) -> Result<Vec<Bill>> {
        let doc = match self.load_doc(client_id, unit_id, fiscal_year)? {
            Some(d) => d,
            None => return Ok(Vec::new()),
        };
        Ok(match config.dues_frequency {
            DuesFrequency::Monthly => self.materialize_monthly(unit_id, fiscal_year, config, &doc),
            DuesFrequency::Quarterly => self.materialize_quarterly(unit_id, fiscal_year, config, &doc),
        })
    }

    fn materialize_monthly(&self, unit_id: &str, fiscal_year: i32, config: &ClientConfig, doc: &DuesDocument) -> Vec<Bill> {
        (0u32..12)
            .map(|index| {
                let slot = &doc.payments[index as usize];
                let due_date = fiscal::due_date_of_fiscal_month(fiscal_year, index, config.fiscal_year_start_month);
                Bill {
                    bill_id: format!("dues:{}:{}", fiscal_year, index),
                    period: format!("{:04}-{:02}", due_date.year(), due_date.month()),
                    unit_id: unit_id.to_string(),
                    module_type: ModuleType::Hoa,
                    base_charge: doc.scheduled_amount,
                    base_paid: slot.base_paid,
                    penalty_amount: Money::ZERO,
                    penalty_paid: slot.penalty_paid,
                    due_date,
                    payments: slot_payment_records(slot),
                }
            })
            .collect()
    }

    fn materialize_quarterly(&self, unit_id: &str, fiscal_year: i32, config: &ClientConfig, doc: &DuesDocument) -> Vec<Bill> {
        (1u32..=4)
            .map(|q| {
                let indices = quarter_indices(q);
                let base_paid = indices.iter().map(|&i| doc.payments[i as usize].base_paid).fold(Money::ZERO, |a, b| a + b);
                let penalty_paid = indices.iter().map(|&i| doc.payments[i as usize].penalty_paid).fold(Money::ZERO, |a, b| a + b);
                let due_date = fiscal::due_date_of_fiscal_quarter(fiscal_year, q, config.fiscal_year_start_month);
                let payments = indices.iter().flat_map(|&i| slot_payment_records(&doc.payments[i as usize])).collect();
                Bill {
                    bill_id: format!("dues:{}:Q{}", fiscal_year, q),
                    period: format!("{}-Q{}", fiscal_year, q),
                    unit_id: unit_id.to_string(),
                    module_type: ModuleType::Hoa,
                    base_charge: quarterly_charge(doc.scheduled_amount),
                    base_paid,
                    penalty_amount: Money::ZERO,
                    penalty_paid,
                    due_date,
                    payments,
                }
            })
            .collect()
    }

    /// prior-year rollback (spec.md §4.4): if fiscal-month index 0 of year
    /// `fiscal_year` is unpaid, scan year `fiscal_year - 1` from index 11
    /// down to 0, collecting successive unpaid bills and stopping at the
    /// first fully paid bill encountered.
    pub fn rollback_prior_year(&self, client_id: &str, unit_id: &str, fiscal_year: i32, config: &ClientConfig) -> Result<Vec<Bill>> {
        let current_year_bills = self.materialize_bills(client_id, unit_id, fiscal_year, config)?;
        let first_bill_unpaid = current_year_bills.first().map(|b| b.status() != BillStatus::Paid).unwrap_or(false);
        if !first_bill_unpaid {
            return Ok(Vec::new());
        }

        let prior_year = fiscal_year - 1;
        let prior_bills = self.materialize_bills(client_id, unit_id, prior_year, config)?;
        if prior_bills.is_empty() {
            return Ok(Vec::new());
        }

        let mut carried = Vec::new();
        for bill in prior_bills.into_iter().rev() {
            if bill.status() == BillStatus::Paid {
                break;
            }
            carried.push(bill);
        }
        carried.reverse();
        Ok(carried)
    }

    /// apply a list of bill-level payment effects back onto the stored
    /// document's per-slot payment summaries (spec.md §4.4 write path).
    /// fields are accumulated, never overwritten; legacy mirrored credit
    /// fields are deleted on every update.
    pub fn apply_payment(
        &self,
        client_id: &str,
        unit_id: &str,
        fiscal_year: i32,
        config: &ClientConfig,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        effects: &[BillPaymentEffect],
    ) -> Result<()> {
        let path = Self::doc_path(client_id, unit_id, fiscal_year);
        let doc = self.load_doc(client_id, unit_id, fiscal_year)?.ok_or_else(|| BillingError::DocumentNotFound { path: path.clone() })?;
        let updated = Self::merge_effects(doc, fiscal_year, config, transaction_id, timestamp, effects)?;

        // `creditBalance`/`creditBalanceHistory` are never re-written: the
        // fields are marked `skip_serializing` on `DuesDocument`, so a full
        // `set_doc` here drops them unconditionally (spec.md §9).
        let value = serde_json::to_value(&updated).map_err(|e| BillingError::Storage(e.to_string()))?;
        self.storage.set_doc(&path, value)?;
        Ok(())
    }

    /// load the document and compute its post-payment state without
    /// writing anything, staging the write onto `batch` instead so it can
    /// be part of the unified payment engine's atomic multi-document
    /// commit (spec.md §5.3), mirroring `CreditLedgerService::append_to_batch`.
    pub fn apply_payment_to_batch(
        &self,
        batch: &mut dyn crate::storage::Batch,
        client_id: &str,
        unit_id: &str,
        fiscal_year: i32,
        config: &ClientConfig,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        effects: &[BillPaymentEffect],
    ) -> Result<()> {
        let path = Self::doc_path(client_id, unit_id, fiscal_year);
        let doc = self.load_doc(client_id, unit_id, fiscal_year)?.ok_or_else(|| BillingError::DocumentNotFound { path: path.clone() })?;
        let updated = Self::merge_effects(doc, fiscal_year, config, transaction_id, timestamp, effects)?;
        let value = serde_json::to_value(&updated).map_err(|e| BillingError::Storage(e.to_string()))?;
        batch.set(&path, value);
        Ok(())
    }

    /// pure merge of a batch of payment effects onto a loaded document;
    /// shared by the immediate and batched write paths.
    fn merge_effects(
        mut doc: DuesDocument,
        fiscal_year: i32,
        config: &ClientConfig,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        effects: &[BillPaymentEffect],
    ) -> Result<DuesDocument> {
        for effect in effects {
            match config.dues_frequency {
                DuesFrequency::Monthly => {
                    let index = parse_monthly_period_index(&effect.period, fiscal_year, config)?;
                    apply_to_slot(&mut doc.payments[index as usize], doc.scheduled_amount, effect, transaction_id, timestamp);
                }
                DuesFrequency::Quarterly => {
                    let q = parse_quarter_number(&effect.period)?;
                    let indices = quarter_indices(q);
                    let base_shares = effect.base_paid.split_equally(3);
                    for (slot_pos, &slot_index) in indices.iter().enumerate() {
                        let slot_effect = BillPaymentEffect {
                            period: effect.period.clone(),
                            base_paid: base_shares[slot_pos],
                            penalty_paid: if slot_pos == 0 { effect.penalty_paid } else { Money::ZERO },
                            note_text: effect.note_text.clone(),
                        };
                        apply_to_slot(&mut doc.payments[slot_index as usize], doc.scheduled_amount, &slot_effect, transaction_id, timestamp);
                    }
                }
            }
        }

        doc.total_paid = doc.payments.iter().fold(Money::ZERO, |acc, slot| acc + slot.base_paid + slot.penalty_paid);
        Ok(doc)
    }
}

fn slot_payment_records(slot: &MonthSlot) -> Vec<PaymentRecord> {
    slot.notes
        .iter()
        .map(|note| PaymentRecord {
            transaction_id: note.transaction_id.clone(),
            timestamp: note.timestamp,
            base_paid: note.base_paid,
            penalty_paid: note.penalty_paid,
            method: "payment".to_string(),
            reference: None,
        })
        .collect()
}

fn apply_to_slot(slot: &mut MonthSlot, scheduled_amount: Money, effect: &BillPaymentEffect, transaction_id: &str, timestamp: DateTime<Utc>) {
    slot.amount += effect.base_paid + effect.penalty_paid;
    slot.base_paid += effect.base_paid;
    slot.penalty_paid += effect.penalty_paid;
    slot.date = Some(timestamp);
    slot.notes.push(Note {
        transaction_id: transaction_id.to_string(),
        timestamp,
        text: effect.note_text.clone(),
        amount: effect.base_paid + effect.penalty_paid,
        base_paid: effect.base_paid,
        penalty_paid: effect.penalty_paid,
    });
    // the slot itself has no independent penaltyAmount field to compare
    // against (penalty totals live on the materialized Bill, recomputed
    // by `penalty::recalculate` on every read); treat whatever penalty
    // has been paid so far as fully satisfying whatever was owed, so the
    // stored status never disagrees with a fully-paid base.
    slot.status = bill_status(slot.base_paid, scheduled_amount, slot.penalty_paid, slot.penalty_paid);
}

/// decompose a materialized dues `bill_id` (`dues:{fiscalYear}:{index}` or
/// `dues:{fiscalYear}:Q{n}`) back into its fiscal year and month-or-quarter
/// position. used by the unified payment engine to tag aggregated bills
/// with the metadata spec.md §4.6.2 requires without re-deriving it from
/// the period string a second time.
pub fn parse_bill_id(bill_id: &str) -> Result<(i32, Option<u32>, Option<u32>)> {
    let mut parts = bill_id.split(':');
    let prefix = parts.next();
    let year_part = parts.next();
    let position_part = parts.next();
    let (Some("dues"), Some(year_str), Some(position_str)) = (prefix, year_part, position_part) else {
        return Err(BillingError::DateParse(format!("not a dues bill id: {}", bill_id)));
    };
    let fiscal_year: i32 = year_str.parse().map_err(|_| BillingError::DateParse(format!("invalid dues bill id: {}", bill_id)))?;
    if let Some(q_str) = position_str.strip_prefix('Q') {
        let q: u32 = q_str.parse().map_err(|_| BillingError::DateParse(format!("invalid dues bill id: {}", bill_id)))?;
        Ok((fiscal_year, None, Some(q)))
    } else {
        let index: u32 = position_str.parse().map_err(|_| BillingError::DateParse(format!("invalid dues bill id: {}", bill_id)))?;
        Ok((fiscal_year, Some(index), None))
    }
}

fn quarter_indices(q: u32) -> [u32; 3] {
    let start = 3 * (q - 1);
    [start, start + 1, start + 2]
}

fn parse_quarter_number(period: &str) -> Result<u32> {
    period
        .rsplit('Q')
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|q| (1..=4).contains(q))
        .ok_or_else(|| BillingError::DateParse(format!("invalid quarterly period: {}", period)))
}

fn parse_monthly_period_index(period: &str, fiscal_year: i32, config: &ClientConfig) -> Result<u32> {
    let mut parts = period.split('-');
    let year: i32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BillingError::DateParse(format!("invalid monthly period: {}", period)))?;
    let month: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BillingError::DateParse(format!("invalid monthly period: {}", period)))?;
    for index in 0..12u32 {
        let due = fiscal::due_date_of_fiscal_month(fiscal_year, index, config.fiscal_year_start_month);
        if due.year() == year && due.month() == month {
            return Ok(index);
        }
    }
    Err(BillingError::DateParse(format!("period {} not found in fiscal year {}", period, fiscal_year)))
}
