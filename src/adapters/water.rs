use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{BillingError, Result};
use crate::money::Money;
use crate::storage::Storage;
use crate::types::{derive_status, Bill, BillStatus, ModuleType, PaymentRecord};

/// one unit's water bill within a fiscal-period document (spec.md §3.4,
/// field shape per §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaterUnitBill {
    pub base_charge: Money,
    #[serde(default)]
    pub base_paid: Money,
    #[serde(default)]
    pub penalty_amount: Money,
    #[serde(default)]
    pub penalty_paid: Money,
    #[serde(default)]
    pub paid_amount: Money,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub payments: Vec<PaymentRecord>,
}

impl WaterUnitBill {
    fn to_bill(&self, unit_id: &str, period: &str) -> Bill {
        Bill {
            bill_id: format!("water:{}:{}", period, unit_id),
            period: period.to_string(),
            unit_id: unit_id.to_string(),
            module_type: ModuleType::Water,
            base_charge: self.base_charge,
            base_paid: self.base_paid,
            penalty_amount: self.penalty_amount,
            penalty_paid: self.penalty_paid,
            due_date: self.due_date,
            payments: self.payments.clone(),
        }
    }

    fn status(&self) -> BillStatus {
        derive_status(self.base_paid, self.base_charge, self.penalty_paid, self.penalty_amount)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BillsSection {
    #[serde(default)]
    units: BTreeMap<String, WaterUnitBill>,
}

/// one document per (client, fiscal-period) for the water stream (spec.md §3.4)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WaterBillDocument {
    #[serde(default)]
    bills: BillsSection,
}

/// a bill-level payment effect to apply to a water bill (write path, spec.md §4.5)
pub struct WaterPaymentEffect {
    pub period: String,
    pub base_paid: Money,
    pub penalty_paid: Money,
    /// the bill's `penaltyAmount` as refreshed by the engine's as-of
    /// recalculation (spec.md §4.7) at the moment this payment was
    /// distributed. written onto the stored bill alongside the payment
    /// deltas so `penaltyPaid` is never left exceeding a stale
    /// `penaltyAmount` (spec.md §3.2 invariant).
    pub new_penalty_amount: Money,
    pub method: String,
    pub reference: Option<String>,
}

/// selects unpaid water bills for a unit, refreshes penalty fields, and
/// applies payments (spec.md §4.5).
pub struct WaterAdapter<'s> {
    storage: &'s dyn Storage,
}

impl<'s> WaterAdapter<'s> {
    pub fn new(storage: &'s dyn Storage) -> Self {
        WaterAdapter { storage }
    }

    fn collection_path(client_id: &str) -> String {
        format!("clients/{}/projects/waterBills/bills", client_id)
    }

    fn doc_path(client_id: &str, period: &str) -> String {
        format!("{}/{}", Self::collection_path(client_id), period)
    }

    fn load_doc(&self, client_id: &str, period: &str) -> Result<Option<WaterBillDocument>> {
        match self.storage.get_doc(&Self::doc_path(client_id, period))? {
            Some(value) => Ok(Some(serde_json::from_value(value).map_err(|e| BillingError::Storage(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// all water bill periods known to this client, in lexical (therefore
    /// chronological, since periods are `YYYY-NN`) order.
    fn known_periods(&self, client_id: &str) -> Result<Vec<String>> {
        let docs = self.storage.list_docs(&Self::collection_path(client_id), None)?;
        let mut periods: Vec<String> = docs
            .into_iter()
            .map(|(path, _)| path.rsplit('/').next().unwrap_or_default().to_string())
            .collect();
        periods.sort();
        Ok(periods)
    }

    /// select every bill for `unit_id` whose `status != paid` (spec.md
    /// §4.5). bills strictly in the future of the current fiscal period
    /// are included here; the engine is responsible for excluding them
    /// from distribution (water is strictly postpaid, §4.6.3's tier 99).
    pub fn select_unpaid(&self, client_id: &str, unit_id: &str) -> Result<Vec<Bill>> {
        let mut bills = Vec::new();
        for period in self.known_periods(client_id)? {
            if let Some(doc) = self.load_doc(client_id, &period)? {
                if let Some(unit_bill) = doc.bills.units.get(unit_id) {
                    if unit_bill.status() != BillStatus::Paid {
                        bills.push(unit_bill.to_bill(unit_id, &period));
                    }
                }
            }
        }
        Ok(bills)
    }

    /// every bill for `unit_id` whose due date falls within `[start, end)`,
    /// regardless of payment status. used by the statement composer
    /// (spec.md §4.8), which needs the unit's full charge history for a
    /// fiscal year, not just what remains unpaid.
    pub fn bills_for_unit_in_range(&self, client_id: &str, unit_id: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<Bill>> {
        let mut bills = Vec::new();
        for period in self.known_periods(client_id)? {
            if let Some(doc) = self.load_doc(client_id, &period)? {
                if let Some(unit_bill) = doc.bills.units.get(unit_id) {
                    if unit_bill.due_date >= start && unit_bill.due_date < end {
                        bills.push(unit_bill.to_bill(unit_id, &period));
                    }
                }
            }
        }
        bills.sort_by_key(|b| b.due_date);
        Ok(bills)
    }

    /// apply payment effects back onto the unit's water bills (spec.md §4.5
    /// write path): `paidAmount += Δtotal`, `basePaid += Δbase`,
    /// `penaltyPaid += Δpenalty`, append a payment record, recompute status.
    pub fn apply_payment(
        &self,
        client_id: &str,
        unit_id: &str,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        effects: &[WaterPaymentEffect],
    ) -> Result<()> {
        for (path, doc) in self.merge_effects(client_id, unit_id, transaction_id, timestamp, effects)? {
            let value = serde_json::to_value(&doc).map_err(|e| BillingError::Storage(e.to_string()))?;
            self.storage.set_doc(&path, value)?;
        }
        Ok(())
    }

    /// batched counterpart of `apply_payment`, staging each affected
    /// period document onto `batch` instead of writing immediately, so it
    /// can be part of the unified payment engine's atomic commit
    /// (spec.md §5.3).
    pub fn apply_payment_to_batch(
        &self,
        batch: &mut dyn crate::storage::Batch,
        client_id: &str,
        unit_id: &str,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        effects: &[WaterPaymentEffect],
    ) -> Result<()> {
        for (path, doc) in self.merge_effects(client_id, unit_id, transaction_id, timestamp, effects)? {
            let value = serde_json::to_value(&doc).map_err(|e| BillingError::Storage(e.to_string()))?;
            batch.set(&path, value);
        }
        Ok(())
    }

    /// load every period document touched by `effects`, merge the payment
    /// deltas onto the unit's bill, and return the updated documents
    /// without writing anything: shared by the immediate and batched
    /// write paths.
    fn merge_effects(
        &self,
        client_id: &str,
        unit_id: &str,
        transaction_id: &str,
        timestamp: DateTime<Utc>,
        effects: &[WaterPaymentEffect],
    ) -> Result<Vec<(String, WaterBillDocument)>> {
        let mut by_period: BTreeMap<String, Vec<&WaterPaymentEffect>> = BTreeMap::new();
        for effect in effects {
            by_period.entry(effect.period.clone()).or_default().push(effect);
        }

        let mut updated_docs = Vec::with_capacity(by_period.len());
        for (period, period_effects) in by_period {
            let path = Self::doc_path(client_id, &period);
            let mut doc = self
                .load_doc(client_id, &period)?
                .ok_or_else(|| BillingError::DocumentNotFound { path: path.clone() })?;
            let unit_bill = doc
                .bills
                .units
                .get_mut(unit_id)
                .ok_or_else(|| BillingError::BillNotFound { bill_id: format!("water:{}:{}", period, unit_id) })?;

            for effect in period_effects {
                let delta_total = effect.base_paid + effect.penalty_paid;
                unit_bill.paid_amount += delta_total;
                unit_bill.base_paid += effect.base_paid;
                unit_bill.penalty_paid += effect.penalty_paid;
                unit_bill.penalty_amount = effect.new_penalty_amount;
                unit_bill.payments.push(PaymentRecord {
                    transaction_id: transaction_id.to_string(),
                    timestamp,
                    base_paid: effect.base_paid,
                    penalty_paid: effect.penalty_paid,
                    method: effect.method.clone(),
                    reference: effect.reference.clone(),
                });
            }

            updated_docs.push((path, doc));
        }
        Ok(updated_docs)
    }
}
