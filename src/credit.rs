use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{BillingError, Result};
use crate::money::Money;
use crate::storage::Storage;

/// why a credit entry exists (spec.md §3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditEntryType {
    StartingBalance,
    CreditAdded,
    CreditUsed,
    ManualAdjustment,
}

/// where a credit entry originated (spec.md §3.5)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CreditSource {
    Payment,
    UnifiedPayment,
    Import,
    Manual,
}

/// one append-only credit ledger entry. entries are never mutated or
/// deleted; reversals are new entries with an opposite sign and a
/// `transaction_id` back-reference (spec.md §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub amount: Money,
    pub entry_type: CreditEntryType,
    pub source: CreditSource,
    pub transaction_id: Option<String>,
    pub note: String,
}

/// sum entry amounts: the only legitimate way to derive a balance
/// (spec.md §3.5's fundamental invariant: a cached `creditBalance` field
/// is never trusted).
pub fn sum_balance(history: &[CreditEntry]) -> Money {
    history.iter().fold(Money::ZERO, |acc, e| acc + e.amount)
}

pub fn sum_balance_as_of(history: &[CreditEntry], as_of: DateTime<Utc>) -> Money {
    history.iter().filter(|e| e.timestamp <= as_of).fold(Money::ZERO, |acc, e| acc + e.amount)
}

/// check whether appending `amount` to `history` would drive the balance
/// negative; returns the resulting balance either way (the caller decides
/// whether to reject).
pub fn validate_append(history: &[CreditEntry], amount: Money) -> Result<Money> {
    let resulting = sum_balance(history) + amount;
    if resulting.is_negative() {
        return Err(BillingError::NegativeBalance { resulting_balance: resulting.centavos() });
    }
    Ok(resulting)
}

/// per-unit credit history, stored under `clients/{cid}/units/creditBalances`
/// as a map of `unitId -> { history[], lastChange }` (spec.md §3.5/§6.3).
/// `last_change` is a write-through hint only; it is never read as a
/// balance source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnitCreditDoc {
    #[serde(default)]
    history: Vec<CreditEntry>,
    #[serde(default)]
    last_change: Option<DateTime<Utc>>,
}

/// the Credit Ledger component (spec.md §4.3). depends only on money
/// primitives and the storage interface, as the control-flow graph in
/// spec.md §2 requires.
pub struct CreditLedgerService<'s> {
    storage: &'s dyn Storage,
}

impl<'s> CreditLedgerService<'s> {
    pub fn new(storage: &'s dyn Storage) -> Self {
        CreditLedgerService { storage }
    }

    fn doc_path(client_id: &str) -> String {
        format!("clients/{}/units/creditBalances", client_id)
    }

    fn load_unit_doc(&self, client_id: &str, unit_id: &str) -> Result<UnitCreditDoc> {
        let doc = self.storage.get_doc(&Self::doc_path(client_id))?;
        let unit_value = doc.and_then(|d| d.get(unit_id).cloned());
        match unit_value {
            Some(v) => Ok(serde_json::from_value(v).map_err(|e| BillingError::Storage(e.to_string()))?),
            None => Ok(UnitCreditDoc::default()),
        }
    }

    pub fn balance(&self, client_id: &str, unit_id: &str) -> Result<Money> {
        let doc = self.load_unit_doc(client_id, unit_id)?;
        Ok(sum_balance(&doc.history))
    }

    pub fn balance_as_of(&self, client_id: &str, unit_id: &str, as_of: DateTime<Utc>) -> Result<Money> {
        let doc = self.load_unit_doc(client_id, unit_id)?;
        Ok(sum_balance_as_of(&doc.history, as_of))
    }

    pub fn history(&self, client_id: &str, unit_id: &str) -> Result<Vec<CreditEntry>> {
        let doc = self.load_unit_doc(client_id, unit_id)?;
        Ok(doc.history)
    }

    /// append a new entry, failing with `NegativeBalance` if it would
    /// drive the cumulative balance below zero.
    pub fn append(&self, client_id: &str, unit_id: &str, entry: CreditEntry) -> Result<Money> {
        let mut doc = self.load_unit_doc(client_id, unit_id)?;
        let resulting = validate_append(&doc.history, entry.amount)?;
        doc.last_change = Some(entry.timestamp);
        doc.history.push(entry);
        let path = Self::doc_path(client_id);
        self.storage.update_doc(&path, json!({ unit_id: doc }))?;
        Ok(resulting)
    }

    /// stage an append onto an already-open batch rather than committing
    /// immediately, so it can be part of the unified payment engine's
    /// atomic multi-document commit (spec.md §5.3).
    pub fn append_to_batch(
        &self,
        batch: &mut dyn crate::storage::Batch,
        client_id: &str,
        unit_id: &str,
        entry: CreditEntry,
    ) -> Result<Money> {
        let doc = self.load_unit_doc(client_id, unit_id)?;
        let resulting = validate_append(&doc.history, entry.amount)?;
        let mut updated = doc;
        updated.last_change = Some(entry.timestamp);
        updated.history.push(entry);
        let path = Self::doc_path(client_id);
        let mut merge: Value = json!({});
        merge[unit_id] = serde_json::to_value(&updated).map_err(|e| BillingError::Storage(e.to_string()))?;
        batch.update(&path, merge);
        Ok(resulting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn entry(amount: Money, ts: DateTime<Utc>, entry_type: CreditEntryType) -> CreditEntry {
        CreditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: ts,
            amount,
            entry_type,
            source: CreditSource::Payment,
            transaction_id: None,
            note: String::new(),
        }
    }

    #[test]
    fn test_balance_derived_by_summation() {
        let store = MemoryStore::new();
        let ledger = CreditLedgerService::new(&store);
        let t0 = Utc::now();
        ledger.append("c1", "u1", entry(Money::from_pesos(100), t0, CreditEntryType::StartingBalance)).unwrap();
        ledger.append("c1", "u1", entry(Money::from_pesos(-30), t0 + chrono::Duration::days(1), CreditEntryType::CreditUsed)).unwrap();
        assert_eq!(ledger.balance("c1", "u1").unwrap(), Money::from_pesos(70));
    }

    #[test]
    fn test_negative_balance_rejected() {
        let store = MemoryStore::new();
        let ledger = CreditLedgerService::new(&store);
        let t0 = Utc::now();
        ledger.append("c1", "u1", entry(Money::from_pesos(20), t0, CreditEntryType::StartingBalance)).unwrap();
        let result = ledger.append("c1", "u1", entry(Money::from_pesos(-50), t0, CreditEntryType::CreditUsed));
        assert!(matches!(result, Err(BillingError::NegativeBalance { .. })));
        // the rejected entry must not have been appended
        assert_eq!(ledger.balance("c1", "u1").unwrap(), Money::from_pesos(20));
    }

    #[test]
    fn test_balance_as_of_respects_cutoff() {
        let store = MemoryStore::new();
        let ledger = CreditLedgerService::new(&store);
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::days(10);
        ledger.append("c1", "u1", entry(Money::from_pesos(100), t0, CreditEntryType::StartingBalance)).unwrap();
        ledger.append("c1", "u1", entry(Money::from_pesos(50), t1, CreditEntryType::CreditAdded)).unwrap();
        assert_eq!(ledger.balance_as_of("c1", "u1", t0).unwrap(), Money::from_pesos(100));
        assert_eq!(ledger.balance_as_of("c1", "u1", t1).unwrap(), Money::from_pesos(150));
    }

    #[test]
    fn test_history_is_monotonic_and_never_shrinks() {
        let store = MemoryStore::new();
        let ledger = CreditLedgerService::new(&store);
        let t0 = Utc::now();
        ledger.append("c1", "u1", entry(Money::from_pesos(10), t0, CreditEntryType::StartingBalance)).unwrap();
        ledger.append("c1", "u1", entry(Money::from_pesos(10), t0 + chrono::Duration::days(1), CreditEntryType::CreditAdded)).unwrap();
        let history = ledger.history("c1", "u1").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp <= history[1].timestamp);
    }
}
