use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// which billing stream a bill belongs to (spec.md §9: replaces the
/// source's `categoryId.includes('water')` substring checks with a tag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleType {
    Hoa,
    Water,
}

impl ModuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleType::Hoa => "hoa",
            ModuleType::Water => "water",
        }
    }
}

/// a bill's lifecycle state, always a pure function of its paid/charged
/// fields (spec.md §3.2), never stored independently of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillStatus {
    #[default]
    Unpaid,
    Partial,
    Paid,
}

/// derive `status` from the four paid/charged fields, per spec.md §3.2:
/// paid iff both base and penalty are fully satisfied; partial iff any
/// positive payment exists; unpaid otherwise.
pub fn derive_status(base_paid: Money, base_charge: Money, penalty_paid: Money, penalty_amount: Money) -> BillStatus {
    if base_paid >= base_charge && penalty_paid >= penalty_amount {
        BillStatus::Paid
    } else if base_paid.is_positive() || penalty_paid.is_positive() {
        BillStatus::Partial
    } else {
        BillStatus::Unpaid
    }
}

/// one structured note entry on a dues payment slot (spec.md §9: legacy
/// string notes are promoted to single-entry arrays of this shape on read).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub amount: Money,
    pub base_paid: Money,
    pub penalty_paid: Money,
}

/// one payment applied against a bill (spec.md §3.2 `payments[]`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub transaction_id: String,
    pub timestamp: DateTime<Utc>,
    pub base_paid: Money,
    pub penalty_paid: Money,
    pub method: String,
    /// external reference (e.g. a bank deposit slip number), water
    /// payments only (spec.md §4.5); dues payment records have none.
    #[serde(default)]
    pub reference: Option<String>,
}

/// a billable period for one unit, the common shape shared by the HOA and
/// water streams (spec.md §3.2). the dues and water adapters materialize
/// this from their respective stored documents; the engine never persists
/// a `Bill` directly, only the per-slot or per-bill fields it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bill {
    pub bill_id: String,
    pub period: String,
    pub unit_id: String,
    pub module_type: ModuleType,
    pub base_charge: Money,
    pub base_paid: Money,
    pub penalty_amount: Money,
    pub penalty_paid: Money,
    pub due_date: NaiveDate,
    pub payments: Vec<PaymentRecord>,
}

impl Bill {
    pub fn base_owed(&self) -> Money {
        self.base_charge - self.base_paid
    }

    pub fn penalty_owed(&self) -> Money {
        self.penalty_amount - self.penalty_paid
    }

    pub fn total_owed(&self) -> Money {
        self.base_owed() + self.penalty_owed()
    }

    pub fn paid_amount(&self) -> Money {
        self.base_paid + self.penalty_paid
    }

    pub fn status(&self) -> BillStatus {
        derive_status(self.base_paid, self.base_charge, self.penalty_paid, self.penalty_amount)
    }
}

/// a discriminated union of allocation kinds (spec.md §9), replacing the
/// source's stringly-typed `categoryId` dispatch. each variant carries
/// exactly the fields its kind needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Allocation {
    HoaMonth { target_id: String, target_name: String, amount: Money, category_id: String },
    HoaPenalty { target_id: String, target_name: String, amount: Money, category_id: String },
    WaterConsumption { target_id: String, target_name: String, amount: Money, category_id: String },
    WaterPenalty { target_id: String, target_name: String, amount: Money, category_id: String },
    CreditAdded { target_id: String, target_name: String, amount: Money },
    CreditUsed { target_id: String, target_name: String, amount: Money },
}

impl Allocation {
    pub fn amount(&self) -> Money {
        match self {
            Allocation::HoaMonth { amount, .. }
            | Allocation::HoaPenalty { amount, .. }
            | Allocation::WaterConsumption { amount, .. }
            | Allocation::WaterPenalty { amount, .. }
            | Allocation::CreditAdded { amount, .. }
            | Allocation::CreditUsed { amount, .. } => *amount,
        }
    }
}

/// transaction kind (spec.md §3.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Income,
    Expense,
    Transfer,
}

/// an immutable record of money received, with a split-allocation
/// structure (spec.md §3.6). `category_id` is `-split-` whenever more than
/// one allocation is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub date: DateTime<Utc>,
    pub amount: Money,
    pub transaction_type: TransactionType,
    pub category_id: String,
    pub allocations: Vec<Allocation>,
    /// the unit this payment was recorded against. not enumerated among
    /// spec.md §3.6's listed fields but required for the statement
    /// composer (§4.8) to find a unit's transactions without scanning
    /// every allocation of every transaction in the client.
    pub unit_id: String,
}

impl Transaction {
    pub fn category_id_for(allocations: &[Allocation]) -> String {
        if allocations.len() > 1 {
            "-split-".to_string()
        } else if let Some(single) = allocations.first() {
            match single {
                Allocation::HoaMonth { category_id, .. }
                | Allocation::HoaPenalty { category_id, .. }
                | Allocation::WaterConsumption { category_id, .. }
                | Allocation::WaterPenalty { category_id, .. } => category_id.clone(),
                Allocation::CreditAdded { .. } => "credit_added".to_string(),
                Allocation::CreditUsed { .. } => "credit_used".to_string(),
            }
        } else {
            String::new()
        }
    }

    pub fn total_allocated(&self) -> Money {
        self.allocations.iter().fold(Money::ZERO, |acc, a| acc + a.amount())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_status_unpaid() {
        let status = derive_status(Money::ZERO, Money::from_pesos(100), Money::ZERO, Money::ZERO);
        assert_eq!(status, BillStatus::Unpaid);
    }

    #[test]
    fn test_derive_status_partial() {
        let status = derive_status(Money::from_pesos(50), Money::from_pesos(100), Money::ZERO, Money::ZERO);
        assert_eq!(status, BillStatus::Partial);
    }

    #[test]
    fn test_derive_status_paid() {
        let status = derive_status(Money::from_pesos(100), Money::from_pesos(100), Money::from_pesos(10), Money::from_pesos(10));
        assert_eq!(status, BillStatus::Paid);
    }

    #[test]
    fn test_transaction_category_id_split_when_multiple_allocations() {
        let allocations = vec![
            Allocation::HoaMonth {
                target_id: "b1".into(),
                target_name: "2026-00".into(),
                amount: Money::from_pesos(100),
                category_id: "hoa_dues".into(),
            },
            Allocation::CreditAdded { target_id: "u1".into(), target_name: "credit".into(), amount: Money::from_pesos(5) },
        ];
        assert_eq!(Transaction::category_id_for(&allocations), "-split-");
    }

    #[test]
    fn test_transaction_total_allocated() {
        let allocations = vec![
            Allocation::HoaMonth {
                target_id: "b1".into(),
                target_name: "2026-00".into(),
                amount: Money::from_pesos(100),
                category_id: "hoa_dues".into(),
            },
            Allocation::HoaPenalty {
                target_id: "b1".into(),
                target_name: "2026-00".into(),
                amount: Money::from_pesos(5),
                category_id: "hoa_penalty".into(),
            },
        ];
        let txn = Transaction {
            id: "t1".into(),
            date: Utc::now(),
            amount: Money::from_pesos(105),
            transaction_type: TransactionType::Income,
            category_id: Transaction::category_id_for(&allocations),
            allocations,
            unit_id: "u1".into(),
        };
        assert_eq!(txn.total_allocated(), Money::from_pesos(105));
    }
}
