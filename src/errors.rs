use thiserror::Error;

/// the core's single error taxonomy (spec.md §7). every variant carries a
/// stable identifier; none is silently swallowed.
#[derive(Error, Debug)]
pub enum BillingError {
    #[error("required configuration field missing: {field}")]
    ConfigMissing { field: String },

    #[error("allocation sum {allocated} does not match transaction amount {amount}")]
    AllocationMismatch { allocated: i64, amount: i64 },

    #[error("credit append would drive balance to {resulting_balance}, below zero")]
    NegativeBalance { resulting_balance: i64 },

    #[error("preview diverges from current state by {divergence_centavos} centavos")]
    StaleState { divergence_centavos: i64 },

    #[error("bill not found: {bill_id}")]
    BillNotFound { bill_id: String },

    #[error("bill {bill_id} has no resolvable due date")]
    DueDateUnresolvable { bill_id: String },

    #[error("document not found at {path}")]
    DocumentNotFound { path: String },

    #[error("storage backend error: {0}")]
    Storage(String),

    #[error("storage lock was poisoned by a prior panic")]
    StoragePoisoned,

    #[error("failed to parse date: {0}")]
    DateParse(String),

    #[error("invalid fiscal configuration: {0}")]
    InvalidConfig(String),

    /// test-only: surfaced when a display conversion produces a
    /// non-terminating decimal. never constructed outside `#[cfg(test)]`.
    #[cfg(test)]
    #[error("money value acquired a fractional-centavo tail")]
    FloatingPointTail,
}

pub type Result<T> = std::result::Result<T, BillingError>;
