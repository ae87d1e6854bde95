pub mod adapters;
pub mod clock;
pub mod config;
pub mod credit;
pub mod engine;
pub mod errors;
pub mod events;
pub mod fiscal;
pub mod money;
pub mod penalty;
pub mod statement;
pub mod storage;
pub mod types;

// re-export key types
pub use adapters::{DuesAdapter, WaterAdapter};
pub use clock::{Clock, SystemClock, TestClock};
pub use config::{ClientConfig, DuesFrequency, PenaltyPolicy, WaterConfig};
pub use credit::{CreditEntry, CreditEntryType, CreditLedgerService, CreditSource};
pub use engine::{Distribution, PaymentData, UnifiedPaymentEngine};
pub use errors::{BillingError, Result};
pub use events::{Event, EventStore};
pub use money::{Money, Rate};
pub use penalty::{recalculate, RecalcResult};
pub use statement::{LineItem, LineItemType, Reconciliation, Statement, StatementComposer};
pub use storage::{Batch, DocFilter, MemoryStore, Storage};
pub use types::{
    derive_status, Allocation, Bill, BillStatus, ModuleType, Note, PaymentRecord, Transaction, TransactionType,
};

// re-export external dependencies that users will need
pub use chrono;
pub use chrono_tz;
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
