use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::money::Money;

/// domain events the core emits while processing a payment or penalty
/// recalculation. grounded on the teacher crate's `Event`/`EventStore`
/// append-and-drain pattern, retagged to this domain's operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    PaymentPreviewed {
        client_id: String,
        unit_id: String,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    PaymentRecorded {
        client_id: String,
        unit_id: String,
        transaction_id: String,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    StaleStateDetected {
        client_id: String,
        unit_id: String,
        divergence_centavos: i64,
        timestamp: DateTime<Utc>,
    },
    CreditAppended {
        client_id: String,
        unit_id: String,
        amount: Money,
        resulting_balance: Money,
        timestamp: DateTime<Utc>,
    },
    PenaltiesRecalculated {
        client_id: String,
        unit_id: String,
        bills_updated: u32,
        total_penalties_added: Money,
        timestamp: DateTime<Utc>,
    },
    BillPaid {
        client_id: String,
        unit_id: String,
        bill_id: String,
        timestamp: DateTime<Utc>,
    },
    ReconciliationWarning {
        client_id: String,
        unit_id: String,
        discrepancy_centavos: i64,
        timestamp: DateTime<Utc>,
    },
}

/// append-only event buffer collected during a single operation and
/// drained by the caller, identical in shape to the teacher's `EventStore`.
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        EventStore { events: Vec::new() }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
