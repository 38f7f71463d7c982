use crate::schema::BillCycle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid recurrence count {count}: must be between {min} and {max}")]
    InvalidRecurrenceCount { count: u32, min: u32, max: u32 },

    #[error("Invalid closing day {0}: must be between 1 and 28")]
    InvalidClosingDay(u32),

    #[error("Invalid due day {0}: must be between 1 and 28")]
    InvalidDueDay(u32),

    #[error("Invalid month {0}: must be between 1 and 12")]
    InvalidMonth(u32),

    #[error("Amount out of range: {0}")]
    AmountOutOfRange(String),

    #[error("Date calculation error: {0}")]
    DateOutOfRange(String),

    #[error("Entry {entry_id} is stamped for cycle {stored} but its date resolves to {derived}")]
    InconsistentCycleAssignment {
        entry_id: String,
        stored: BillCycle,
        derived: BillCycle,
    },

    #[error("Recurrence group {group_id} partially written: {} entries succeeded, entry #{failed_index} failed (rolled back: {rolled_back})", succeeded.len())]
    PartialGroupWrite {
        group_id: String,
        succeeded: Vec<usize>,
        failed_index: usize,
        rolled_back: bool,
    },

    #[error("Recurrence group {group_id} is inconsistent: {details}")]
    BrokenRecurrenceGroup { group_id: String, details: String },

    #[error("Settlement {settlement_id} points at missing account entry {entry_id}")]
    OrphanSettlementRisk {
        settlement_id: String,
        entry_id: String,
    },

    #[error("Card {card_id} has carried an unpaid balance into {cycle} for more than {max_lookback} cycles")]
    CarryForwardLookbackExceeded {
        card_id: String,
        cycle: BillCycle,
        max_lookback: u32,
    },

    #[error("Entry {entry_id} belongs to paid cycle {cycle} and cannot be changed")]
    CycleLocked { entry_id: String, cycle: BillCycle },

    #[error("Entry {entry_id} is the booked payment of settlement {settlement_id}; reverse the payment instead")]
    LinkedToSettlement {
        entry_id: String,
        settlement_id: String,
    },

    #[error("Card mismatch: expected {expected}, found {found}")]
    CardMismatch { expected: String, found: String },

    #[error("No billing configuration for card: {0}")]
    MissingCard(String),

    #[error("Document {id} not found in {collection}")]
    NotFound { collection: String, id: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
