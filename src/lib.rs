//! # myPay Ledger
//!
//! The transaction engine behind myPay: it expands one user-entered
//! transaction into dated recurring or installment entries, places card
//! expenses into monthly billing cycles, settles card bills (partial
//! payments and carried-over balances included) and rolls everything up
//! into balances, budget progress and goal progress.
//!
//! ## Core Concepts
//!
//! - **Money**: integer minor units (`Money`), converted to decimals only at the boundary
//! - **Recurrence group**: the entries spawned by one submission, sharing a group id
//! - **Billing cycle**: a card's monthly statement period, named by the month it closes in
//! - **Settlement**: a payment recorded against one billing cycle
//! - **Document store**: the per-user collections everything is persisted to
//!
//! ## Example
//!
//! ```rust,ignore
//! use mypay_ledger::*;
//! use chrono::NaiveDate;
//!
//! let store = MemoryStore::new();
//! let config = EngineConfig::default();
//! let clock = FixedClock(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
//! let ids = UuidGenerator;
//! let ledger = LedgerProcessor::new(&store, "user-1", &config, &clock, &ids);
//!
//! ledger.put_card(&CardBillingConfig::new("visa", 10, 20)?)?;
//!
//! let entries = ledger.add_transaction(&TransactionDraft {
//!     description: "Notebook".to_string(),
//!     total_amount: Money::from_cents(300_000),
//!     start_date: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
//!     kind: EntryKind::Expense,
//!     owner: EntryOwner::Card { card_id: "visa".to_string() },
//!     policy: RecurrencePolicy::Installment { count: 10, period: InstallmentPeriod::Months },
//!     paid: false,
//!     category: Some(CategoryRef::new("electronics")),
//!     tags: vec![],
//! })?;
//! ```

pub mod aggregator;
pub mod billing;
pub mod clock;
pub mod config;
pub mod edits;
pub mod error;
pub mod export;
pub mod ingestion;
pub mod money;
pub mod recurrence;
pub mod schema;
pub mod settlement;
pub mod store;
pub mod utils;

pub use aggregator::{
    AggregateView, Aggregator, BillReminder, BudgetProgress, BudgetStatus, CardView, GoalProgress, LimitUsage,
};
pub use billing::{cycle_date_range, due_date, is_entry_in_cycle, resolve_cycle};
pub use clock::{Clock, FixedClock, IdGenerator, SequentialIds, SystemClock, UuidGenerator};
pub use config::EngineConfig;
pub use edits::{EntryChange, EntryEdit};
pub use error::{LedgerError, Result};
pub use export::ExportRow;
pub use money::{from_minor_units, split_evenly, to_minor_units, Money, RemainderPolicy};
pub use recurrence::*;
pub use schema::*;
pub use settlement::{BillStatus, CycleLedger, CycleStatement, CycleSummary, ReversalOutcome};
pub use store::{DocumentStore, MemoryStore, UserCollections};
pub use utils::*;

use chrono::NaiveDate;
use log::{debug, info};
use serde::Serialize;
use settlement::SettlementService;
use store::{load_collection, load_document, write_all_or_nothing, WriteOp};

/// Billing configuration and cycle ledger of the card an entry belongs to.
type CardContext = Option<(CardBillingConfig, CycleLedger)>;

/// One user's ledger on top of a document store.
pub struct LedgerProcessor<'a> {
    store: &'a dyn DocumentStore,
    paths: UserCollections,
    config: &'a EngineConfig,
    clock: &'a dyn Clock,
    ids: &'a dyn IdGenerator,
}

impl<'a> LedgerProcessor<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        user_id: &str,
        config: &'a EngineConfig,
        clock: &'a dyn Clock,
        ids: &'a dyn IdGenerator,
    ) -> Self {
        Self {
            store,
            paths: UserCollections::new(user_id),
            config,
            clock,
            ids,
        }
    }

    pub fn paths(&self) -> &UserCollections {
        &self.paths
    }

    fn put<T: Serialize>(&self, collection: &str, id: &str, value: &T) -> Result<()> {
        self.store.put(collection, id, serde_json::to_value(value)?)
    }

    pub fn put_card(&self, card: &CardBillingConfig) -> Result<()> {
        card.validate()?;
        self.put(&self.paths.cards(), &card.card_id, card)
    }

    pub fn put_account(&self, account: &Account) -> Result<()> {
        self.put(&self.paths.accounts(), &account.id, account)
    }

    pub fn put_budget(&self, budget: &Budget) -> Result<()> {
        self.put(&self.paths.budgets(), &budget.id, budget)
    }

    pub fn put_goal(&self, goal: &Goal) -> Result<()> {
        self.put(&self.paths.goals(), &goal.id, goal)
    }

    fn settlements(&self) -> SettlementService<'_> {
        SettlementService::new(self.store, &self.paths, self.config, self.ids)
    }

    fn collection_for(&self, entry: &LedgerEntry) -> String {
        match entry.owner {
            EntryOwner::Card { .. } => self.paths.card_expenses(),
            EntryOwner::Account { .. } => self.paths.transactions(),
        }
    }

    pub fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries: Vec<LedgerEntry> = load_collection(self.store, &self.paths.transactions())?;
        entries.extend(load_collection::<LedgerEntry>(self.store, &self.paths.card_expenses())?);
        Ok(entries)
    }

    fn find_entry(&self, entry_id: &str) -> Result<LedgerEntry> {
        for collection in [self.paths.transactions(), self.paths.card_expenses()] {
            if let Some(entry) = load_document(self.store, &collection, entry_id)? {
                return Ok(entry);
            }
        }
        Err(LedgerError::NotFound {
            collection: format!("{} or {}", self.paths.transactions(), self.paths.card_expenses()),
            id: entry_id.to_string(),
        })
    }

    fn card_context(&self, entry: &LedgerEntry) -> Result<CardContext> {
        let Some(card_id) = entry.card_id() else {
            return Ok(None);
        };
        let service = self.settlements();
        let card = service.card(card_id)?;
        let ledger = service.ledger(&card)?;
        Ok(Some((card, ledger)))
    }

    /// Expands a draft and persists every resulting entry as one write.
    pub fn add_transaction(&self, draft: &TransactionDraft) -> Result<Vec<LedgerEntry>> {
        let card = match &draft.owner {
            EntryOwner::Card { card_id } => Some(self.settlements().card(card_id)?),
            EntryOwner::Account { .. } => None,
        };

        let expander = RecurrenceExpander::new(self.config, self.clock, self.ids);
        let entries = expander.expand(draft, card.as_ref())?;

        let label = match entries.first() {
            Some(first) => {
                if let Some(group_id) = first.group_id() {
                    validate_group(&entries, group_id)?;
                    group_id.to_string()
                } else {
                    first.id.clone()
                }
            }
            None => return Ok(entries),
        };

        let ops = entries
            .iter()
            .map(|e| WriteOp::put(&self.collection_for(e), &e.id, e))
            .collect::<Result<Vec<_>>>()?;
        write_all_or_nothing(self.store, &label, &ops)?;

        info!("Added {} entries for '{}'", entries.len(), draft.description);
        Ok(entries)
    }

    /// Payment entries only change through `reverse_payment`, which removes
    /// them together with their settlement.
    fn ensure_unlinked(&self, entry: &LedgerEntry) -> Result<()> {
        let settlements: Vec<BillSettlement> = load_collection(self.store, &self.paths.bill_payments())?;
        match settlements.into_iter().find(|s| s.entry_id == entry.id) {
            Some(settlement) => Err(LedgerError::LinkedToSettlement {
                entry_id: entry.id.clone(),
                settlement_id: settlement.id,
            }),
            None => Ok(()),
        }
    }

    pub fn update_entry(&self, entry_id: &str, edit: &EntryEdit) -> Result<LedgerEntry> {
        let entry = self.find_entry(entry_id)?;
        self.ensure_unlinked(&entry)?;
        let context = self.card_context(&entry)?;
        let (card, ledger) = match &context {
            Some((card, ledger)) => (Some(card), Some(ledger)),
            None => (None, None),
        };

        let edited = edits::edit_entry(&entry, edit, card, ledger)?;
        self.put(&self.collection_for(&edited), &edited.id, &edited)?;
        debug!("Updated entry {}", edited.id);
        Ok(edited)
    }

    pub fn delete_entry(&self, entry_id: &str) -> Result<LedgerEntry> {
        let entry = self.find_entry(entry_id)?;
        self.ensure_unlinked(&entry)?;
        let context = self.card_context(&entry)?;
        edits::ensure_editable(&entry, context.as_ref().map(|(_, ledger)| ledger))?;

        let collection = self.collection_for(&entry);
        if !self.store.delete(&collection, &entry.id)? {
            return Err(LedgerError::NotFound {
                collection,
                id: entry.id,
            });
        }
        debug!("Deleted entry {}", entry.id);
        Ok(entry)
    }

    fn group_context(&self, group_id: &str) -> Result<(Vec<LedgerEntry>, CardContext)> {
        let entries: Vec<LedgerEntry> = self
            .entries()?
            .into_iter()
            .filter(|e| e.group_id() == Some(group_id))
            .collect();
        let context = match entries.first() {
            Some(first) => self.card_context(first)?,
            None => None,
        };
        Ok((entries, context))
    }

    /// Applies `edit` to every entry of the group; returns how many changed.
    pub fn update_group(&self, group_id: &str, edit: &EntryEdit) -> Result<usize> {
        let (entries, context) = self.group_context(group_id)?;
        let (card, ledger) = match &context {
            Some((card, ledger)) => (Some(card), Some(ledger)),
            None => (None, None),
        };

        let edited = edits::edit_group(&entries, group_id, edit, card, ledger)?;
        let ops = edited
            .iter()
            .map(|e| WriteOp::put(&self.collection_for(e), &e.id, e))
            .collect::<Result<Vec<_>>>()?;
        write_all_or_nothing(self.store, group_id, &ops)?;

        info!("Updated {} entries of group {}", edited.len(), group_id);
        Ok(edited.len())
    }

    /// Deletes every entry of the group and returns what was removed.
    pub fn delete_group(&self, group_id: &str) -> Result<Vec<LedgerEntry>> {
        let (entries, context) = self.group_context(group_id)?;
        let removed = edits::group_for_delete(&entries, group_id, context.as_ref().map(|(_, l)| l))?;

        let ops: Vec<WriteOp> = removed
            .iter()
            .map(|e| WriteOp::delete(&self.collection_for(e), &e.id))
            .collect();
        write_all_or_nothing(self.store, group_id, &ops)?;

        info!("Deleted {} entries of group {}", removed.len(), group_id);
        Ok(removed)
    }

    pub fn ledger(&self, card_id: &str) -> Result<CycleLedger> {
        let service = self.settlements();
        let card = service.card(card_id)?;
        service.ledger(&card)
    }

    pub fn statement(&self, card_id: &str, cycle: BillCycle) -> Result<CycleStatement> {
        self.ledger(card_id)?.statement(cycle)
    }

    pub fn is_bill_paid(&self, card_id: &str, cycle: BillCycle) -> Result<bool> {
        self.ledger(card_id)?.is_bill_paid(cycle)
    }

    pub fn record_payment(
        &self,
        card_id: &str,
        cycle: BillCycle,
        amount: Money,
        funding_account_id: &str,
        date: NaiveDate,
    ) -> Result<BillSettlement> {
        self.settlements()
            .record_payment(card_id, cycle, amount, funding_account_id, date)
    }

    pub fn reverse_payment(&self, settlement_id: &str) -> Result<ReversalOutcome> {
        self.settlements().reverse_payment(settlement_id)
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        Ok(LedgerSnapshot {
            accounts: load_collection(self.store, &self.paths.accounts())?,
            cards: load_collection(self.store, &self.paths.cards())?,
            entries: self.entries()?,
            settlements: load_collection(self.store, &self.paths.bill_payments())?,
            budgets: load_collection(self.store, &self.paths.budgets())?,
            goals: load_collection(self.store, &self.paths.goals())?,
        })
    }

    /// Aggregates the current month as of the processor's clock.
    pub fn aggregate(&self) -> Result<AggregateView> {
        Aggregator::new(self.config).run(&self.snapshot()?, self.clock.today())
    }

    pub fn export_rows(&self) -> Result<Vec<ExportRow>> {
        Ok(export::export_rows(&self.snapshot()?))
    }

    /// One-time migration: stamps unstamped card entries with the cycle their
    /// date falls in under each card's current closing day.
    pub fn migrate_legacy_stamps(&self) -> Result<usize> {
        let collection = self.paths.card_expenses();
        let cards: Vec<CardBillingConfig> = load_collection(self.store, &self.paths.cards())?;
        let mut entries: Vec<LedgerEntry> = load_collection(self.store, &collection)?;
        entries.retain(|e| e.bill_cycle.is_none());

        let stamped = billing::stamp_legacy_entries(&mut entries, &cards)?;
        let ops = entries
            .iter()
            .map(|e| WriteOp::put(&collection, &e.id, e))
            .collect::<Result<Vec<_>>>()?;
        write_all_or_nothing(self.store, "legacy-cycle-stamps", &ops)?;
        Ok(stamped)
    }

    /// Integrity findings: cycle stamps that disagree with the current
    /// closing day, cards still owing a balance carried past the lookback
    /// limit, and settlements whose account entry is gone.
    pub fn audit(&self) -> Result<Vec<LedgerError>> {
        let snapshot = self.snapshot()?;
        let mut findings = Vec::new();

        for card in &snapshot.cards {
            findings.extend(billing::audit_cycle_stamps(&snapshot.entries, card));
            let ledger = CycleLedger::build(card, &snapshot.entries, &snapshot.settlements, self.config)?;
            findings.extend(ledger.lookback_breach()?);
        }

        findings.extend(settlement::audit_settlements(&snapshot.settlements, &snapshot.entries));
        Ok(findings)
    }
}
