//! Card bill settlement.
//!
//! `CycleLedger` walks a card's cycles forward from the first one with any
//! activity and derives, for each cycle, what was charged, what was carried
//! in from the previous cycle, what is due and what was paid. A cycle is
//! paid when it has at least one settlement and the settlements cover the
//! total due; the same predicate decides the status badge, the edit lock
//! and whether a balance carries forward.
//!
//! `SettlementService` records and reverses payments against the store.

use crate::billing::{cycle_date_range, due_date, entry_cycle};
use crate::clock::IdGenerator;
use crate::config::EngineConfig;
use crate::error::{LedgerError, Result};
use crate::money::Money;
use crate::schema::{
    BillCycle, BillSettlement, CardBillingConfig, CategoryRef, EntryKind, EntryOwner, LedgerEntry,
};
use crate::store::{
    load_collection, load_document, write_all_or_nothing, DocumentStore, UserCollections, WriteOp,
};
use crate::utils::months_between;
use chrono::NaiveDate;
use log::{debug, info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    /// Nothing owed and nothing paid.
    Empty,
    Open,
    PartiallyPaid,
    Paid,
    Overpaid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CycleSummary {
    pub card_id: String,
    pub cycle: BillCycle,
    /// Expenses minus credits billed to this cycle.
    pub own_total: Money,
    pub carried_over: Money,
    pub total_due: Money,
    pub total_paid: Money,
    /// Unpaid part of `total_due`; this is what the next cycle carries in.
    pub remaining: Money,
    pub settlement_count: usize,
    pub status: BillStatus,
    /// Consecutive earlier cycles that left a balance unpaid, ending at the previous one.
    pub unpaid_streak: u32,
    /// The unpaid streak is longer than the configured carry lookback.
    pub lookback_exceeded: bool,
    pub entry_ids: Vec<String>,
}

impl CycleSummary {
    fn new(card_id: &str, cycle: BillCycle) -> Self {
        Self {
            card_id: card_id.to_string(),
            cycle,
            own_total: Money::ZERO,
            carried_over: Money::ZERO,
            total_due: Money::ZERO,
            total_paid: Money::ZERO,
            remaining: Money::ZERO,
            settlement_count: 0,
            status: BillStatus::Empty,
            unpaid_streak: 0,
            lookback_exceeded: false,
            entry_ids: Vec::new(),
        }
    }

    pub fn is_paid(&self) -> bool {
        self.settlement_count > 0 && self.total_paid >= self.total_due
    }

    fn settle(&mut self, carried_over: Money, unpaid_streak: u32, max_lookback: u32) {
        self.carried_over = carried_over;
        self.unpaid_streak = unpaid_streak;
        self.lookback_exceeded = unpaid_streak > max_lookback;
        self.total_due = self.own_total + carried_over;
        self.remaining = (self.total_due - self.total_paid).max(Money::ZERO);

        self.status = if self.is_paid() {
            if self.total_paid > self.total_due {
                BillStatus::Overpaid
            } else {
                BillStatus::Paid
            }
        } else if self.total_due <= Money::ZERO && self.total_paid.is_zero() {
            BillStatus::Empty
        } else if self.total_paid > Money::ZERO {
            BillStatus::PartiallyPaid
        } else {
            BillStatus::Open
        };
    }

    /// Balance this cycle pushes into the next one.
    fn carry_out(&self) -> Money {
        self.remaining
    }
}

/// A cycle summary together with its calendar boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CycleStatement {
    pub summary: CycleSummary,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub due_date: NaiveDate,
}

/// Per-card cycle totals, computed once per snapshot.
#[derive(Debug, Clone)]
pub struct CycleLedger {
    card: CardBillingConfig,
    cycles: BTreeMap<BillCycle, CycleSummary>,
    max_lookback: u32,
    legacy_fallback: bool,
}

impl CycleLedger {
    pub fn build(
        card: &CardBillingConfig,
        entries: &[LedgerEntry],
        settlements: &[BillSettlement],
        config: &EngineConfig,
    ) -> Result<Self> {
        card.validate()?;

        let mut cycles: BTreeMap<BillCycle, CycleSummary> = BTreeMap::new();

        for entry in entries.iter().filter(|e| e.card_id() == Some(card.card_id.as_str())) {
            let Some(cycle) = entry_cycle(entry, card, config.legacy_cycle_fallback)? else {
                continue;
            };
            let summary = cycles
                .entry(cycle)
                .or_insert_with(|| CycleSummary::new(&card.card_id, cycle));
            summary.own_total += match entry.kind {
                EntryKind::Expense => entry.amount,
                EntryKind::Income => -entry.amount,
            };
            summary.entry_ids.push(entry.id.clone());
        }

        for settlement in settlements.iter().filter(|s| s.card_id == card.card_id) {
            let summary = cycles
                .entry(settlement.cycle)
                .or_insert_with(|| CycleSummary::new(&card.card_id, settlement.cycle));
            summary.total_paid += settlement.amount_paid;
            summary.settlement_count += 1;
        }

        // Fill the gaps so every cycle between the first and the last is present
        // and carries are propagated through months without activity.
        if let (Some(&first), Some(&last)) = (cycles.keys().next(), cycles.keys().next_back()) {
            let mut cycle = first;
            let mut carry = Money::ZERO;
            let mut streak = 0u32;
            while cycle <= last {
                let summary = cycles
                    .entry(cycle)
                    .or_insert_with(|| CycleSummary::new(&card.card_id, cycle));
                summary.settle(carry, streak, config.max_carry_lookback);
                if summary.lookback_exceeded && streak == config.max_carry_lookback.saturating_add(1) {
                    warn!(
                        "Card {} has carried an unpaid balance for more than {} cycles as of {}",
                        card.card_id, config.max_carry_lookback, cycle
                    );
                }
                debug!(
                    "Card {} cycle {}: own {} + carried {} = due {}, paid {} ({:?})",
                    card.card_id,
                    cycle,
                    summary.own_total,
                    summary.carried_over,
                    summary.total_due,
                    summary.total_paid,
                    summary.status
                );

                carry = summary.carry_out();
                streak = if carry > Money::ZERO { streak + 1 } else { 0 };
                cycle = cycle.next()?;
            }
        }

        Ok(Self {
            card: card.clone(),
            cycles,
            max_lookback: config.max_carry_lookback,
            legacy_fallback: config.legacy_cycle_fallback,
        })
    }

    pub fn card(&self) -> &CardBillingConfig {
        &self.card
    }

    /// Cycle an entry of this card is billed to, resolved the same way the
    /// ledger resolved it.
    pub fn cycle_of(&self, entry: &LedgerEntry) -> Result<Option<BillCycle>> {
        entry_cycle(entry, &self.card, self.legacy_fallback)
    }

    pub fn last_cycle(&self) -> Option<BillCycle> {
        self.cycles.keys().next_back().copied()
    }

    /// Summary of any cycle. Cycles after the last one with activity still
    /// see the balance carried in from it. A streak past the lookback limit
    /// is reported through `lookback_exceeded`, not as an error.
    pub fn summary(&self, cycle: BillCycle) -> Result<CycleSummary> {
        let summary = match (self.cycles.get(&cycle), self.cycles.iter().next_back()) {
            (Some(summary), _) => summary.clone(),
            (None, Some((&last, last_summary))) if cycle > last => {
                let carry = last_summary.carry_out();
                let mut streak = last_summary.unpaid_streak;
                if carry > Money::ZERO {
                    let gap = months_between((last.year, last.month), (cycle.year, cycle.month));
                    streak = streak.saturating_add(u32::try_from(gap).unwrap_or(u32::MAX));
                } else {
                    streak = 0;
                }
                let mut summary = CycleSummary::new(&self.card.card_id, cycle);
                summary.settle(carry, streak, self.max_lookback);
                summary
            }
            _ => CycleSummary::new(&self.card.card_id, cycle),
        };
        Ok(summary)
    }

    /// Like `summary`, but fails with `CarryForwardLookbackExceeded` when the
    /// unpaid streak into `cycle` is longer than the lookback limit.
    pub fn strict_summary(&self, cycle: BillCycle) -> Result<CycleSummary> {
        let summary = self.summary(cycle)?;
        if summary.lookback_exceeded {
            return Err(self.lookback_error(cycle));
        }
        Ok(summary)
    }

    fn lookback_error(&self, cycle: BillCycle) -> LedgerError {
        LedgerError::CarryForwardLookbackExceeded {
            card_id: self.card.card_id.clone(),
            cycle,
            max_lookback: self.max_lookback,
        }
    }

    /// The card's latest cycle, when it still owes a balance that has been
    /// carried for longer than the lookback limit.
    pub fn lookback_breach(&self) -> Result<Option<LedgerError>> {
        let Some(last) = self.last_cycle() else {
            return Ok(None);
        };
        let summary = self.summary(last)?;
        if summary.lookback_exceeded && summary.remaining > Money::ZERO {
            warn!(
                "Card {} still owes {} carried for {} cycles into {}",
                self.card.card_id, summary.remaining, summary.unpaid_streak, last
            );
            return Ok(Some(self.lookback_error(last)));
        }
        Ok(None)
    }

    pub fn carried_over_from_previous(&self, cycle: BillCycle) -> Result<Money> {
        Ok(self.summary(cycle)?.carried_over)
    }

    pub fn total_due(&self, cycle: BillCycle) -> Result<Money> {
        Ok(self.summary(cycle)?.total_due)
    }

    pub fn is_bill_paid(&self, cycle: BillCycle) -> Result<bool> {
        Ok(self.summary(cycle)?.is_paid())
    }

    pub fn statement(&self, cycle: BillCycle) -> Result<CycleStatement> {
        let (period_start, period_end) = cycle_date_range(cycle, self.card.closing_day)?;
        Ok(CycleStatement {
            summary: self.summary(cycle)?,
            period_start,
            period_end,
            due_date: due_date(cycle, &self.card)?,
        })
    }

    /// Statements of every cycle from the first active one through the last.
    pub fn statements(&self) -> Result<Vec<CycleStatement>> {
        self.cycles.keys().map(|&cycle| self.statement(cycle)).collect()
    }
}

/// Settlements whose linked account entry no longer exists.
pub fn audit_settlements(settlements: &[BillSettlement], entries: &[LedgerEntry]) -> Vec<LedgerError> {
    let entry_ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();

    settlements
        .iter()
        .filter(|s| !entry_ids.contains(s.entry_id.as_str()))
        .map(|s| {
            warn!(
                "Settlement {} for card {} cycle {} points at missing entry {}",
                s.id, s.card_id, s.cycle, s.entry_id
            );
            LedgerError::OrphanSettlementRisk {
                settlement_id: s.id.clone(),
                entry_id: s.entry_id.clone(),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReversalOutcome {
    /// Settlement and its account entry were both removed.
    Reversed { settlement: BillSettlement },
    /// The account entry was already gone; the settlement was removed anyway.
    RecoveredOrphan { settlement: BillSettlement },
}

impl ReversalOutcome {
    pub fn settlement(&self) -> &BillSettlement {
        match self {
            ReversalOutcome::Reversed { settlement }
            | ReversalOutcome::RecoveredOrphan { settlement } => settlement,
        }
    }

    /// The integrity condition a recovered reversal has to report.
    pub fn flag(&self) -> Option<LedgerError> {
        match self {
            ReversalOutcome::Reversed { .. } => None,
            ReversalOutcome::RecoveredOrphan { settlement } => Some(LedgerError::OrphanSettlementRisk {
                settlement_id: settlement.id.clone(),
                entry_id: settlement.entry_id.clone(),
            }),
        }
    }
}

pub struct SettlementService<'a> {
    store: &'a dyn DocumentStore,
    paths: &'a UserCollections,
    config: &'a EngineConfig,
    ids: &'a dyn IdGenerator,
}

impl<'a> SettlementService<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        paths: &'a UserCollections,
        config: &'a EngineConfig,
        ids: &'a dyn IdGenerator,
    ) -> Self {
        Self {
            store,
            paths,
            config,
            ids,
        }
    }

    pub fn card(&self, card_id: &str) -> Result<CardBillingConfig> {
        load_document(self.store, &self.paths.cards(), card_id)?
            .ok_or_else(|| LedgerError::MissingCard(card_id.to_string()))
    }

    pub fn ledger(&self, card: &CardBillingConfig) -> Result<CycleLedger> {
        let entries: Vec<LedgerEntry> = load_collection(self.store, &self.paths.card_expenses())?;
        let settlements: Vec<BillSettlement> = load_collection(self.store, &self.paths.bill_payments())?;
        CycleLedger::build(card, &entries, &settlements, self.config)
    }

    /// Books `amount` from `funding_account_id` against the card's bill for
    /// `cycle`: one account expense entry plus the settlement linking to it,
    /// written together.
    pub fn record_payment(
        &self,
        card_id: &str,
        cycle: BillCycle,
        amount: Money,
        funding_account_id: &str,
        date: NaiveDate,
    ) -> Result<BillSettlement> {
        if amount <= Money::ZERO {
            return Err(LedgerError::AmountOutOfRange(format!(
                "bill payment must be positive, got {}",
                amount
            )));
        }

        let card = self.card(card_id)?;
        let summary = self.ledger(&card)?.summary(cycle)?;

        let label = if card.name.is_empty() {
            card.card_id.clone()
        } else {
            card.name.clone()
        };
        let entry = LedgerEntry {
            id: self.ids.next_id(),
            description: format!("Card bill payment {} {}", label, cycle),
            kind: EntryKind::Expense,
            amount,
            date,
            owner: EntryOwner::Account {
                account_id: funding_account_id.to_string(),
            },
            paid: true,
            category: Some(CategoryRef::card_payment()),
            tags: Vec::new(),
            recurrence: None,
            original_amount: None,
            bill_cycle: None,
        };

        let settlement = BillSettlement {
            id: self.ids.next_id(),
            card_id: card.card_id.clone(),
            cycle,
            amount_paid: amount,
            total_bill_at_payment: summary.total_due,
            funding_account_id: funding_account_id.to_string(),
            entry_id: entry.id.clone(),
            paid_at: date,
            is_partial: amount < summary.remaining,
        };

        let ops = vec![
            WriteOp::put(&self.paths.transactions(), &entry.id, &entry)?,
            WriteOp::put(&self.paths.bill_payments(), &settlement.id, &settlement)?,
        ];
        write_all_or_nothing(self.store, &settlement.id, &ops)?;

        info!(
            "Recorded payment {} of {} against card {} cycle {} (due {}, partial: {})",
            settlement.id, amount, card.card_id, cycle, summary.total_due, settlement.is_partial
        );
        Ok(settlement)
    }

    /// Removes a settlement and its account entry. The entry goes first, so
    /// a failed entry delete leaves the settlement in place.
    pub fn reverse_payment(&self, settlement_id: &str) -> Result<ReversalOutcome> {
        let payments = self.paths.bill_payments();
        let settlement: BillSettlement = load_document(self.store, &payments, settlement_id)?
            .ok_or_else(|| LedgerError::NotFound {
                collection: payments.clone(),
                id: settlement_id.to_string(),
            })?;

        let transactions = self.paths.transactions();
        if self
            .store
            .get_document(&transactions, &settlement.entry_id)?
            .is_none()
        {
            warn!(
                "Reversing settlement {} whose account entry {} is already missing",
                settlement.id, settlement.entry_id
            );
            if !self.store.delete(&payments, &settlement.id)? {
                return Err(LedgerError::NotFound {
                    collection: payments,
                    id: settlement.id,
                });
            }
            return Ok(ReversalOutcome::RecoveredOrphan { settlement });
        }

        let ops = vec![
            WriteOp::delete(&transactions, &settlement.entry_id),
            WriteOp::delete(&payments, &settlement.id),
        ];
        write_all_or_nothing(self.store, &settlement.id, &ops)?;

        info!(
            "Reversed payment {} on card {} cycle {}",
            settlement.id, settlement.card_id, settlement.cycle
        );
        Ok(ReversalOutcome::Reversed { settlement })
    }

    /// Settlements in the store whose account entry is missing.
    pub fn audit(&self) -> Result<Vec<LedgerError>> {
        let settlements: Vec<BillSettlement> = load_collection(self.store, &self.paths.bill_payments())?;
        let entries: Vec<LedgerEntry> = load_collection(self.store, &self.paths.transactions())?;
        Ok(audit_settlements(&settlements, &entries))
    }
}
