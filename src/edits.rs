use crate::billing::stamp_entry;
use crate::error::{LedgerError, Result};
use crate::money::Money;
use crate::schema::{CardBillingConfig, CategoryRef, EntryKind, LedgerEntry, TagRef};
use crate::settlement::CycleLedger;
use chrono::NaiveDate;
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A user edit, applied to one entry or to every entry of a recurrence group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntryEdit {
    #[schemars(description = "Ordered list of changes; later changes win over earlier ones.")]
    #[serde(default)]
    pub changes: Vec<EntryChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EntryChange {
    SetDescription { description: String },
    SetAmount { amount: Money },
    SetKind { kind: EntryKind },
    /// Moves the entry. Card entries are restamped with the cycle of the new date.
    SetDate { date: NaiveDate },
    SetPaid { paid: bool },
    SetCategory { category: Option<CategoryRef> },
    SetTags { tags: Vec<TagRef> },
}

impl EntryEdit {
    pub fn new(changes: Vec<EntryChange>) -> Self {
        Self { changes }
    }

    pub fn moves_date(&self) -> bool {
        self.changes
            .iter()
            .any(|c| matches!(c, EntryChange::SetDate { .. }))
    }

    /// Returns the edited copy of `entry`. `card` is required to restamp a
    /// card entry whose date changes.
    pub fn apply(&self, entry: &LedgerEntry, card: Option<&CardBillingConfig>) -> Result<LedgerEntry> {
        let mut edited = entry.clone();

        for change in &self.changes {
            match change {
                EntryChange::SetDescription { description } => edited.description = description.clone(),
                EntryChange::SetAmount { amount } => {
                    if amount.is_negative() {
                        return Err(LedgerError::AmountOutOfRange(format!(
                            "entry amount must not be negative, got {}",
                            amount
                        )));
                    }
                    edited.amount = *amount;
                }
                EntryChange::SetKind { kind } => edited.kind = *kind,
                EntryChange::SetDate { date } => edited.date = *date,
                EntryChange::SetPaid { paid } => edited.paid = *paid,
                EntryChange::SetCategory { category } => edited.category = category.clone(),
                EntryChange::SetTags { tags } => edited.tags = tags.clone(),
            }
        }

        if self.moves_date() {
            if let Some(card_id) = edited.card_id() {
                let card = card.ok_or_else(|| LedgerError::MissingCard(card_id.to_string()))?;
                stamp_entry(&mut edited, card)?;
            }
        }

        debug!("Edited entry {} ({} changes)", edited.id, self.changes.len());
        Ok(edited)
    }
}

/// Fails with `CycleLocked` when `entry` is billed to a cycle that is
/// already paid. Entries of other cards or of accounts are never locked.
pub fn ensure_editable(entry: &LedgerEntry, ledger: Option<&CycleLedger>) -> Result<()> {
    let Some(ledger) = ledger else {
        return Ok(());
    };
    if entry.card_id() != Some(ledger.card().card_id.as_str()) {
        return Ok(());
    }

    if let Some(cycle) = ledger.cycle_of(entry)? {
        if ledger.is_bill_paid(cycle)? {
            return Err(LedgerError::CycleLocked {
                entry_id: entry.id.clone(),
                cycle,
            });
        }
    }
    Ok(())
}

/// Applies an edit to a single entry, refusing to touch a paid cycle either
/// where the entry is now or where the edit would move it.
pub fn edit_entry(
    entry: &LedgerEntry,
    edit: &EntryEdit,
    card: Option<&CardBillingConfig>,
    ledger: Option<&CycleLedger>,
) -> Result<LedgerEntry> {
    ensure_editable(entry, ledger)?;
    let edited = edit.apply(entry, card)?;
    if edit.moves_date() {
        ensure_editable(&edited, ledger)?;
    }
    Ok(edited)
}

pub fn group_members<'a>(entries: &'a [LedgerEntry], group_id: &str) -> Vec<&'a LedgerEntry> {
    let mut members: Vec<&LedgerEntry> = entries
        .iter()
        .filter(|e| e.group_id() == Some(group_id))
        .collect();
    members.sort_by_key(|e| e.recurrence.as_ref().map_or(0, |r| r.index));
    members
}

/// Applies the same edit to every entry of a group and returns the edited
/// entries. A date change cannot be spread across a group.
pub fn edit_group(
    entries: &[LedgerEntry],
    group_id: &str,
    edit: &EntryEdit,
    card: Option<&CardBillingConfig>,
    ledger: Option<&CycleLedger>,
) -> Result<Vec<LedgerEntry>> {
    if edit.moves_date() {
        return Err(LedgerError::BrokenRecurrenceGroup {
            group_id: group_id.to_string(),
            details: "a group edit cannot set one date on every entry".to_string(),
        });
    }

    let members = group_members(entries, group_id);
    for member in &members {
        ensure_editable(member, ledger)?;
    }

    let edited = members
        .into_iter()
        .map(|member| edit.apply(member, card))
        .collect::<Result<Vec<_>>>()?;

    info!("Prepared edit of {} entries in group {}", edited.len(), group_id);
    Ok(edited)
}

/// Entries of the group that a whole-group delete removes, after checking
/// none of them sits in a paid cycle.
pub fn group_for_delete(
    entries: &[LedgerEntry],
    group_id: &str,
    ledger: Option<&CycleLedger>,
) -> Result<Vec<LedgerEntry>> {
    let members = group_members(entries, group_id);
    for member in &members {
        ensure_editable(member, ledger)?;
    }
    Ok(members.into_iter().cloned().collect())
}
