use crate::error::Result;
use crate::schema::{EntryKind, EntryOwner, LedgerEntry, LedgerSnapshot};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One flattened entry, ready for a CSV writer or a JSON dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    pub date: NaiveDate,
    pub description: String,
    pub kind: EntryKind,
    pub category: String,
    /// Account or card name, falling back to its id.
    pub owner: String,
    /// Income positive, expense negative.
    pub amount: Decimal,
    pub paid: bool,
    pub tags: String,
    pub installment: String,
    pub bill_cycle: String,
}

fn owner_name(entry: &LedgerEntry, snapshot: &LedgerSnapshot) -> String {
    match &entry.owner {
        EntryOwner::Account { account_id } => snapshot
            .accounts
            .iter()
            .find(|a| &a.id == account_id)
            .map_or_else(|| account_id.clone(), |a| a.name.clone()),
        EntryOwner::Card { card_id } => snapshot
            .card(card_id)
            .filter(|c| !c.name.is_empty())
            .map_or_else(|| card_id.clone(), |c| c.name.clone()),
    }
}

pub fn export_row(entry: &LedgerEntry, snapshot: &LedgerSnapshot) -> ExportRow {
    ExportRow {
        date: entry.date,
        description: entry.description.clone(),
        kind: entry.kind,
        category: entry
            .category
            .as_ref()
            .map(|c| c.as_str().to_string())
            .unwrap_or_default(),
        owner: owner_name(entry, snapshot),
        amount: entry.signed_amount().to_decimal(),
        paid: entry.paid,
        tags: entry
            .tags
            .iter()
            .map(|t| t.0.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        installment: entry
            .recurrence
            .as_ref()
            .map_or_else(|| "1/1".to_string(), |r| r.label()),
        bill_cycle: entry
            .bill_cycle
            .map(|c| c.to_string())
            .unwrap_or_default(),
    }
}

/// Rows for every entry in the snapshot, newest first.
pub fn export_rows(snapshot: &LedgerSnapshot) -> Vec<ExportRow> {
    let mut entries: Vec<&LedgerEntry> = snapshot.entries.iter().collect();
    entries.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
    entries.into_iter().map(|e| export_row(e, snapshot)).collect()
}

pub fn export_json(snapshot: &LedgerSnapshot) -> Result<String> {
    Ok(serde_json::to_string_pretty(&export_rows(snapshot))?)
}
