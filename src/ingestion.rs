//! Normalization of documents written by older versions of the app.
//!
//! Older documents use camelCase fields, floating point amounts, zero-based
//! bill months, and categories stored either as a bare id or as an ad hoc
//! `{id, name}` object. `convert_legacy_rows` turns them into `LedgerEntry`
//! values once, so nothing downstream has to sniff shapes.

use crate::error::{LedgerError, Result};
use crate::money::{to_minor_units, Money};
use crate::schema::{BillCycle, CategoryRef, EntryKind, EntryOwner, LedgerEntry, RecurrenceInfo, TagRef};
use chrono::NaiveDate;
use log::{info, warn};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LegacyCategoryValue {
    Id(String),
    Object {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

/// Known categories, looked up by id or by case-insensitive name.
#[derive(Debug, Clone, Default)]
pub struct CategoryCatalog {
    ids: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl CategoryCatalog {
    pub fn new<'a>(categories: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut catalog = Self::default();
        for (id, name) in categories {
            catalog.ids.insert(id.to_string(), name.to_string());
            catalog.by_name.insert(name.to_lowercase(), id.to_string());
        }
        catalog
    }

    fn resolve(&self, text: &str) -> Option<String> {
        if self.ids.contains_key(text) {
            return Some(text.to_string());
        }
        self.by_name.get(&text.to_lowercase()).cloned()
    }
}

/// Lowercase ASCII id from a display name: accents folded, every other run
/// of non-alphanumerics collapsed to `_`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;

    for c in name.chars().flat_map(char::to_lowercase) {
        let folded = match c {
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
            'è' | 'é' | 'ê' | 'ë' => 'e',
            'ì' | 'í' | 'î' | 'ï' => 'i',
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
            'ù' | 'ú' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        };
        if folded.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(folded);
        } else {
            pending_sep = true;
        }
    }

    slug
}

fn normalize_value(value: &LegacyCategoryValue, catalog: &CategoryCatalog) -> Option<String> {
    match value {
        LegacyCategoryValue::Id(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                None
            } else {
                Some(catalog.resolve(raw).unwrap_or_else(|| raw.to_string()))
            }
        }
        LegacyCategoryValue::Object { id, name } => {
            if let Some(id) = id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                return Some(id.to_string());
            }
            let name = name.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
            catalog
                .resolve(name)
                .or_else(|| Some(slugify(name)).filter(|s| !s.is_empty()))
        }
    }
}

pub fn normalize_category(value: &LegacyCategoryValue, catalog: &CategoryCatalog) -> Option<CategoryRef> {
    normalize_value(value, catalog).map(CategoryRef)
}

pub fn normalize_tag(value: &LegacyCategoryValue) -> Option<TagRef> {
    normalize_value(value, &CategoryCatalog::default()).map(TagRef)
}

/// Parses a typed-in amount in Brazilian (`1.234,56`, `123,45`) or US
/// (`1,234.56`) notation, with an optional `R$` prefix. Returns `None` when
/// the text is empty or not a number.
pub fn parse_currency_input(text: &str) -> Result<Option<Money>> {
    let cleaned: String = text
        .replace("R$", "")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }

    let (sign, digits) = match cleaned.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", cleaned.as_str()),
    };

    let normalized = if is_brazilian_notation(digits) {
        digits.replace('.', "").replace(',', ".")
    } else {
        digits.replace(',', "")
    };

    match Decimal::from_str(&format!("{}{}", sign, normalized)) {
        Ok(amount) => to_minor_units(amount).map(Some),
        Err(_) => Ok(None),
    }
}

fn is_brazilian_notation(digits: &str) -> bool {
    let Some((whole, cents)) = digits.rsplit_once(',') else {
        return false;
    };
    if cents.is_empty() || cents.len() > 2 || !cents.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    let groups: Vec<&str> = whole.split('.').collect();
    match groups.as_slice() {
        [single] => !single.is_empty() && single.chars().all(|c| c.is_ascii_digit()),
        [first, rest @ ..] => {
            (1..=3).contains(&first.len())
                && first.chars().all(|c| c.is_ascii_digit())
                && rest
                    .iter()
                    .all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
        }
        [] => false,
    }
}

/// A transaction or card expense as older app versions stored it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEntryRow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: Option<EntryKind>,
    pub amount: Decimal,
    pub date: NaiveDate,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub card_id: Option<String>,
    #[serde(default)]
    pub paid: Option<bool>,
    #[serde(default)]
    pub category: Option<LegacyCategoryValue>,
    #[serde(default)]
    pub tags: Vec<LegacyCategoryValue>,
    #[serde(default)]
    pub recurrence_group: Option<String>,
    #[serde(default)]
    pub recurrence_index: Option<u32>,
    #[serde(default)]
    pub recurrence_total: Option<u32>,
    #[serde(default)]
    pub installment: Option<u32>,
    #[serde(default)]
    pub total_installments: Option<u32>,
    #[serde(default)]
    pub original_amount: Option<Decimal>,
    /// Zero-based (January = 0).
    #[serde(default)]
    pub bill_month: Option<u32>,
    #[serde(default)]
    pub bill_year: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub entries: Vec<LedgerEntry>,
    /// Ids of rows that were skipped, with the reason.
    pub skipped: Vec<(String, String)>,
}

pub fn convert_legacy_row(row: &LegacyEntryRow, catalog: &CategoryCatalog) -> Result<LedgerEntry> {
    let owner = match (&row.card_id, &row.account_id) {
        (Some(card_id), _) if !card_id.is_empty() => EntryOwner::Card {
            card_id: card_id.clone(),
        },
        (_, Some(account_id)) if !account_id.is_empty() => EntryOwner::Account {
            account_id: account_id.clone(),
        },
        _ => {
            return Err(LedgerError::NotFound {
                collection: "accounts or cards".to_string(),
                id: format!("owner of legacy entry {}", row.id),
            })
        }
    };

    let amount = to_minor_units(row.amount)?;
    if amount.is_negative() {
        return Err(LedgerError::AmountOutOfRange(format!(
            "legacy entry {} has negative amount {}",
            row.id, amount
        )));
    }

    let recurrence = row.recurrence_group.as_ref().and_then(|group_id| {
        let index = row.recurrence_index.or(row.installment)?;
        let total = row.recurrence_total.or(row.total_installments)?;
        Some(RecurrenceInfo {
            group_id: group_id.clone(),
            index,
            total,
        })
    });

    let bill_cycle = match (&owner, row.bill_month, row.bill_year) {
        (EntryOwner::Card { .. }, Some(month), Some(year)) => {
            let month = month.checked_add(1).ok_or(LedgerError::InvalidMonth(month))?;
            Some(BillCycle::new(month, year)?)
        }
        _ => None,
    };

    Ok(LedgerEntry {
        id: row.id.clone(),
        description: row.description.clone(),
        kind: row.kind.unwrap_or(EntryKind::Expense),
        amount,
        date: row.date,
        owner,
        paid: row.paid.unwrap_or(false),
        category: row.category.as_ref().and_then(|c| normalize_category(c, catalog)),
        tags: row.tags.iter().filter_map(normalize_tag).collect(),
        recurrence,
        original_amount: row.original_amount.map(to_minor_units).transpose()?,
        bill_cycle,
    })
}

/// Converts every row it can; rows that fail are reported, not fatal.
pub fn convert_legacy_rows(rows: &[LegacyEntryRow], catalog: &CategoryCatalog) -> IngestionReport {
    let mut report = IngestionReport::default();

    for row in rows {
        match convert_legacy_row(row, catalog) {
            Ok(entry) => report.entries.push(entry),
            Err(err) => {
                warn!("Skipping legacy entry {}: {}", row.id, err);
                report.skipped.push((row.id.clone(), err.to_string()));
            }
        }
    }

    info!(
        "Converted {} legacy entries ({} skipped)",
        report.entries.len(),
        report.skipped.len()
    );
    report
}

/// Parses raw legacy documents (`(id, document)` pairs as returned by a
/// store) and converts them. The document id wins over any `id` field.
pub fn convert_legacy_documents(
    documents: &[(String, serde_json::Value)],
    catalog: &CategoryCatalog,
) -> Result<IngestionReport> {
    let rows = documents
        .iter()
        .map(|(id, doc)| {
            let mut row: LegacyEntryRow = serde_json::from_value(doc.clone())?;
            row.id = id.clone();
            Ok(row)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(convert_legacy_rows(&rows, catalog))
}
