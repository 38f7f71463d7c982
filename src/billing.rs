//! Credit-card billing cycles.
//!
//! A statement runs from the day after `closing_day` of month M-1 to
//! `closing_day` of month M inclusive, and is named by M. Card entries get
//! their cycle stamped once at creation; later edits to a card's closing day
//! never move stamped entries.

use crate::error::{LedgerError, Result};
use crate::schema::{BillCycle, CardBillingConfig, LedgerEntry};
use chrono::{Datelike, NaiveDate};
use log::{debug, info, warn};

fn validate_closing_day(closing_day: u32) -> Result<()> {
    if !(1..=28).contains(&closing_day) {
        return Err(LedgerError::InvalidClosingDay(closing_day));
    }
    Ok(())
}

/// Cycle an expense dated `date` belongs to under `closing_day`.
pub fn resolve_cycle(date: NaiveDate, closing_day: u32) -> Result<BillCycle> {
    validate_closing_day(closing_day)?;

    let same_month = BillCycle::new(date.month(), date.year())?;
    if date.day() <= closing_day {
        Ok(same_month)
    } else {
        same_month.next()
    }
}

/// Inclusive date range of the entries belonging to `cycle`.
pub fn cycle_date_range(cycle: BillCycle, closing_day: u32) -> Result<(NaiveDate, NaiveDate)> {
    validate_closing_day(closing_day)?;

    let prev = cycle.prev()?;
    let start = NaiveDate::from_ymd_opt(prev.year, prev.month, closing_day)
        .and_then(|d| d.succ_opt())
        .ok_or_else(|| LedgerError::DateOutOfRange(format!("start of cycle {}", cycle)))?;
    let end = NaiveDate::from_ymd_opt(cycle.year, cycle.month, closing_day)
        .ok_or_else(|| LedgerError::DateOutOfRange(format!("end of cycle {}", cycle)))?;

    Ok((start, end))
}

/// Display-only due date. A due day at or before the closing day falls in
/// the month after the closing month.
pub fn due_date(cycle: BillCycle, card: &CardBillingConfig) -> Result<NaiveDate> {
    card.validate()?;

    let due_cycle = if card.due_day <= card.closing_day {
        cycle.next()?
    } else {
        cycle
    };

    NaiveDate::from_ymd_opt(due_cycle.year, due_cycle.month, card.due_day)
        .ok_or_else(|| LedgerError::DateOutOfRange(format!("due date of cycle {}", cycle)))
}

/// Cycle of a card entry: the stored stamp when present, otherwise (if
/// `legacy_fallback`) the cycle derived from the card's current closing day.
pub fn entry_cycle(
    entry: &LedgerEntry,
    card: &CardBillingConfig,
    legacy_fallback: bool,
) -> Result<Option<BillCycle>> {
    match entry.card_id() {
        Some(card_id) if card_id == card.card_id => {}
        Some(card_id) => {
            return Err(LedgerError::CardMismatch {
                expected: card.card_id.clone(),
                found: card_id.to_string(),
            })
        }
        None => return Ok(None),
    }

    if let Some(stamped) = entry.bill_cycle {
        return Ok(Some(stamped));
    }

    if !legacy_fallback {
        return Ok(None);
    }

    let derived = resolve_cycle(entry.date, card.closing_day)?;
    warn!(
        "Entry {} has no stored bill cycle; derived {} from current closing day {}",
        entry.id, derived, card.closing_day
    );
    Ok(Some(derived))
}

pub fn is_entry_in_cycle(
    entry: &LedgerEntry,
    cycle: BillCycle,
    card: &CardBillingConfig,
    legacy_fallback: bool,
) -> Result<bool> {
    Ok(entry_cycle(entry, card, legacy_fallback)? == Some(cycle))
}

/// Stamps a card entry with the cycle of its own date. Account entries are
/// left untouched.
pub fn stamp_entry(entry: &mut LedgerEntry, card: &CardBillingConfig) -> Result<()> {
    if entry.card_id().is_none() {
        return Ok(());
    }
    if entry.card_id() != Some(card.card_id.as_str()) {
        return Err(LedgerError::CardMismatch {
            expected: card.card_id.clone(),
            found: entry.card_id().unwrap_or_default().to_string(),
        });
    }

    let cycle = resolve_cycle(entry.date, card.closing_day)?;
    debug!("Stamped entry {} ({}) into cycle {}", entry.id, entry.date, cycle);
    entry.bill_cycle = Some(cycle);
    Ok(())
}

pub fn verify_cycle_stamp(entry: &LedgerEntry, closing_day: u32) -> Result<()> {
    let Some(stored) = entry.bill_cycle else {
        return Ok(());
    };

    let derived = resolve_cycle(entry.date, closing_day)?;
    if stored != derived {
        return Err(LedgerError::InconsistentCycleAssignment {
            entry_id: entry.id.clone(),
            stored,
            derived,
        });
    }
    Ok(())
}

/// Stamped entries of `card` whose stamp disagrees with their date under the
/// card's current closing day. Reported, never corrected.
pub fn audit_cycle_stamps(entries: &[LedgerEntry], card: &CardBillingConfig) -> Vec<LedgerError> {
    let findings: Vec<LedgerError> = entries
        .iter()
        .filter(|e| e.card_id() == Some(card.card_id.as_str()))
        .filter_map(|e| verify_cycle_stamp(e, card.closing_day).err())
        .collect();

    for finding in &findings {
        warn!("Cycle audit for card {}: {}", card.card_id, finding);
    }
    findings
}

/// One-time migration: stamps every unstamped card entry using its card's
/// current closing day. Returns the number of entries stamped.
pub fn stamp_legacy_entries(
    entries: &mut [LedgerEntry],
    cards: &[CardBillingConfig],
) -> Result<usize> {
    let mut stamped = 0;

    for entry in entries.iter_mut().filter(|e| e.bill_cycle.is_none()) {
        let Some(card_id) = entry.card_id() else {
            continue;
        };
        let card = cards
            .iter()
            .find(|c| c.card_id == card_id)
            .ok_or_else(|| LedgerError::MissingCard(card_id.to_string()))?;

        stamp_entry(entry, card)?;
        stamped += 1;
    }

    info!("Stamped {} legacy card entries with a bill cycle", stamped);
    Ok(stamped)
}
