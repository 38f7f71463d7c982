//! Expands one logical transaction into its dated ledger entries.

use crate::billing::stamp_entry;
use crate::clock::{Clock, IdGenerator};
use crate::config::EngineConfig;
use crate::error::{LedgerError, Result};
use crate::money::{split_with_policy, Money};
use crate::schema::{
    CardBillingConfig, CategoryRef, EntryKind, EntryOwner, LedgerEntry, RecurrenceInfo, TagRef,
};
use crate::utils::{add_calendar_interval, is_future_date, IntervalUnit};
use chrono::NaiveDate;
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FixedFrequency {
    Daily,
    Weekly,
    /// Every 15 days.
    Biweekly,
    Monthly,
    Bimonthly,
    Quarterly,
    Semiannual,
    Annual,
}

impl FixedFrequency {
    pub fn step(&self) -> (IntervalUnit, u32) {
        match self {
            Self::Daily => (IntervalUnit::Day, 1),
            Self::Weekly => (IntervalUnit::Day, 7),
            Self::Biweekly => (IntervalUnit::Day, 15),
            Self::Monthly => (IntervalUnit::Month, 1),
            Self::Bimonthly => (IntervalUnit::Month, 2),
            Self::Quarterly => (IntervalUnit::Month, 3),
            Self::Semiannual => (IntervalUnit::Month, 6),
            Self::Annual => (IntervalUnit::Month, 12),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentPeriod {
    Days,
    Weeks,
    /// 15-day periods.
    Biweeks,
    Months,
    Bimonths,
    Quarters,
    Semesters,
    Years,
}

impl InstallmentPeriod {
    pub fn step(&self) -> (IntervalUnit, u32) {
        match self {
            Self::Days => (IntervalUnit::Day, 1),
            Self::Weeks => (IntervalUnit::Week, 1),
            Self::Biweeks => (IntervalUnit::Day, 15),
            Self::Months => (IntervalUnit::Month, 1),
            Self::Bimonths => (IntervalUnit::Month, 2),
            Self::Quarters => (IntervalUnit::Month, 3),
            Self::Semesters => (IntervalUnit::Month, 6),
            Self::Years => (IntervalUnit::Month, 12),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrencePolicy {
    None,
    /// The same amount repeated on every occurrence.
    Fixed {
        frequency: FixedFrequency,
        #[serde(default)]
        #[schemars(description = "Defaults to the engine's fixed occurrence count (12)")]
        occurrence_count: Option<u32>,
    },
    /// The total split across `count` dated installments.
    Installment {
        count: u32,
        period: InstallmentPeriod,
    },
}

/// What the user submitted, before expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TransactionDraft {
    pub description: String,
    pub total_amount: Money,
    pub start_date: NaiveDate,
    pub kind: EntryKind,
    #[serde(flatten)]
    pub owner: EntryOwner,
    pub policy: RecurrencePolicy,
    #[schemars(description = "Paid flag the user asked for; future-dated recurring entries are forced to pending")]
    pub paid: bool,
    #[serde(default)]
    pub category: Option<CategoryRef>,
    #[serde(default)]
    pub tags: Vec<TagRef>,
}

pub struct RecurrenceExpander<'a> {
    config: &'a EngineConfig,
    clock: &'a dyn Clock,
    ids: &'a dyn IdGenerator,
}

impl<'a> RecurrenceExpander<'a> {
    pub fn new(config: &'a EngineConfig, clock: &'a dyn Clock, ids: &'a dyn IdGenerator) -> Self {
        Self { config, clock, ids }
    }

    /// Produces the ordered entries for `draft`. `card` must be the billing
    /// configuration of the draft's card when the draft is card-owned; each
    /// entry is stamped with the cycle of its own date.
    pub fn expand(
        &self,
        draft: &TransactionDraft,
        card: Option<&CardBillingConfig>,
    ) -> Result<Vec<LedgerEntry>> {
        let card = self.card_for(draft, card)?;

        let mut entries = match draft.policy {
            RecurrencePolicy::None => {
                let mut entry = self.base_entry(draft, draft.start_date, draft.total_amount);
                entry.paid = draft.paid;
                vec![entry]
            }
            RecurrencePolicy::Fixed {
                frequency,
                occurrence_count,
            } => {
                let count = occurrence_count.unwrap_or(self.config.fixed_occurrence_count);
                let max = self.config.fixed_occurrence_max;
                if count < 1 || count > max {
                    return Err(LedgerError::InvalidRecurrenceCount { count, min: 1, max });
                }
                let amounts = vec![draft.total_amount; count as usize];
                self.expand_series(draft, frequency.step(), &amounts, None)?
            }
            RecurrencePolicy::Installment { count, period } => {
                let (min, max) = (self.config.installment_min, self.config.installment_max);
                if count < 1 || count < min || count > max {
                    return Err(LedgerError::InvalidRecurrenceCount { count, min, max });
                }
                let amounts =
                    split_with_policy(draft.total_amount, count, self.config.remainder_policy)?;
                self.expand_series(draft, period.step(), &amounts, Some(draft.total_amount))?
            }
        };

        if let Some(card) = card {
            for entry in entries.iter_mut() {
                stamp_entry(entry, card)?;
            }
        }

        info!(
            "Expanded '{}' into {} entries{}",
            draft.description,
            entries.len(),
            entries
                .first()
                .and_then(|e| e.group_id())
                .map(|g| format!(" (group {})", g))
                .unwrap_or_default()
        );
        Ok(entries)
    }

    fn card_for<'c>(
        &self,
        draft: &TransactionDraft,
        card: Option<&'c CardBillingConfig>,
    ) -> Result<Option<&'c CardBillingConfig>> {
        let EntryOwner::Card { card_id } = &draft.owner else {
            return Ok(None);
        };

        let card = card.ok_or_else(|| LedgerError::MissingCard(card_id.clone()))?;
        if &card.card_id != card_id {
            return Err(LedgerError::CardMismatch {
                expected: card_id.clone(),
                found: card.card_id.clone(),
            });
        }
        card.validate()?;
        Ok(Some(card))
    }

    fn expand_series(
        &self,
        draft: &TransactionDraft,
        (unit, multiplier): (IntervalUnit, u32),
        amounts: &[Money],
        original_amount: Option<Money>,
    ) -> Result<Vec<LedgerEntry>> {
        let group_id = self.ids.next_id();
        let total = amounts.len() as u32;
        let today = self.clock.today();

        let mut entries = Vec::with_capacity(amounts.len());
        for (i, amount) in amounts.iter().enumerate() {
            let offset = (i as u32).checked_mul(multiplier).ok_or_else(|| {
                LedgerError::DateOutOfRange(format!("occurrence {} of group {}", i + 1, group_id))
            })?;
            // always from the start date so month-end clamping never drifts
            let date = add_calendar_interval(draft.start_date, unit, offset)?;

            let mut entry = self.base_entry(draft, date, *amount);
            entry.paid = draft.paid && !is_future_date(date, today);
            entry.original_amount = original_amount;
            entry.recurrence = Some(RecurrenceInfo {
                group_id: group_id.clone(),
                index: i as u32 + 1,
                total,
            });

            debug!(
                "Group {} entry {}/{}: {} {} paid={}",
                group_id,
                i + 1,
                total,
                date,
                amount,
                entry.paid
            );
            entries.push(entry);
        }

        Ok(entries)
    }

    fn base_entry(&self, draft: &TransactionDraft, date: NaiveDate, amount: Money) -> LedgerEntry {
        LedgerEntry {
            id: self.ids.next_id(),
            description: draft.description.clone(),
            kind: draft.kind,
            amount,
            date,
            owner: draft.owner.clone(),
            paid: draft.paid,
            category: draft.category.clone(),
            tags: draft.tags.clone(),
            recurrence: None,
            original_amount: None,
            bill_cycle: None,
        }
    }
}

/// Checks the group invariant: one shared total and indices exactly 1..=N.
pub fn validate_group(entries: &[LedgerEntry], group_id: &str) -> Result<()> {
    let broken = |details: String| LedgerError::BrokenRecurrenceGroup {
        group_id: group_id.to_string(),
        details,
    };

    let mut members: Vec<&RecurrenceInfo> = entries
        .iter()
        .filter_map(|e| e.recurrence.as_ref())
        .filter(|r| r.group_id == group_id)
        .collect();

    if members.is_empty() {
        return Err(broken("no entries".to_string()));
    }
    members.sort_by_key(|r| r.index);

    let total = members[0].total;
    if let Some(other) = members.iter().find(|r| r.total != total) {
        return Err(broken(format!(
            "mixed totals {} and {}",
            total, other.total
        )));
    }
    if members.len() as u32 != total {
        return Err(broken(format!(
            "{} entries for a total of {}",
            members.len(),
            total
        )));
    }
    for (position, member) in members.iter().enumerate() {
        if member.index != position as u32 + 1 {
            return Err(broken(format!(
                "expected index {} but found {}",
                position + 1,
                member.index
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SequentialIds};
    use crate::schema::BillCycle;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn draft(policy: RecurrencePolicy, amount: i64, start: NaiveDate) -> TransactionDraft {
        TransactionDraft {
            description: "Gym".to_string(),
            total_amount: Money::from_cents(amount),
            start_date: start,
            kind: EntryKind::Expense,
            owner: EntryOwner::Account {
                account_id: "checking".to_string(),
            },
            policy,
            paid: true,
            category: Some(CategoryRef::new("leisure")),
            tags: vec![],
        }
    }

    #[test]
    fn test_single_entry_keeps_paid_intent() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2024, 1, 1));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);

        let entries = expander
            .expand(&draft(RecurrencePolicy::None, 5000, d(2024, 6, 1)), None)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].paid);
        assert!(entries[0].recurrence.is_none());
        assert_eq!(entries[0].amount, Money::from_cents(5000));
    }

    #[test]
    fn test_fixed_monthly_series() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2024, 3, 20));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);

        let policy = RecurrencePolicy::Fixed {
            frequency: FixedFrequency::Monthly,
            occurrence_count: None,
        };
        let entries = expander.expand(&draft(policy, 9990, d(2024, 1, 15)), None).unwrap();

        assert_eq!(entries.len(), 12);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.date, d(2024, i as u32 + 1, 15));
            assert_eq!(entry.amount, Money::from_cents(9990));
            let info = entry.recurrence.as_ref().unwrap();
            assert_eq!(info.index, i as u32 + 1);
            assert_eq!(info.total, 12);
        }

        // Jan..Mar already happened; everything after the clock is pending
        let paid: Vec<bool> = entries.iter().map(|e| e.paid).collect();
        assert_eq!(&paid[..3], &[true, true, true]);
        assert!(paid[3..].iter().all(|p| !p));

        let group = entries[0].group_id().unwrap();
        assert!(entries.iter().all(|e| e.group_id() == Some(group)));
        assert!(validate_group(&entries, group).is_ok());
    }

    #[test]
    fn test_fixed_day_based_frequencies() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2020, 1, 1));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);

        let policy = RecurrencePolicy::Fixed {
            frequency: FixedFrequency::Biweekly,
            occurrence_count: Some(3),
        };
        let entries = expander.expand(&draft(policy, 100, d(2024, 2, 20)), None).unwrap();
        let dates: Vec<NaiveDate> = entries.iter().map(|e| e.date).collect();
        assert_eq!(dates, vec![d(2024, 2, 20), d(2024, 3, 6), d(2024, 3, 21)]);
    }

    #[test]
    fn test_installments_split_and_clamp() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2023, 12, 1));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);

        let policy = RecurrencePolicy::Installment {
            count: 3,
            period: InstallmentPeriod::Months,
        };
        let entries = expander.expand(&draft(policy, 10000, d(2024, 1, 31)), None).unwrap();

        let dates: Vec<NaiveDate> = entries.iter().map(|e| e.date).collect();
        assert_eq!(dates, vec![d(2024, 1, 31), d(2024, 2, 29), d(2024, 3, 31)]);

        let amounts: Vec<i64> = entries.iter().map(|e| e.amount.cents()).collect();
        assert_eq!(amounts, vec![3334, 3333, 3333]);
        assert_eq!(amounts.iter().sum::<i64>(), 10000);

        assert!(entries
            .iter()
            .all(|e| e.original_amount == Some(Money::from_cents(10000))));
        assert!(entries.iter().all(|e| !e.paid));
    }

    #[test]
    fn test_refund_series_splits_signed() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2024, 1, 1));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);

        let policy = RecurrencePolicy::Installment {
            count: 4,
            period: InstallmentPeriod::Weeks,
        };
        let entries = expander.expand(&draft(policy, -1001, d(2024, 1, 1)), None).unwrap();
        let total: Money = entries.iter().map(|e| e.amount).sum();
        assert_eq!(total, Money::from_cents(-1001));
        assert_eq!(entries[3].date, d(2024, 1, 22));
    }

    #[test]
    fn test_rejects_bad_counts() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2024, 1, 1));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);

        let zero = RecurrencePolicy::Installment {
            count: 0,
            period: InstallmentPeriod::Months,
        };
        assert!(matches!(
            expander.expand(&draft(zero, 100, d(2024, 1, 1)), None),
            Err(LedgerError::InvalidRecurrenceCount { count: 0, .. })
        ));

        let too_many = RecurrencePolicy::Installment {
            count: 121,
            period: InstallmentPeriod::Months,
        };
        assert!(matches!(
            expander.expand(&draft(too_many, 100, d(2024, 1, 1)), None),
            Err(LedgerError::InvalidRecurrenceCount { count: 121, max: 120, .. })
        ));

        let fixed_zero = RecurrencePolicy::Fixed {
            frequency: FixedFrequency::Weekly,
            occurrence_count: Some(0),
        };
        assert!(expander
            .expand(&draft(fixed_zero, 100, d(2024, 1, 1)), None)
            .is_err());

        let fixed_huge = RecurrencePolicy::Fixed {
            frequency: FixedFrequency::Daily,
            occurrence_count: Some(100_000),
        };
        assert!(matches!(
            expander.expand(&draft(fixed_huge, 100, d(2024, 1, 1)), None),
            Err(LedgerError::InvalidRecurrenceCount { count: 100_000, min: 1, max: 730 })
        ));

        let fixed_at_max = RecurrencePolicy::Fixed {
            frequency: FixedFrequency::Daily,
            occurrence_count: Some(730),
        };
        assert_eq!(
            expander
                .expand(&draft(fixed_at_max, 100, d(2024, 1, 1)), None)
                .unwrap()
                .len(),
            730
        );
    }

    #[test]
    fn test_card_installments_roll_into_their_own_cycles() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2024, 1, 1));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);
        let card = CardBillingConfig::new("visa", 10, 20).unwrap();

        let mut card_draft = draft(
            RecurrencePolicy::Installment {
                count: 3,
                period: InstallmentPeriod::Months,
            },
            30000,
            d(2024, 11, 25),
        );
        card_draft.owner = EntryOwner::Card {
            card_id: "visa".to_string(),
        };

        let entries = expander.expand(&card_draft, Some(&card)).unwrap();
        let cycles: Vec<BillCycle> = entries.iter().map(|e| e.bill_cycle.unwrap()).collect();
        assert_eq!(
            cycles,
            vec![
                BillCycle::new(12, 2024).unwrap(),
                BillCycle::new(1, 2025).unwrap(),
                BillCycle::new(2, 2025).unwrap(),
            ]
        );

        assert!(matches!(
            expander.expand(&card_draft, None),
            Err(LedgerError::MissingCard(_))
        ));
        let other = CardBillingConfig::new("amex", 10, 20).unwrap();
        assert!(matches!(
            expander.expand(&card_draft, Some(&other)),
            Err(LedgerError::CardMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_group_detects_gaps() {
        let config = EngineConfig::default();
        let clock = FixedClock(d(2024, 1, 1));
        let ids = SequentialIds::new("id");
        let expander = RecurrenceExpander::new(&config, &clock, &ids);

        let policy = RecurrencePolicy::Installment {
            count: 4,
            period: InstallmentPeriod::Months,
        };
        let mut entries = expander.expand(&draft(policy, 400, d(2024, 1, 1)), None).unwrap();
        let group = entries[0].group_id().unwrap().to_string();
        entries.remove(2);

        assert!(matches!(
            validate_group(&entries, &group),
            Err(LedgerError::BrokenRecurrenceGroup { .. })
        ));
    }
}
