//! Read-side rollups over a ledger snapshot.
//!
//! Everything here is a pure function of its inputs: the aggregator keeps no
//! state between runs, so it can be re-run on every store update and two
//! runs over the same snapshot give identical results.
//!
//! Month-end spending forecasts are a naive linear extrapolation
//! (`spent / elapsed_days * days_in_month`), not a statistical model.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::money::{to_minor_units, Money};
use crate::schema::{
    Account, BillCycle, Budget, CardBillingConfig, CategoryRef, EntryKind, Goal, GoalStatus, LedgerEntry,
    LedgerSnapshot,
};
use crate::settlement::{CycleLedger, CycleStatement};
use crate::utils::{days_in_month, first_day_of_month, last_day_of_month};
use chrono::{Datelike, NaiveDate};
use log::{debug, info};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AccountBalance {
    pub account_id: String,
    pub name: String,
    /// Initial balance plus paid entries.
    pub settled: Money,
    /// Initial balance plus every entry, pending ones included.
    pub projected: Money,
}

/// Balance of `account` counting entries dated inside `window` (inclusive),
/// or all of them when no window is given.
pub fn account_balance(
    account: &Account,
    entries: &[LedgerEntry],
    window: Option<(NaiveDate, NaiveDate)>,
) -> AccountBalance {
    let in_scope = entries.iter().filter(|e| {
        e.account_id() == Some(account.id.as_str())
            && window.map_or(true, |(start, end)| e.date >= start && e.date <= end)
    });

    let mut settled = account.initial_balance;
    let mut projected = account.initial_balance;
    for entry in in_scope {
        projected += entry.signed_amount();
        if entry.paid {
            settled += entry.signed_amount();
        }
    }

    AccountBalance {
        account_id: account.id.clone(),
        name: account.name.clone(),
        settled,
        projected,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DailyBalance {
    pub date: NaiveDate,
    pub balance: Money,
}

/// Day-by-day settled balance of an account from `start` to `end`. The first
/// point already includes everything paid before `start`.
pub fn daily_balances(
    account: &Account,
    entries: &[LedgerEntry],
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<DailyBalance> {
    let mut by_day: BTreeMap<NaiveDate, Money> = BTreeMap::new();
    let mut balance = account.initial_balance;

    for entry in entries
        .iter()
        .filter(|e| e.paid && e.account_id() == Some(account.id.as_str()))
    {
        if entry.date < start {
            balance += entry.signed_amount();
        } else if entry.date <= end {
            *by_day.entry(entry.date).or_default() += entry.signed_amount();
        }
    }

    start
        .iter_days()
        .take_while(|day| *day <= end)
        .map(|date| {
            balance += by_day.get(&date).copied().unwrap_or_default();
            DailyBalance { date, balance }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    UnderLimit,
    NearLimit,
    OverLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BudgetProgress {
    pub budget_id: String,
    pub category: CategoryRef,
    pub amount: Money,
    pub spent: Money,
    pub remaining: Money,
    #[schemars(description = "Unclamped consumption percentage; drives the status")]
    pub raw_percent: f64,
    #[schemars(description = "Consumption percentage clamped to [0, 100] for display")]
    pub display_percent: f64,
    pub status: BudgetStatus,
    pub predicted: Money,
    pub predicted_over_budget: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BudgetTotals {
    pub total_budget: Money,
    pub total_spent: Money,
    pub total_remaining: Money,
    pub percent: f64,
}

/// Expense totals per category for one calendar month. Card bill payments
/// are left out: the card expenses they settle are already counted.
pub fn category_spending(entries: &[LedgerEntry], year: i32, month: u32) -> BTreeMap<CategoryRef, Money> {
    let mut spending: BTreeMap<CategoryRef, Money> = BTreeMap::new();

    for entry in entries.iter().filter(|e| {
        e.kind == EntryKind::Expense
            && !e.is_card_payment()
            && e.date.year() == year
            && e.date.month() == month
    }) {
        if let Some(category) = &entry.category {
            *spending.entry(category.clone()).or_default() += entry.amount;
        }
    }

    spending
}

fn percent_of(part: Money, whole: Money) -> f64 {
    if whole > Money::ZERO {
        part.as_f64() / whole.as_f64() * 100.0
    } else {
        0.0
    }
}

/// Status of a raw consumption percentage against the configured thresholds.
fn threshold_status(raw_percent: f64, config: &EngineConfig) -> BudgetStatus {
    if raw_percent >= config.over_limit_percent {
        BudgetStatus::OverLimit
    } else if raw_percent >= config.near_limit_percent {
        BudgetStatus::NearLimit
    } else {
        BudgetStatus::UnderLimit
    }
}

/// Month-end spending forecast for `(year, month)` as seen on `today`.
/// Months already over project to what was spent; so do months that have not
/// started, since no day has elapsed.
pub fn project_month_end(spent: Money, year: i32, month: u32, today: NaiveDate) -> Result<Money> {
    if (today.year(), today.month()) != (year, month) {
        return Ok(spent);
    }

    let elapsed = Decimal::from(today.day());
    let total_days = Decimal::from(days_in_month(year, month)?);
    to_minor_units(spent.to_decimal() * total_days / elapsed)
}

pub fn budget_progress(
    budget: &Budget,
    spent: Money,
    predicted: Money,
    config: &EngineConfig,
) -> BudgetProgress {
    let raw_percent = percent_of(spent, budget.amount);
    let status = threshold_status(raw_percent, config);

    BudgetProgress {
        budget_id: budget.id.clone(),
        category: budget.category.clone(),
        amount: budget.amount,
        spent,
        remaining: budget.amount - spent,
        raw_percent,
        display_percent: raw_percent.clamp(0.0, 100.0),
        status,
        predicted,
        predicted_over_budget: predicted > budget.amount,
    }
}

pub fn budget_totals(budgets: &[Budget], progress: &[BudgetProgress]) -> BudgetTotals {
    let total_budget: Money = budgets.iter().map(|b| b.amount).sum();
    let total_spent: Money = progress.iter().map(|p| p.spent).sum();

    BudgetTotals {
        total_budget,
        total_spent,
        total_remaining: total_budget - total_spent,
        percent: percent_of(total_spent, total_budget),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct GoalProgress {
    pub goal_id: String,
    pub name: String,
    pub status: GoalStatus,
    #[schemars(description = "Whole percent reached, capped at 100")]
    pub percent: u32,
    pub remaining: Money,
    pub completed: bool,
    #[schemars(description = "Days until the deadline; negative once it has passed")]
    pub days_remaining: Option<i64>,
}

pub fn goal_progress(goal: &Goal, today: NaiveDate) -> GoalProgress {
    let percent = if goal.target_amount > Money::ZERO {
        let ratio = goal.current_amount.to_decimal() * Decimal::ONE_HUNDRED / goal.target_amount.to_decimal();
        ratio
            .round()
            .to_i64()
            .map_or(0, |p| p.clamp(0, 100) as u32)
    } else {
        0
    };

    GoalProgress {
        goal_id: goal.id.clone(),
        name: goal.name.clone(),
        status: goal.status,
        percent,
        remaining: (goal.target_amount - goal.current_amount).max(Money::ZERO),
        completed: goal.current_amount >= goal.target_amount,
        days_remaining: goal.deadline.map(|d| (d - today).num_days()),
    }
}

/// How much of a card's limit one cycle's charges use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LimitUsage {
    pub limit: Money,
    #[schemars(description = "Charges billed to the cycle, net of credits")]
    pub used: Money,
    pub raw_percent: f64,
    pub status: BudgetStatus,
}

/// Limit usage of the statement's cycle; `None` for cards without a tracked limit.
pub fn limit_usage(card: &CardBillingConfig, statement: &CycleStatement, config: &EngineConfig) -> Option<LimitUsage> {
    let limit = card.tracked_limit()?;
    let used = statement.summary.own_total.max(Money::ZERO);
    let raw_percent = percent_of(used, limit);

    Some(LimitUsage {
        limit,
        used,
        raw_percent,
        status: threshold_status(raw_percent, config),
    })
}

/// An unpaid bill whose due date is close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BillReminder {
    pub card_id: String,
    pub cycle: BillCycle,
    pub due_date: NaiveDate,
    pub amount_due: Money,
    pub days_until_due: i64,
}

/// A reminder when the statement still owes money and falls due within
/// `bill_reminder_days` of `today` (due today included).
pub fn bill_reminder(statement: &CycleStatement, today: NaiveDate, config: &EngineConfig) -> Option<BillReminder> {
    let summary = &statement.summary;
    let days_until_due = (statement.due_date - today).num_days();
    if summary.is_paid()
        || summary.remaining <= Money::ZERO
        || !(0..=i64::from(config.bill_reminder_days)).contains(&days_until_due)
    {
        return None;
    }

    Some(BillReminder {
        card_id: summary.card_id.clone(),
        cycle: summary.cycle,
        due_date: statement.due_date,
        amount_due: summary.remaining,
        days_until_due,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CardView {
    pub card_id: String,
    pub statements: Vec<CycleStatement>,
    /// Statement of the cycle closing in the aggregated month.
    pub current: CycleStatement,
    pub limit: Option<LimitUsage>,
    pub reminder: Option<BillReminder>,
    #[schemars(description = "The card still owes a balance carried longer than the lookback limit")]
    pub lookback_exceeded: bool,
}

impl CardView {
    pub fn build(
        card: &CardBillingConfig,
        ledger: &CycleLedger,
        year: i32,
        month: u32,
        today: NaiveDate,
        config: &EngineConfig,
    ) -> Result<Self> {
        let cycle = BillCycle::new(month, year)?;
        let current = ledger.statement(cycle)?;

        // the bill due soonest may belong to the cycle before this month's one
        let reminder = match bill_reminder(&ledger.statement(cycle.prev()?)?, today, config) {
            Some(reminder) => Some(reminder),
            None => bill_reminder(&current, today, config),
        };
        if let Some(reminder) = &reminder {
            info!(
                "Card {} bill for {} is due in {} day(s): {}",
                reminder.card_id, reminder.cycle, reminder.days_until_due, reminder.amount_due
            );
        }

        Ok(CardView {
            card_id: card.card_id.clone(),
            statements: ledger.statements()?,
            limit: limit_usage(card, &current, config),
            reminder,
            lookback_exceeded: ledger.lookback_breach()?.is_some(),
            current,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AggregateView {
    pub year: i32,
    pub month: u32,
    pub accounts: Vec<AccountBalance>,
    pub budgets: Vec<BudgetProgress>,
    pub budget_totals: BudgetTotals,
    pub goals: Vec<GoalProgress>,
    pub cards: Vec<CardView>,
}

pub struct Aggregator<'a> {
    config: &'a EngineConfig,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    /// Aggregates the month `today` falls in.
    pub fn run(&self, snapshot: &LedgerSnapshot, today: NaiveDate) -> Result<AggregateView> {
        self.run_for_month(snapshot, today.year(), today.month(), today)
    }

    pub fn run_for_month(
        &self,
        snapshot: &LedgerSnapshot,
        year: i32,
        month: u32,
        today: NaiveDate,
    ) -> Result<AggregateView> {
        let month_start = first_day_of_month(year, month)?;
        let month_end = last_day_of_month(year, month)?;
        debug!("Aggregating {} to {}", month_start, month_end);

        let accounts = snapshot
            .accounts
            .iter()
            .map(|a| account_balance(a, &snapshot.entries, None))
            .collect();

        let spending = category_spending(&snapshot.entries, year, month);
        let mut budgets = snapshot
            .budgets
            .iter()
            .map(|budget| {
                let spent = spending.get(&budget.category).copied().unwrap_or_default();
                let predicted = project_month_end(spent, year, month, today)?;
                Ok(budget_progress(budget, spent, predicted, self.config))
            })
            .collect::<Result<Vec<_>>>()?;
        let budget_totals = budget_totals(&snapshot.budgets, &budgets);
        budgets.sort_by(|a, b| {
            b.display_percent
                .total_cmp(&a.display_percent)
                .then_with(|| a.budget_id.cmp(&b.budget_id))
        });

        let goals = snapshot.goals.iter().map(|g| goal_progress(g, today)).collect();

        let cards = snapshot
            .cards
            .iter()
            .map(|card| {
                let ledger = CycleLedger::build(card, &snapshot.entries, &snapshot.settlements, self.config)?;
                CardView::build(card, &ledger, year, month, today, self.config)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AggregateView {
            year,
            month,
            accounts,
            budgets,
            budget_totals,
            goals,
            cards,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BillCycle, BillSettlement, CardBillingConfig, EntryOwner};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn account_entry(id: &str, kind: EntryKind, cents: i64, date: NaiveDate, paid: bool, category: &str) -> LedgerEntry {
        LedgerEntry {
            id: id.to_string(),
            description: id.to_string(),
            kind,
            amount: Money::from_cents(cents),
            date,
            owner: EntryOwner::Account {
                account_id: "checking".to_string(),
            },
            paid,
            category: Some(CategoryRef::new(category)),
            tags: vec![],
            recurrence: None,
            original_amount: None,
            bill_cycle: None,
        }
    }

    fn checking() -> Account {
        Account {
            id: "checking".to_string(),
            name: "Checking".to_string(),
            initial_balance: Money::from_cents(100000),
        }
    }

    fn snapshot() -> LedgerSnapshot {
        let mut card_expense = account_entry("c1", EntryKind::Expense, 30000, d(2024, 6, 2), false, "food");
        card_expense.owner = EntryOwner::Card {
            card_id: "visa".to_string(),
        };
        card_expense.bill_cycle = Some(BillCycle::new(6, 2024).unwrap());

        LedgerSnapshot {
            accounts: vec![checking()],
            cards: vec![CardBillingConfig::new("visa", 10, 20).unwrap()],
            entries: vec![
                account_entry("salary", EntryKind::Income, 500000, d(2024, 6, 5), true, "salary"),
                account_entry("rent", EntryKind::Expense, 150000, d(2024, 6, 1), true, "housing"),
                account_entry("market", EntryKind::Expense, 45000, d(2024, 6, 8), true, "food"),
                account_entry("gym", EntryKind::Expense, 9000, d(2024, 6, 25), false, "health"),
                {
                    let mut payment =
                        account_entry("pay", EntryKind::Expense, 30000, d(2024, 6, 15), true, "card_payment");
                    payment.category = Some(CategoryRef::card_payment());
                    payment
                },
                card_expense,
            ],
            settlements: vec![BillSettlement {
                id: "s1".to_string(),
                card_id: "visa".to_string(),
                cycle: BillCycle::new(6, 2024).unwrap(),
                amount_paid: Money::from_cents(30000),
                total_bill_at_payment: Money::from_cents(30000),
                funding_account_id: "checking".to_string(),
                entry_id: "pay".to_string(),
                paid_at: d(2024, 6, 15),
                is_partial: false,
            }],
            budgets: vec![
                Budget {
                    id: "b-food".to_string(),
                    category: CategoryRef::new("food"),
                    amount: Money::from_cents(80000),
                },
                Budget {
                    id: "b-health".to_string(),
                    category: CategoryRef::new("health"),
                    amount: Money::from_cents(10000),
                },
            ],
            goals: vec![Goal {
                id: "g1".to_string(),
                name: "Trip".to_string(),
                target_amount: Money::from_cents(300000),
                current_amount: Money::from_cents(100000),
                deadline: Some(d(2024, 12, 31)),
                status: GoalStatus::Active,
            }],
        }
    }

    #[test]
    fn test_account_balance_settled_and_projected() {
        let snap = snapshot();
        let balance = account_balance(&checking(), &snap.entries, None);
        // 1000.00 + 5000.00 - 1500.00 - 450.00 - 300.00
        assert_eq!(balance.settled, Money::from_cents(375000));
        assert_eq!(balance.projected, Money::from_cents(366000));

        let early = account_balance(&checking(), &snap.entries, Some((d(2024, 6, 1), d(2024, 6, 4))));
        assert_eq!(early.settled, Money::from_cents(-50000));
    }

    #[test]
    fn test_daily_balances() {
        let snap = snapshot();
        let series = daily_balances(&checking(), &snap.entries, d(2024, 6, 4), d(2024, 6, 6));
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].balance, Money::from_cents(-50000));
        assert_eq!(series[1].balance, Money::from_cents(450000));
        assert_eq!(series[2].balance, Money::from_cents(450000));
    }

    #[test]
    fn test_budget_status_uses_raw_percent() {
        let budget = Budget {
            id: "b".to_string(),
            category: CategoryRef::new("food"),
            amount: Money::from_cents(10000),
        };
        let config = EngineConfig::default();

        let over = budget_progress(&budget, Money::from_cents(15000), Money::from_cents(15000), &config);
        assert_eq!(over.status, BudgetStatus::OverLimit);
        assert_eq!(over.display_percent, 100.0);
        assert_eq!(over.raw_percent, 150.0);
        assert_eq!(over.remaining, Money::from_cents(-5000));

        let near = budget_progress(&budget, Money::from_cents(8000), Money::from_cents(8000), &config);
        assert_eq!(near.status, BudgetStatus::NearLimit);

        let under = budget_progress(&budget, Money::from_cents(7999), Money::from_cents(12000), &config);
        assert_eq!(under.status, BudgetStatus::UnderLimit);
        assert!(under.predicted_over_budget);
    }

    #[test]
    fn test_projection() {
        // 30 day month, 10 days elapsed
        assert_eq!(
            project_month_end(Money::from_cents(10000), 2024, 6, d(2024, 6, 10)).unwrap(),
            Money::from_cents(30000)
        );
        assert_eq!(
            project_month_end(Money::from_cents(10000), 2024, 5, d(2024, 6, 10)).unwrap(),
            Money::from_cents(10000)
        );
        assert_eq!(
            project_month_end(Money::from_cents(100), 2024, 2, d(2024, 2, 3)).unwrap(),
            Money::from_cents(967)
        );
    }

    #[test]
    fn test_spending_excludes_card_payments() {
        let snap = snapshot();
        let spending = category_spending(&snap.entries, 2024, 6);
        assert_eq!(spending.get(&CategoryRef::new("food")), Some(&Money::from_cents(75000)));
        assert!(!spending.contains_key(&CategoryRef::card_payment()));
    }

    #[test]
    fn test_goal_progress() {
        let snap = snapshot();
        let progress = goal_progress(&snap.goals[0], d(2024, 12, 1));
        assert_eq!(progress.percent, 33);
        assert_eq!(progress.days_remaining, Some(30));
        assert!(!progress.completed);

        let mut done = snap.goals[0].clone();
        done.current_amount = Money::from_cents(400000);
        let progress = goal_progress(&done, d(2025, 1, 2));
        assert_eq!(progress.percent, 100);
        assert!(progress.completed);
        assert_eq!(progress.days_remaining, Some(-2));
        assert_eq!(progress.remaining, Money::ZERO);

        done.target_amount = Money::ZERO;
        assert_eq!(goal_progress(&done, d(2025, 1, 2)).percent, 0);
    }

    #[test]
    fn test_run_is_idempotent() {
        let snap = snapshot();
        let config = EngineConfig::default();
        let aggregator = Aggregator::new(&config);

        let first = aggregator.run(&snap, d(2024, 6, 15)).unwrap();
        let second = aggregator.run(&snap, d(2024, 6, 15)).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );

        // food is at 93.75%, health at 90%
        assert_eq!(first.budgets[0].budget_id, "b-food");
        assert_eq!(first.budget_totals.total_spent, Money::from_cents(84000));
        assert_eq!(first.cards[0].statements.len(), 1);
        assert!(first.cards[0].statements[0].summary.is_paid());
        assert!(first.cards[0].current.summary.is_paid());
        assert_eq!(first.cards[0].limit, None);
        assert_eq!(first.cards[0].reminder, None);
        assert!(!first.cards[0].lookback_exceeded);
    }

    fn unpaid_card_snapshot(limit: Option<Money>) -> LedgerSnapshot {
        let mut snap = snapshot();
        snap.settlements.clear();
        snap.cards[0].limit = limit;
        snap
    }

    #[test]
    fn test_card_limit_usage() {
        let config = EngineConfig::default();
        let aggregator = Aggregator::new(&config);
        let status_for = |limit: i64| {
            let view = aggregator
                .run(&unpaid_card_snapshot(Some(Money::from_cents(limit))), d(2024, 6, 5))
                .unwrap();
            view.cards[0].limit.clone().unwrap()
        };

        // the June cycle charges 300.00
        let roomy = status_for(40000);
        assert_eq!(roomy.used, Money::from_cents(30000));
        assert_eq!(roomy.raw_percent, 75.0);
        assert_eq!(roomy.status, BudgetStatus::UnderLimit);
        assert_eq!(status_for(35000).status, BudgetStatus::NearLimit);
        assert_eq!(status_for(30000).status, BudgetStatus::OverLimit);

        let untracked = aggregator.run(&unpaid_card_snapshot(Some(Money::ZERO)), d(2024, 6, 5)).unwrap();
        assert_eq!(untracked.cards[0].limit, None);
    }

    #[test]
    fn test_bill_reminder_window() {
        let config = EngineConfig::default();
        let aggregator = Aggregator::new(&config);
        let snap = unpaid_card_snapshot(None);

        // June bill closes on the 10th and is due on the 20th
        let reminder = aggregator.run(&snap, d(2024, 6, 17)).unwrap().cards[0].reminder.clone().unwrap();
        assert_eq!(reminder.cycle, BillCycle::new(6, 2024).unwrap());
        assert_eq!(reminder.due_date, d(2024, 6, 20));
        assert_eq!(reminder.amount_due, Money::from_cents(30000));
        assert_eq!(reminder.days_until_due, 3);

        assert!(aggregator.run(&snap, d(2024, 6, 20)).unwrap().cards[0].reminder.is_some());
        assert!(aggregator.run(&snap, d(2024, 6, 16)).unwrap().cards[0].reminder.is_none());
        assert!(aggregator.run(&snap, d(2024, 6, 21)).unwrap().cards[0].reminder.is_none());

        // paid bills never remind
        assert!(aggregator.run(&snapshot(), d(2024, 6, 17)).unwrap().cards[0].reminder.is_none());
    }
}
