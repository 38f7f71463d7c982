use crate::error::{LedgerError, Result};
use crate::money::Money;
use crate::utils::shift_month;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Category id used for the account-side entry of a card bill payment.
pub const CARD_PAYMENT_CATEGORY: &str = "card_payment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Income,
    Expense,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CategoryRef(pub String);

impl CategoryRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn card_payment() -> Self {
        Self(CARD_PAYMENT_CATEGORY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct TagRef(pub String);

/// An entry belongs either to a plain account or to a card, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "owner", rename_all = "snake_case")]
pub enum EntryOwner {
    Account { account_id: String },
    Card { card_id: String },
}

/// Monthly statement period of a card, named by the month it closes in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(try_from = "RawBillCycle")]
pub struct BillCycle {
    // field order gives chronological Ord
    pub year: i32,
    #[schemars(description = "Closing month, 1 = January")]
    pub month: u32,
}

impl BillCycle {
    pub fn new(month: u32, year: i32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(LedgerError::InvalidMonth(month));
        }
        Ok(Self { year, month })
    }

    pub fn next(&self) -> Result<Self> {
        self.offset(1)
    }

    pub fn prev(&self) -> Result<Self> {
        self.offset(-1)
    }

    pub fn offset(&self, months: i32) -> Result<Self> {
        let (year, month) = shift_month(self.year, self.month, months)?;
        Ok(Self { year, month })
    }
}

/// Stored shape of a cycle, checked through `BillCycle::new` on load.
#[derive(Deserialize, JsonSchema)]
struct RawBillCycle {
    year: i32,
    month: u32,
}

impl TryFrom<RawBillCycle> for BillCycle {
    type Error = LedgerError;

    fn try_from(raw: RawBillCycle) -> Result<Self> {
        BillCycle::new(raw.month, raw.year)
    }
}

impl fmt::Display for BillCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RecurrenceInfo {
    pub group_id: String,
    #[schemars(description = "1-based position within the group")]
    pub index: u32,
    pub total: u32,
}

impl RecurrenceInfo {
    pub fn label(&self) -> String {
        format!("{}/{}", self.index, self.total)
    }
}

/// One concrete dated financial fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LedgerEntry {
    pub id: String,
    pub description: String,
    pub kind: EntryKind,
    #[schemars(description = "Amount in minor units; counted against the balance when `kind` is expense")]
    pub amount: Money,
    pub date: NaiveDate,
    #[serde(flatten)]
    pub owner: EntryOwner,
    pub paid: bool,
    #[serde(default)]
    pub category: Option<CategoryRef>,
    #[serde(default)]
    pub tags: Vec<TagRef>,
    #[serde(default)]
    pub recurrence: Option<RecurrenceInfo>,
    #[serde(default)]
    #[schemars(description = "Total of the installment series this entry was split from")]
    pub original_amount: Option<Money>,
    #[serde(default)]
    #[schemars(description = "Cycle stamped at creation for card entries; absent on legacy entries")]
    pub bill_cycle: Option<BillCycle>,
}

impl LedgerEntry {
    /// Amount with income positive and expense negative.
    pub fn signed_amount(&self) -> Money {
        match self.kind {
            EntryKind::Income => self.amount,
            EntryKind::Expense => -self.amount,
        }
    }

    pub fn card_id(&self) -> Option<&str> {
        match &self.owner {
            EntryOwner::Card { card_id } => Some(card_id),
            EntryOwner::Account { .. } => None,
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        match &self.owner {
            EntryOwner::Account { account_id } => Some(account_id),
            EntryOwner::Card { .. } => None,
        }
    }

    pub fn group_id(&self) -> Option<&str> {
        self.recurrence.as_ref().map(|r| r.group_id.as_str())
    }

    pub fn is_card_payment(&self) -> bool {
        self.category
            .as_ref()
            .is_some_and(|c| c.as_str() == CARD_PAYMENT_CATEGORY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CardBillingConfig {
    pub card_id: String,
    #[serde(default)]
    pub name: String,
    #[schemars(description = "Day of month (1-28) after which expenses roll into the next cycle")]
    pub closing_day: u32,
    #[schemars(description = "Day of month (1-28) the bill is due")]
    pub due_day: u32,
    #[serde(default)]
    #[schemars(description = "Credit limit; absent or non-positive means untracked")]
    pub limit: Option<Money>,
}

impl CardBillingConfig {
    pub fn new(card_id: impl Into<String>, closing_day: u32, due_day: u32) -> Result<Self> {
        let config = Self {
            card_id: card_id.into(),
            name: String::new(),
            closing_day,
            due_day,
            limit: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// The limit, when one is set and positive.
    pub fn tracked_limit(&self) -> Option<Money> {
        self.limit.filter(|l| *l > Money::ZERO)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=28).contains(&self.closing_day) {
            return Err(LedgerError::InvalidClosingDay(self.closing_day));
        }
        if !(1..=28).contains(&self.due_day) {
            return Err(LedgerError::InvalidDueDay(self.due_day));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub initial_balance: Money,
}

/// A payment recorded against one card bill cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BillSettlement {
    pub id: String,
    pub card_id: String,
    pub cycle: BillCycle,
    pub amount_paid: Money,
    pub total_bill_at_payment: Money,
    pub funding_account_id: String,
    #[schemars(description = "Id of the account-side expense entry booked for this payment")]
    pub entry_id: String,
    pub paid_at: NaiveDate,
    pub is_partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Budget {
    pub id: String,
    pub category: CategoryRef,
    pub amount: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Goal {
    pub id: String,
    pub name: String,
    pub target_amount: Money,
    pub current_amount: Money,
    #[serde(default)]
    pub deadline: Option<NaiveDate>,
    pub status: GoalStatus,
}

/// Everything the read side works from: one consistent set of documents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub cards: Vec<CardBillingConfig>,
    #[serde(default)]
    pub entries: Vec<LedgerEntry>,
    #[serde(default)]
    pub settlements: Vec<BillSettlement>,
    #[serde(default)]
    pub budgets: Vec<Budget>,
    #[serde(default)]
    pub goals: Vec<Goal>,
}

impl LedgerSnapshot {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(LedgerSnapshot)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }

    pub fn card(&self, card_id: &str) -> Option<&CardBillingConfig> {
        self.cards.iter().find(|c| c.card_id == card_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_generation() {
        let schema_json = LedgerSnapshot::schema_as_json().unwrap();
        assert!(schema_json.contains("settlements"));
        assert!(schema_json.contains("bill_cycle"));
        assert!(schema_json.contains("closing_day"));
    }

    #[test]
    fn test_entry_serialization_flattens_owner() {
        let entry = LedgerEntry {
            id: "e1".to_string(),
            description: "Groceries".to_string(),
            kind: EntryKind::Expense,
            amount: Money::from_cents(4590),
            date: NaiveDate::from_ymd_opt(2024, 3, 11).unwrap(),
            owner: EntryOwner::Card {
                card_id: "visa".to_string(),
            },
            paid: false,
            category: Some(CategoryRef::new("food")),
            tags: vec![],
            recurrence: None,
            original_amount: None,
            bill_cycle: Some(BillCycle::new(4, 2024).unwrap()),
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["owner"], "card");
        assert_eq!(json["card_id"], "visa");
        assert_eq!(json["amount"], 4590);
        assert_eq!(json["date"], "2024-03-11");

        let back: LedgerEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.signed_amount(), Money::from_cents(-4590));
    }

    #[test]
    fn test_bill_cycle_ordering_and_rollover() {
        let dec = BillCycle::new(12, 2024).unwrap();
        let jan = dec.next().unwrap();
        assert_eq!(jan, BillCycle::new(1, 2025).unwrap());
        assert!(jan > dec);
        assert_eq!(jan.prev().unwrap(), dec);
        assert_eq!(jan.to_string(), "2025-01");
        assert!(BillCycle::new(0, 2024).is_err());
    }

    #[test]
    fn test_card_config_bounds() {
        assert!(CardBillingConfig::new("c", 28, 5).is_ok());
        assert!(matches!(
            CardBillingConfig::new("c", 29, 5),
            Err(LedgerError::InvalidClosingDay(29))
        ));
        assert!(matches!(
            CardBillingConfig::new("c", 10, 0),
            Err(LedgerError::InvalidDueDay(0))
        ));
    }

    #[test]
    fn test_stored_cycle_with_bad_month_is_rejected() {
        let bad = serde_json::json!({ "year": 2024, "month": 13 });
        assert!(serde_json::from_value::<BillCycle>(bad).is_err());

        let settlement = serde_json::json!({
            "id": "s1",
            "card_id": "visa",
            "cycle": { "year": 2024, "month": 13 },
            "amount_paid": 1000,
            "total_bill_at_payment": 1000,
            "funding_account_id": "checking",
            "entry_id": "e1",
            "paid_at": "2024-03-15",
            "is_partial": false
        });
        assert!(serde_json::from_value::<BillSettlement>(settlement).is_err());

        let good = serde_json::json!({ "year": 2024, "month": 12 });
        assert_eq!(
            serde_json::from_value::<BillCycle>(good).unwrap(),
            BillCycle::new(12, 2024).unwrap()
        );
    }

    #[test]
    fn test_card_limit_is_optional() {
        let card: CardBillingConfig = serde_json::from_value(serde_json::json!({
            "card_id": "visa",
            "closing_day": 10,
            "due_day": 20
        }))
        .unwrap();
        assert_eq!(card.limit, None);
        assert_eq!(card.tracked_limit(), None);

        let mut card = card;
        card.limit = Some(Money::ZERO);
        assert_eq!(card.tracked_limit(), None);
        card.limit = Some(Money::from_cents(500000));
        assert_eq!(card.tracked_limit(), Some(Money::from_cents(500000)));
    }
}
