use crate::error::{LedgerError, Result};
use crate::money::RemainderPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    #[schemars(description = "Number of entries generated for a fixed (non-installment) recurrence.")]
    pub fixed_occurrence_count: u32,

    #[schemars(description = "Largest occurrence count a fixed recurrence may ask for.")]
    pub fixed_occurrence_max: u32,

    #[schemars(description = "Smallest accepted installment count.")]
    pub installment_min: u32,

    #[schemars(description = "Largest accepted installment count.")]
    pub installment_max: u32,

    #[schemars(
        description = "Maximum run of consecutive cycles that may carry an unpaid balance into the cycle being computed."
    )]
    pub max_carry_lookback: u32,

    #[schemars(description = "Raw budget consumption percentage at which a budget is near its limit.")]
    pub near_limit_percent: f64,

    #[schemars(description = "Raw budget consumption percentage at which a budget is over its limit.")]
    pub over_limit_percent: f64,

    pub remainder_policy: RemainderPolicy,

    #[schemars(
        description = "Resolve card entries without a stored bill cycle from their date and the card's current closing day."
    )]
    pub legacy_cycle_fallback: bool,

    #[schemars(description = "Days before a bill's due date at which an unpaid bill raises a reminder.")]
    pub bill_reminder_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fixed_occurrence_count: 12,
            fixed_occurrence_max: 730,
            installment_min: 1,
            installment_max: 120,
            max_carry_lookback: 36,
            near_limit_percent: 80.0,
            over_limit_percent: 100.0,
            remainder_policy: RemainderPolicy::FirstSlot,
            legacy_cycle_fallback: true,
            bill_reminder_days: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fixed_occurrence_count == 0 || self.fixed_occurrence_count > self.fixed_occurrence_max {
            return Err(LedgerError::InvalidConfig(format!(
                "fixed_occurrence_count {} must be between 1 and fixed_occurrence_max {}",
                self.fixed_occurrence_count, self.fixed_occurrence_max
            )));
        }

        if self.installment_min == 0 || self.installment_min > self.installment_max {
            return Err(LedgerError::InvalidConfig(format!(
                "installment bounds [{}, {}] are not a valid range starting at 1 or more",
                self.installment_min, self.installment_max
            )));
        }

        if self.max_carry_lookback == 0 {
            return Err(LedgerError::InvalidConfig(
                "max_carry_lookback must be at least 1".to_string(),
            ));
        }

        if !(self.near_limit_percent > 0.0 && self.near_limit_percent <= self.over_limit_percent) {
            return Err(LedgerError::InvalidConfig(format!(
                "near_limit_percent {} must be positive and not above over_limit_percent {}",
                self.near_limit_percent, self.over_limit_percent
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fixed_occurrence_count, 12);
        assert_eq!(config.installment_max, 120);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            EngineConfig::from_json(r#"{ "installment_max": 48, "remainder_policy": "spread" }"#)
                .unwrap();
        assert_eq!(config.installment_max, 48);
        assert_eq!(config.installment_min, 1);
        assert_eq!(config.remainder_policy, RemainderPolicy::Spread);
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let result = EngineConfig::from_json(r#"{ "installment_min": 10, "installment_max": 5 }"#);
        assert!(matches!(result, Err(LedgerError::InvalidConfig(_))));

        let result = EngineConfig::from_json(r#"{ "near_limit_percent": 120.0 }"#);
        assert!(matches!(result, Err(LedgerError::InvalidConfig(_))));

        let result = EngineConfig::from_json(r#"{ "fixed_occurrence_count": 24, "fixed_occurrence_max": 12 }"#);
        assert!(matches!(result, Err(LedgerError::InvalidConfig(_))));
    }
}
