//! Exact minor-unit money.
//!
//! Every amount inside the engine is an integer count of cents. Decimal
//! values only appear at the boundary (`to_minor_units` / `from_minor_units`).

use crate::error::{LedgerError, Result};
use log::debug;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    pub const fn cents(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn max(self, other: Money) -> Money {
        Money(self.0.max(other.0))
    }

    /// Lossy view for ratios and projections. Never fed back into a `Money`.
    pub fn as_f64(&self) -> f64 {
        self.0 as f64
    }

    pub fn to_decimal(&self) -> Decimal {
        from_minor_units(*self)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, other: Money) -> Money {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, other: Money) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, other: Money) -> Money {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, other: Money) {
        self.0 -= other.0;
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

/// How the remainder of an integer split is distributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Whole remainder on slot 0.
    #[default]
    FirstSlot,
    /// One minor unit to each of the first `remainder` slots.
    Spread,
}

/// Converts a decimal amount to cents. Sub-cent digits are rounded half away
/// from zero; values that do not fit an `i64` of cents are rejected.
pub fn to_minor_units(amount: Decimal) -> Result<Money> {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    if rounded != amount {
        debug!("Rounded boundary amount {} to {}", amount, rounded);
    }

    let cents = rounded
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|c| c.to_i64())
        .ok_or_else(|| LedgerError::AmountOutOfRange(amount.to_string()))?;

    Ok(Money(cents))
}

pub fn from_minor_units(money: Money) -> Decimal {
    Decimal::new(money.0, 2)
}

/// Splits `total` into `n` slots using floor division, with the remainder
/// added entirely to slot 0. Sign-correct for negative totals.
pub fn split_evenly(total: Money, n: u32) -> Result<Vec<Money>> {
    split_with_policy(total, n, RemainderPolicy::FirstSlot)
}

pub fn split_with_policy(total: Money, n: u32, policy: RemainderPolicy) -> Result<Vec<Money>> {
    if n == 0 {
        return Err(LedgerError::InvalidRecurrenceCount {
            count: n,
            min: 1,
            max: u32::MAX,
        });
    }

    let divisor = i64::from(n);
    let base = total.0.div_euclid(divisor);
    // div_euclid with a positive divisor is floor division, so this is in [0, n)
    let remainder = total.0.rem_euclid(divisor);

    let mut slots = vec![Money(base); n as usize];
    match policy {
        RemainderPolicy::FirstSlot => slots[0].0 += remainder,
        RemainderPolicy::Spread => {
            for slot in slots.iter_mut().take(remainder as usize) {
                slot.0 += 1;
            }
        }
    }

    Ok(slots)
}
