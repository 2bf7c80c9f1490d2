//! Money amounts and multi-denomination groups.
//!
//! [`Amount`] counts the lowest currency unit (cents), so `$1.20` is `120`.
//! [`NominalGroup`] tracks how many coins or bills of each face value are
//! held, for example the coins currently inserted by a customer or the
//! contents of the changer tubes:
//!
//! ```text
//! coin 1  : 3
//! coin 5  : 1
//! coin 10 : 4
//! total   : 48
//! ```
//!
//! # Examples
//!
//! ```
//! use vender_core::currency::{Amount, Nominal, NominalGroup};
//! use vender_core::strategy::ExpendStrategy;
//!
//! let mut tubes = NominalGroup::with_valid(&[Nominal(10), Nominal(5), Nominal(1)]);
//! tubes.add(Nominal(10), 2).unwrap();
//! tubes.add(Nominal(5), 1).unwrap();
//!
//! let mut change = NominalGroup::with_valid(&[Nominal(10), Nominal(5), Nominal(1)]);
//! tubes.withdraw(Some(&mut change), Amount(15), &ExpendStrategy::LeastCount).unwrap();
//! assert_eq!(change.total(), Amount(15));
//! assert_eq!(tubes.total(), Amount(10));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::strategy::ExpendStrategy;

/// Integer amount in the lowest currency unit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(pub u32);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Render as units with hundredths, trailing fractional zeros trimmed.
    ///
    /// ```
    /// use vender_core::currency::Amount;
    ///
    /// assert_eq!(Amount(100).format_100i(), "1");
    /// assert_eq!(Amount(150).format_100i(), "1.5");
    /// assert_eq!(Amount(17).format_100i(), "0.17");
    /// ```
    #[must_use]
    pub fn format_100i(self) -> String {
        let whole = self.0 / 100;
        let frac = self.0 % 100;
        match frac {
            0 => whole.to_string(),
            f if f % 10 == 0 => format!("{whole}.{}", f / 10),
            f => format!("{whole}.{f:02}"),
        }
    }

    #[must_use]
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    #[must_use]
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.format_100i())
    }
}

impl From<u32> for Amount {
    fn from(v: u32) -> Self {
        Amount(v)
    }
}

impl From<Nominal> for Amount {
    fn from(n: Nominal) -> Self {
        Amount(n.0)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 = self.0.wrapping_add(rhs.0);
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 = self.0.wrapping_sub(rhs.0);
    }
}

impl Mul<u32> for Amount {
    type Output = Amount;
    fn mul(self, rhs: u32) -> Amount {
        Amount(self.0.wrapping_mul(rhs))
    }
}

/// Face value of one coin or bill.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Nominal(pub u32);

impl fmt::Display for Nominal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&Amount::from(*self).format_100i())
    }
}

/// Counts of coins or bills per nominal over a predeclared set of valid
/// nominals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NominalGroup {
    values: BTreeMap<Nominal, u32>,
}

impl NominalGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Group accepting only `valid` nominals, all counts zero.
    #[must_use]
    pub fn with_valid(valid: &[Nominal]) -> Self {
        let mut ng = Self::new();
        ng.set_valid(valid);
        ng
    }

    /// Replace the set of valid nominals. Zero is never valid. Resets counts.
    pub fn set_valid(&mut self, valid: &[Nominal]) {
        self.values = valid
            .iter()
            .filter(|n| n.0 != 0)
            .map(|&n| (n, 0))
            .collect();
    }

    pub fn is_valid(&self, n: Nominal) -> bool {
        self.values.contains_key(&n)
    }

    /// Valid nominals in ascending order.
    pub fn nominals(&self) -> impl Iterator<Item = Nominal> + '_ {
        self.values.keys().copied()
    }

    /// # Errors
    ///
    /// Returns [`Error::NominalInvalid`] when `n` was not declared valid.
    pub fn add(&mut self, n: Nominal, count: u32) -> Result<()> {
        match self.values.get_mut(&n) {
            Some(c) => {
                *c += count;
                Ok(())
            }
            None => Err(Error::NominalInvalid { nominal: n }),
        }
    }

    /// Add every count of `source`. Nothing changes on error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NominalInvalid`] when `source` holds a non-zero count
    /// of a nominal not valid here.
    pub fn add_from(&mut self, source: &NominalGroup) -> Result<()> {
        if let Some((&n, _)) = source
            .values
            .iter()
            .find(|(n, c)| **c > 0 && !self.values.contains_key(n))
        {
            return Err(Error::NominalInvalid { nominal: n });
        }
        for (n, c) in &source.values {
            if let Some(v) = self.values.get_mut(n) {
                *v += c;
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::NominalInvalid`] when `n` was not declared valid.
    pub fn get(&self, n: Nominal) -> Result<u32> {
        self.values
            .get(&n)
            .copied()
            .ok_or(Error::NominalInvalid { nominal: n })
    }

    /// Iterate `(nominal, count)` in ascending nominal order.
    pub fn iter(&self) -> impl Iterator<Item = (Nominal, u32)> + '_ {
        self.values.iter().map(|(&n, &c)| (n, c))
    }

    pub fn clear(&mut self) {
        self.values.values_mut().for_each(|c| *c = 0);
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(|&c| c == 0)
    }

    pub fn total(&self) -> Amount {
        self.values
            .iter()
            .fold(Amount::ZERO, |sum, (&n, &c)| sum + Amount::from(n) * c)
    }

    /// `self.total() - other.total()` over the nominals of `self`.
    pub fn diff(&self, other: &NominalGroup) -> Amount {
        let theirs = self.values.keys().fold(Amount::ZERO, |sum, n| {
            sum + Amount::from(*n) * other.values.get(n).copied().unwrap_or(0)
        });
        self.total() - theirs
    }

    /// Subtract every count of `other`. Nothing changes on error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NominalCount`] when some count would go negative and
    /// [`Error::NominalInvalid`] when `other` holds a nominal unknown here.
    pub fn sub(&mut self, other: &NominalGroup) -> Result<()> {
        for (n, &c) in &other.values {
            if c == 0 {
                continue;
            }
            let have = self.get(*n)?;
            if have < c {
                return Err(Error::NominalCount {
                    amount: Amount::from(*n) * c,
                });
            }
        }
        for (n, c) in &other.values {
            if let Some(v) = self.values.get_mut(n) {
                *v -= c;
            }
        }
        Ok(())
    }

    /// Remove nominals summing exactly to `amount`, chosen by `strategy`,
    /// and deposit them into `target`.
    ///
    /// On failure the nominals already taken stay removed from `self`;
    /// callers that need atomicity work on a [`Clone`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NominalCount`] when no combination fits and
    /// [`Error::StrategyInvalid`] when the strategy cannot be prepared.
    pub fn withdraw(
        &mut self,
        mut target: Option<&mut NominalGroup>,
        amount: Amount,
        strategy: &ExpendStrategy,
    ) -> Result<()> {
        let mut plan = strategy.reset(self)?;
        let mut remaining = amount;
        while remaining > Amount::ZERO {
            let n = plan.expend_one(self, remaining)?;
            debug_assert!(n.0 != 0, "strategy returned zero nominal");
            remaining -= Amount::from(n);
            if let Some(t) = target.as_deref_mut() {
                *t.values.entry(n).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    /// Take one `n` if available and not above `max`.
    pub(crate) fn take_one(&mut self, n: Nominal, max: Amount) -> bool {
        match self.values.get_mut(&n) {
            Some(c) if *c > 0 && Amount::from(n) <= max => {
                *c -= 1;
                true
            }
            _ => false,
        }
    }

    /// Nominals ordered by `key` descending, ties broken by larger nominal.
    pub(crate) fn order_by<K: Ord>(&self, key: impl Fn(Nominal, u32) -> K) -> Vec<Nominal> {
        let mut order: Vec<(Nominal, u32)> = self.iter().collect();
        order.sort_by(|a, b| key(b.0, b.1).cmp(&key(a.0, a.1)).then(b.0.cmp(&a.0)));
        order.into_iter().map(|(n, _)| n).collect()
    }
}

impl fmt::Display for NominalGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (n, c) in self.iter().filter(|(_, c)| *c > 0) {
            write!(f, "{n}:{c},")?;
        }
        write!(f, "total:{}", self.total())
    }
}
