//! Withdrawal strategies for [`NominalGroup::withdraw`].
//!
//! A strategy decides which nominal to take next while paying out an
//! amount. [`ExpendStrategy::reset`] snapshots whatever ordering the
//! strategy needs into an [`ExpendPlan`]; the plan then hands out one
//! nominal at a time until the amount is covered.

use crate::currency::{Amount, Nominal, NominalGroup};
use crate::error::{Error, Result};

/// How to choose nominals when paying out.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpendStrategy {
    /// Largest nominal first, fewest coins.
    LeastCount,
    /// Most plentiful nominal first, keeps tubes balanced.
    MostAvailable,
    /// Order by the counts in a reference group, for example historic
    /// deposits.
    Statistical { stat: NominalGroup },
    /// Pick `first` with probability `ratio`, otherwise `second`.
    /// Seeded from the source total so a given payout is reproducible.
    Combined {
        first: Box<ExpendStrategy>,
        second: Box<ExpendStrategy>,
        ratio: f32,
    },
}

impl ExpendStrategy {
    /// Whether the strategy can produce a plan at all.
    pub fn validate(&self) -> bool {
        match self {
            Self::LeastCount | Self::MostAvailable => true,
            Self::Statistical { stat } => stat.total() > Amount::ZERO,
            Self::Combined { first, second, .. } => first.validate() && second.validate(),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::StrategyInvalid`] when [`validate`](Self::validate)
    /// fails.
    pub fn reset(&self, from: &NominalGroup) -> Result<ExpendPlan> {
        Ok(match self {
            Self::LeastCount => ExpendPlan::Ordered(from.order_by(|n, _| n)),
            Self::MostAvailable => ExpendPlan::Ordered(from.order_by(|_, c| c)),
            Self::Statistical { stat } => {
                if stat.total() == Amount::ZERO {
                    return Err(Error::StrategyInvalid(
                        "statistical reference group is empty".to_string(),
                    ));
                }
                let mut order = stat.order_by(|_, c| c);
                // Nominals the reference never saw go last, largest first.
                order.extend(
                    from.order_by(|n, _| n)
                        .into_iter()
                        .filter(|n| !stat.is_valid(*n)),
                );
                ExpendPlan::Ordered(order)
            }
            Self::Combined {
                first,
                second,
                ratio,
            } => ExpendPlan::Combined {
                rng: SplitMix64::new(u64::from(from.total().0)),
                ratio: *ratio,
                first: Box::new(first.reset(from)?),
                second: Box::new(second.reset(from)?),
            },
        })
    }
}

/// Strategy state for one withdrawal.
#[derive(Debug, Clone)]
pub enum ExpendPlan {
    Ordered(Vec<Nominal>),
    Combined {
        rng: SplitMix64,
        ratio: f32,
        first: Box<ExpendPlan>,
        second: Box<ExpendPlan>,
    },
}

impl ExpendPlan {
    /// Remove one nominal not above `max` from `from` and return it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NominalCount`] when nothing fits.
    pub fn expend_one(&mut self, from: &mut NominalGroup, max: Amount) -> Result<Nominal> {
        match self {
            Self::Ordered(order) => order
                .iter()
                .copied()
                .find(|&n| from.take_one(n, max))
                .ok_or(Error::NominalCount { amount: max }),
            Self::Combined {
                rng,
                ratio,
                first,
                second,
            } => {
                if rng.next_f32() < *ratio {
                    first.expend_one(from, max)
                } else {
                    second.expend_one(from, max)
                }
            }
        }
    }
}

/// Small deterministic generator for [`ExpendStrategy::Combined`].
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tubes() -> NominalGroup {
        let mut ng = NominalGroup::with_valid(&[Nominal(10), Nominal(5), Nominal(2), Nominal(1)]);
        ng.add(Nominal(10), 2).unwrap();
        ng.add(Nominal(5), 8).unwrap();
        ng.add(Nominal(2), 1).unwrap();
        ng.add(Nominal(1), 3).unwrap();
        ng
    }

    #[test]
    fn test_most_available_prefers_count() {
        let mut from = tubes();
        let mut to = NominalGroup::with_valid(&[Nominal(10), Nominal(5), Nominal(2), Nominal(1)]);
        from.withdraw(Some(&mut to), Amount(10), &ExpendStrategy::MostAvailable)
            .unwrap();
        assert_eq!(to.get(Nominal(5)).unwrap(), 2);
        assert_eq!(to.get(Nominal(10)).unwrap(), 0);
    }

    #[test]
    fn test_statistical_requires_reference() {
        let stat = NominalGroup::with_valid(&[Nominal(10)]);
        let s = ExpendStrategy::Statistical { stat };
        assert!(!s.validate());
        let err = tubes().withdraw(None, Amount(10), &s).unwrap_err();
        assert!(matches!(err, Error::StrategyInvalid(_)));
    }

    #[test]
    fn test_statistical_follows_reference() {
        let mut stat = NominalGroup::with_valid(&[Nominal(10), Nominal(2)]);
        stat.add(Nominal(2), 9).unwrap();
        stat.add(Nominal(10), 1).unwrap();
        let mut from = tubes();
        let mut to = tubes();
        to.clear();
        from.withdraw(Some(&mut to), Amount(2), &ExpendStrategy::Statistical { stat })
            .unwrap();
        assert_eq!(to.get(Nominal(2)).unwrap(), 1);
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.5)]
    #[case(1.0)]
    fn test_combined_pays_exact(#[case] ratio: f32) {
        let s = ExpendStrategy::Combined {
            first: Box::new(ExpendStrategy::LeastCount),
            second: Box::new(ExpendStrategy::MostAvailable),
            ratio,
        };
        let mut from = tubes();
        let mut to = tubes();
        to.clear();
        from.withdraw(Some(&mut to), Amount(30), &s).unwrap();
        assert_eq!(to.total(), Amount(30));
        assert_eq!(from.total(), Amount(35));
    }

    #[test]
    fn test_combined_is_deterministic() {
        let s = ExpendStrategy::Combined {
            first: Box::new(ExpendStrategy::LeastCount),
            second: Box::new(ExpendStrategy::MostAvailable),
            ratio: 0.5,
        };
        let run = || {
            let mut from = tubes();
            let mut to = tubes();
            to.clear();
            from.withdraw(Some(&mut to), Amount(27), &s).unwrap();
            to
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_rng_range() {
        let mut rng = SplitMix64::new(65);
        for _ in 0..1000 {
            let v = rng.next_f32();
            assert!((0.0..1.0).contains(&v));
        }
    }
}
