use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};
use std::str::FromStr;

/// money carried internally as signed centavos (1 peso = 100 centavos).
///
/// every public arithmetic operation here takes and returns integer
/// centavos; conversion to/from pesos happens only at `from_pesos_str` /
/// `to_pesos_string`, which round half-up. no intermediate computation in
/// this crate touches floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default, Hash)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);
    pub const ONE_CENTAVO: Money = Money(1);

    /// construct from an exact centavo count
    pub fn from_centavos(centavos: i64) -> Self {
        Money(centavos)
    }

    /// construct from a whole-peso amount
    pub fn from_pesos(pesos: i64) -> Self {
        Money(pesos * 100)
    }

    /// parse a decimal peso string ("914.30"), rounding half-up to the
    /// nearest centavo. the source's prior floating-point design produced
    /// observable precision errors; this is the one parsing boundary.
    pub fn from_pesos_str(s: &str) -> Result<Self, rust_decimal::Error> {
        let d = Decimal::from_str(s)?;
        Ok(Money(round_half_up_to_centavos(d)))
    }

    pub fn centavos(&self) -> i64 {
        self.0
    }

    /// render as a decimal peso string with exactly 2 places
    pub fn to_pesos_string(&self) -> String {
        let whole = self.0 / 100;
        let frac = (self.0 % 100).abs();
        if self.0 < 0 && whole == 0 {
            format!("-{}.{:02}", whole, frac)
        } else {
            format!("{}.{:02}", whole, frac)
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    pub fn min(self, other: Self) -> Self {
        Money(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    /// divide into `parts` equal shares, rounding half-up; the sum of the
    /// shares always reconciles to the original amount by folding any
    /// rounding remainder into the first share (used for quarterly dues
    /// split across three month-slots).
    pub fn split_equally(&self, parts: u32) -> Vec<Money> {
        assert!(parts > 0, "split_equally requires at least one part");
        let parts = parts as i64;
        let base = self.0 / parts;
        let remainder = self.0 - base * parts;
        let mut shares = vec![Money(base); parts as usize];
        if remainder != 0 {
            shares[0] = Money(base + remainder);
        }
        shares
    }
}

/// round a `Decimal` of pesos to the nearest centavo, half away from zero
fn round_half_up_to_centavos(pesos: Decimal) -> i64 {
    let centavos = (pesos * Decimal::from(100)).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    centavos.try_into().unwrap_or(i64::MAX)
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_pesos_string())
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::from_pesos_str(s)
    }
}

impl From<i32> for Money {
    fn from(i: i32) -> Self {
        Money::from_pesos(i as i64)
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

impl Mul<i64> for Money {
    type Output = Money;
    fn mul(self, scalar: i64) -> Money {
        Money(self.0 * scalar)
    }
}

/// multiplying money by a rate rounds the product half-up to the nearest
/// centavo; this is the only place a rate ever touches a balance.
impl Mul<Rate> for Money {
    type Output = Money;
    fn mul(self, rate: Rate) -> Money {
        let product = Decimal::from(self.0) * rate.as_decimal();
        Money(product.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero).try_into().unwrap_or(i64::MAX))
    }
}

/// rate type for interest/penalty rates, held as an exact decimal fraction
/// (e.g. 0.05 for 5%/month). rates are not integer quantities, unlike
/// `Money`; they are only ever multiplied against a `Money` value, which is
/// where the centavo rounding boundary lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Rate(Decimal);

impl Rate {
    pub const ZERO: Rate = Rate(Decimal::ZERO);

    pub fn from_decimal(d: Decimal) -> Self {
        Rate(d)
    }

    /// from a percentage, e.g. `Rate::from_percentage_points(5)` == 5%
    pub fn from_percentage_points(p: i64) -> Self {
        Rate(Decimal::from(p) / Decimal::from(100))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn as_percentage(&self) -> Decimal {
        self.0 * Decimal::from(100)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.as_percentage())
    }
}

impl From<Decimal> for Rate {
    fn from(d: Decimal) -> Self {
        Rate::from_decimal(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_cent_parity() {
        // scenario 1 from spec.md §8: $500.10 + $414.20 == $914.30 exactly
        let a = Money::from_pesos_str("500.10").unwrap();
        let b = Money::from_pesos_str("414.20").unwrap();
        let total = a + b;
        assert_eq!(total, Money::from_centavos(91430));
        assert_eq!(total.to_pesos_string(), "914.30");
    }

    #[test]
    fn test_no_fractional_tail_ever_appears() {
        let m = Money::from_pesos_str("914.30").unwrap();
        // representation is always an exact centavo count; there is no
        // decimal expansion step that could produce a repeating fraction
        assert_eq!(m.centavos(), 91430);
        assert_eq!(m.to_pesos_string(), "914.30");
    }

    #[test]
    fn test_round_half_up_parsing() {
        // a value with more than 2 decimal digits rounds to the nearest centavo
        let m = Money::from_pesos_str("10.005").unwrap();
        assert_eq!(m.centavos(), 1001); // midpoint rounds away from zero
    }

    #[test]
    fn test_split_equally_reconciles() {
        let total = Money::from_pesos(100);
        let shares = total.split_equally(3);
        assert_eq!(shares.len(), 3);
        let sum: Money = shares.iter().fold(Money::ZERO, |acc, m| acc + *m);
        assert_eq!(sum, total);
        // remainder folds into the first share
        assert_eq!(shares[0], Money::from_centavos(3334));
        assert_eq!(shares[1], Money::from_centavos(3333));
        assert_eq!(shares[2], Money::from_centavos(3333));
    }

    #[test]
    fn test_money_times_rate_rounds_half_up() {
        let principal = Money::from_pesos(1000);
        let rate = Rate::from_percentage_points(5);
        let penalty = principal * rate;
        assert_eq!(penalty, Money::from_pesos(50));
    }

    #[test]
    fn test_negative_money_display() {
        let m = Money::from_centavos(-50);
        assert_eq!(m.to_pesos_string(), "-0.50");
    }
}
