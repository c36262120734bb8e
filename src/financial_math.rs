//! Fixed-Decimal Financial Arithmetic
//!
//! Every price and quantity in the engine is an integer number of 1e-8 units.
//! All monetary comparisons, ratios and aggregations funnel through this
//! module; nothing else in the crate does raw floating-point math on money.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Fixed-point scale: 1e8 raw units per 1.0 (8 decimal places).
pub const SCALE: i64 = 100_000_000;

const SCALE_I128: i128 = SCALE as i128;

/// Rounding division, ties away from zero. `d` must be positive.
#[inline]
fn round_div(n: i128, d: i128) -> i128 {
    debug_assert!(d > 0);
    if n >= 0 {
        (n + d / 2) / d
    } else {
        (n - d / 2) / d
    }
}

/// Parse a decimal string ("89.01", "-0.5", "20") into raw 1e8 units.
///
/// Fractional digits beyond the 8th are truncated. Returns `None` on
/// malformed input or overflow.
pub fn parse_fixed(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mut parts = digits.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit()) || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }

    let int_val: i128 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };

    let mut frac_val: i128 = 0;
    let mut frac_digits = 0usize;
    for b in frac_part.bytes().take(8) {
        frac_val = frac_val * 10 + (b - b'0') as i128;
        frac_digits += 1;
    }
    for _ in frac_digits..8 {
        frac_val *= 10;
    }

    let raw = int_val.checked_mul(SCALE_I128)?.checked_add(frac_val)?;
    let raw = if neg { -raw } else { raw };
    i64::try_from(raw).ok()
}

fn format_fixed(raw: i64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let neg = raw < 0;
    let abs = raw.unsigned_abs();
    let int = abs / SCALE as u64;
    let mut frac = abs % SCALE as u64;
    if frac == 0 {
        return write!(f, "{}{}", if neg { "-" } else { "" }, int);
    }
    // Trim trailing zeros from the fractional part.
    let mut width = 8;
    while frac % 10 == 0 {
        frac /= 10;
        width -= 1;
    }
    write!(f, "{}{}.{:0width$}", if neg { "-" } else { "" }, int, frac)
}

macro_rules! fixed_scalar {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(i64);

        impl $name {
            pub const ZERO: Self = Self(0);

            #[inline]
            pub const fn from_raw(raw: i64) -> Self {
                Self(raw)
            }

            #[inline]
            pub const fn raw(self) -> i64 {
                self.0
            }

            /// Whole units (1.0 == `SCALE` raw).
            #[inline]
            pub fn from_units(units: i64) -> Self {
                Self(units.saturating_mul(SCALE))
            }

            pub fn parse(s: &str) -> Option<Self> {
                parse_fixed(s).map(Self)
            }

            /// Lossy conversion for display and dimensionless math only.
            #[inline]
            pub fn to_f64(self) -> f64 {
                self.0 as f64 / SCALE as f64
            }

            /// Nearest representable value, ties away from zero.
            /// Returns `None` for non-finite or out-of-range input.
            pub fn from_f64(v: f64) -> Option<Self> {
                if !v.is_finite() {
                    return None;
                }
                let scaled = v * SCALE as f64;
                if scaled >= i64::MAX as f64 || scaled <= i64::MIN as f64 {
                    return None;
                }
                Some(Self(scaled.round() as i64))
            }

            #[inline]
            pub fn is_zero(self) -> bool {
                self.0 == 0
            }

            #[inline]
            pub fn is_positive(self) -> bool {
                self.0 > 0
            }

            #[inline]
            pub fn saturating_add(self, other: Self) -> Self {
                Self(self.0.saturating_add(other.0))
            }

            /// Subtraction clamped at zero; these scalars are non-negative
            /// in every flow that uses them.
            #[inline]
            pub fn saturating_sub(self, other: Self) -> Self {
                Self(self.0.saturating_sub(other.0).max(0))
            }

            #[inline]
            pub fn min(self, other: Self) -> Self {
                Self(self.0.min(other.0))
            }

            #[inline]
            pub fn max(self, other: Self) -> Self {
                Self(self.0.max(other.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                format_fixed(self.0, f)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_f64(self.to_f64())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct FixedVisitor;

                impl<'de> de::Visitor<'de> for FixedVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                        f.write_str("a decimal number or string")
                    }

                    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                        $name::from_f64(v)
                            .ok_or_else(|| E::custom("value not representable at 1e-8"))
                    }

                    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                        Ok($name::from_units(v))
                    }

                    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                        i64::try_from(v)
                            .map($name::from_units)
                            .map_err(|_| E::custom("value out of range"))
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                        $name::parse(v).ok_or_else(|| E::custom("malformed decimal string"))
                    }
                }

                deserializer.deserialize_any(FixedVisitor)
            }
        }
    };
}

fixed_scalar!(Price, "Fixed-point price, tick-aligned at the book boundary.");
fixed_scalar!(Quantity, "Fixed-point quantity in 1e-8 units, never negative.");

impl Price {
    /// Round to the nearest tick multiple, ties away from zero.
    pub fn normalize_to_tick(self, tick: Price) -> Price {
        if tick.0 <= 0 {
            return self;
        }
        let rounded = round_div(self.0 as i128, tick.0 as i128) * tick.0 as i128;
        Price(rounded as i64)
    }

    /// Signed distance to `other`, expressed in whole ticks.
    pub fn ticks_from(self, other: Price, tick: Price) -> i64 {
        if tick.0 <= 0 {
            return 0;
        }
        round_div((self.0 - other.0) as i128, tick.0 as i128) as i64
    }

    #[inline]
    pub fn offset_ticks(self, ticks: i64, tick: Price) -> Price {
        Price(self.0.saturating_add(ticks.saturating_mul(tick.0)))
    }

    #[inline]
    pub fn abs_diff(self, other: Price) -> Price {
        Price((self.0 - other.0).abs())
    }
}

/// Midpoint of two prices, ties away from zero.
pub fn mid_price(bid: Price, ask: Price) -> Price {
    Price(round_div(bid.raw() as i128 + ask.raw() as i128, 2) as i64)
}

/// Exact fixed-decimal product of two quantities.
pub fn mul_quantities(a: Quantity, b: Quantity) -> Quantity {
    Quantity::from_raw(round_div(a.raw() as i128 * b.raw() as i128, SCALE_I128) as i64)
}

/// Fixed-decimal quotient; divide-by-zero yields zero, never NaN/Inf.
pub fn div_quantities(a: Quantity, b: Quantity) -> Quantity {
    if b.raw() == 0 {
        return Quantity::ZERO;
    }
    Quantity::from_raw(round_div(a.raw() as i128 * SCALE_I128, b.raw() as i128) as i64)
}

/// Notional = price * quantity, kept wide for accumulation (vwap numerators).
#[inline]
pub fn notional(price: Price, qty: Quantity) -> i128 {
    price.raw() as i128 * qty.raw() as i128
}

/// Volume-weighted price from an accumulated notional and total quantity.
/// Falls back to `fallback` when nothing has traded.
pub fn vwap_from_notional(notional_sum: i128, total_qty: Quantity, fallback: Price) -> Price {
    if total_qty.raw() <= 0 {
        return fallback;
    }
    Price::from_raw(round_div(notional_sum, total_qty.raw() as i128) as i64)
}

/// Scale a quantity by a dimensionless non-negative factor, rounding to the
/// nearest representable value. Degenerate factors leave the input unchanged.
pub fn scale_quantity(q: Quantity, factor: f64) -> Quantity {
    if !factor.is_finite() || factor < 0.0 {
        return q;
    }
    let scaled = q.raw() as f64 * factor;
    if scaled >= i64::MAX as f64 {
        return Quantity::from_raw(i64::MAX);
    }
    Quantity::from_raw(scaled.round() as i64)
}

/// Dimensionless ratio of two quantities; zero denominator yields 0.0.
pub fn ratio(num: Quantity, den: Quantity) -> f64 {
    if den.raw() <= 0 {
        return 0.0;
    }
    num.raw() as f64 / den.raw() as f64
}

/// Dimensionless ratio over two raw floats; any degenerate input yields 0.0.
pub fn safe_ratio(num: f64, den: f64) -> f64 {
    if !num.is_finite() || !den.is_finite() || den == 0.0 {
        return 0.0;
    }
    let r = num / den;
    if r.is_finite() {
        r
    } else {
        0.0
    }
}

/// Finite, non-negative and representable at the configured precision.
pub fn is_valid_price(v: f64) -> bool {
    v.is_finite() && v >= 0.0 && Price::from_f64(v).is_some()
}

pub fn is_valid_quantity(v: f64) -> bool {
    v.is_finite() && v >= 0.0 && Quantity::from_f64(v).is_some()
}

/// Arithmetic mean; `None` on an empty slice.
pub fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    Some(xs.iter().sum::<f64>() / xs.len() as f64)
}

/// Population standard deviation; `None` on an empty slice.
pub fn std_dev(xs: &[f64]) -> Option<f64> {
    let m = mean(xs)?;
    let var = xs.iter().map(|x| (x - m) * (x - m)).sum::<f64>() / xs.len() as f64;
    Some(var.sqrt())
}

/// Least-squares slope of `ys` against their index; `None` below two points.
pub fn linear_slope(ys: &[f64]) -> Option<f64> {
    let n = ys.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let x_mean = (n_f - 1.0) / 2.0;
    let y_mean = ys.iter().sum::<f64>() / n_f;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Price {
        Price::parse(s).unwrap()
    }

    fn q(s: &str) -> Quantity {
        Quantity::parse(s).unwrap()
    }

    #[test]
    fn parses_decimal_strings_exactly() {
        assert_eq!(p("89.01").raw(), 89_01_000_000);
        assert_eq!(p("0.00000001").raw(), 1);
        assert_eq!(p("-1.5").raw(), -150_000_000);
        assert_eq!(p("20").raw(), 20 * SCALE);
        assert_eq!(Price::parse(""), None);
        assert_eq!(Price::parse("abc"), None);
        assert_eq!(Price::parse("1.2.3"), None);
    }

    #[test]
    fn truncates_beyond_eight_decimals() {
        assert_eq!(p("0.123456789").raw(), 12_345_678);
    }

    #[test]
    fn normalize_rounds_to_nearest_tick_ties_away() {
        let tick = p("0.01");
        assert_eq!(p("89.014").normalize_to_tick(tick), p("89.01"));
        assert_eq!(p("89.016").normalize_to_tick(tick), p("89.02"));
        // Tie: 89.015 is exactly between 89.01 and 89.02.
        assert_eq!(p("89.015").normalize_to_tick(tick), p("89.02"));
        assert_eq!(p("-89.015").normalize_to_tick(tick), p("-89.02"));
    }

    #[test]
    fn division_by_zero_is_zero() {
        assert_eq!(div_quantities(q("5"), Quantity::ZERO), Quantity::ZERO);
        assert_eq!(ratio(q("5"), Quantity::ZERO), 0.0);
        assert_eq!(safe_ratio(1.0, 0.0), 0.0);
        assert_eq!(safe_ratio(f64::NAN, 2.0), 0.0);
    }

    #[test]
    fn quantity_products_are_exact() {
        assert_eq!(mul_quantities(q("1.5"), q("2")), q("3"));
        assert_eq!(div_quantities(q("3"), q("2")), q("1.5"));
        assert_eq!(div_quantities(q("1"), q("3")).raw(), 33_333_333);
    }

    #[test]
    fn vwap_falls_back_to_center_when_empty() {
        let center = p("86.80");
        assert_eq!(vwap_from_notional(0, Quantity::ZERO, center), center);

        let mut acc = 0i128;
        let mut total = Quantity::ZERO;
        for (px, qty) in [("100", "1"), ("102", "3")] {
            acc += notional(p(px), q(qty));
            total = total.saturating_add(q(qty));
        }
        assert_eq!(vwap_from_notional(acc, total, center), p("101.5"));
    }

    #[test]
    fn mean_and_std_dev_population() {
        assert_eq!(mean(&[]), None);
        assert_eq!(std_dev(&[]), None);
        assert_eq!(mean(&[2.0, 4.0]), Some(3.0));
        // Population std-dev of {2, 4} is 1, not sqrt(2).
        assert!((std_dev(&[2.0, 4.0]).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn slope_matches_hand_computed_line() {
        let ys: Vec<f64> = (0..10).map(|i| 3.0 + 2.0 * i as f64).collect();
        assert!((linear_slope(&ys).unwrap() - 2.0).abs() < 1e-12);
        assert_eq!(linear_slope(&[1.0]), None);
    }

    #[test]
    fn ticks_from_is_signed() {
        let tick = p("0.01");
        assert_eq!(p("89.03").ticks_from(p("89.01"), tick), 2);
        assert_eq!(p("88.99").ticks_from(p("89.01"), tick), -2);
    }

    #[test]
    fn validity_rejects_degenerate_floats() {
        assert!(is_valid_price(89.01));
        assert!(!is_valid_price(f64::NAN));
        assert!(!is_valid_price(f64::INFINITY));
        assert!(!is_valid_price(-1.0));
        assert!(!is_valid_quantity(-0.5));
    }
}
