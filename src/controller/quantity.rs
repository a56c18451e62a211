//! Kubernetes resource quantity parsing
//!
//! `k8s-openapi` carries quantities as opaque strings. The eligibility
//! heuristic needs their numeric values, so this module implements the
//! quantity grammar (`<signed number><suffix>`) with the same rounding the
//! API machinery applies: values are rounded up to the requested scale.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

/// Exact rational value of a quantity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedQuantity {
    numerator: i128,
    denominator: i128,
}

impl ParsedQuantity {
    /// Value in thousandths (e.g. CPU millicores), rounded up
    pub fn milli_value(&self) -> Option<i64> {
        let scaled = self.numerator.checked_mul(1000)?;
        i64::try_from(ceil_div(scaled, self.denominator)).ok()
    }

    /// Integer value (e.g. memory bytes), rounded up
    pub fn value(&self) -> Option<i64> {
        i64::try_from(ceil_div(self.numerator, self.denominator)).ok()
    }
}

/// Parse a quantity, returning `None` when it does not follow the grammar.
pub fn parse_quantity(quantity: &Quantity) -> Option<ParsedQuantity> {
    parse_str(quantity.0.trim())
}

fn parse_str(raw: &str) -> Option<ParsedQuantity> {
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);

    let (negative, digits) = match number.as_bytes().first()? {
        b'-' => (true, &number[1..]),
        b'+' => (false, &number[1..]),
        _ => (false, number),
    };

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.bytes().all(|b| b.is_ascii_digit()) || !fraction.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    // Keeps the arithmetic below well inside i128
    if whole.len() + fraction.len() > 30 {
        return None;
    }

    let mut numerator: i128 = 0;
    for b in whole.bytes().chain(fraction.bytes()) {
        numerator = numerator * 10 + i128::from(b - b'0');
    }
    let mut denominator = pow10(fraction.len() as u32)?;

    let (mult, div) = suffix_scale(suffix)?;
    numerator = numerator.checked_mul(mult)?;
    denominator = denominator.checked_mul(div)?;

    if negative {
        numerator = -numerator;
    }

    Some(ParsedQuantity {
        numerator,
        denominator,
    })
}

/// Returns `(multiplier, divisor)` for a quantity suffix
fn suffix_scale(suffix: &str) -> Option<(i128, i128)> {
    let scale = match suffix {
        "" => (1, 1),
        "n" => (1, 1_000_000_000),
        "u" => (1, 1_000_000),
        "m" => (1, 1_000),
        "k" => (1_000, 1),
        "M" => (1_000_000, 1),
        "G" => (1_000_000_000, 1),
        "T" => (pow10(12)?, 1),
        "P" => (pow10(15)?, 1),
        "E" => (pow10(18)?, 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?
                .parse::<i32>()
                .ok()?;
            if exponent.unsigned_abs() > 30 {
                return None;
            }
            if exponent >= 0 {
                (pow10(exponent as u32)?, 1)
            } else {
                (1, pow10(exponent.unsigned_abs())?)
            }
        }
    };
    Some(scale)
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

fn ceil_div(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    if numerator % denominator > 0 {
        quotient + 1
    } else {
        quotient
    }
}
