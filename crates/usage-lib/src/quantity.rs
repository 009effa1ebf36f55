//! Kubernetes resource quantity parsing
//!
//! Converts quantity strings such as `512Mi`, `1.5Gi`, `250m` or `1e3` into
//! integer bytes or millicores. Arithmetic is exact decimal; fractional
//! results round up, the same way the API server's `Value()` and
//! `MilliValue()` accessors do.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),
    #[error("unknown suffix {suffix:?} in quantity {input:?}")]
    UnknownSuffix { input: String, suffix: String },
    #[error("negative quantity {0:?}")]
    Negative(String),
}

/// `mantissa × 10^exp10 × 1024^pow1024`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decimal {
    mantissa: u128,
    exp10: i32,
    pow1024: u32,
}

impl Decimal {
    fn parse(input: &str) -> Result<Self, QuantityError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(QuantityError::Empty);
        }

        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(split);

        if number.starts_with('-') {
            return Err(QuantityError::Negative(input.to_string()));
        }
        let number = number.strip_prefix('+').unwrap_or(number);

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty())
            || !all_digits(int_part)
            || !all_digits(frac_part)
        {
            return Err(QuantityError::InvalidNumber(input.to_string()));
        }

        let mantissa: u128 = format!("{int_part}{frac_part}")
            .parse()
            .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;
        let frac_digits = i32::try_from(frac_part.len())
            .map_err(|_| QuantityError::InvalidNumber(input.to_string()))?;

        let (exp10, pow1024) =
            suffix_scale(suffix).ok_or_else(|| QuantityError::UnknownSuffix {
                input: input.to_string(),
                suffix: suffix.to_string(),
            })?;

        let exp10 = exp10
            .checked_sub(frac_digits)
            .ok_or_else(|| QuantityError::InvalidNumber(input.to_string()))?;

        Ok(Self {
            mantissa,
            exp10,
            pow1024,
        })
    }

    /// Value scaled by `10^extra_exp10`, rounded up and saturated to u64
    fn ceil_scaled(&self, extra_exp10: i32) -> u64 {
        let exp = self.exp10.saturating_add(extra_exp10);
        let mut value = self
            .mantissa
            .saturating_mul(1024u128.saturating_pow(self.pow1024));

        if exp >= 0 {
            let factor = 10u128.checked_pow(exp.unsigned_abs()).unwrap_or(u128::MAX);
            value = value.saturating_mul(factor);
        } else {
            match 10u128.checked_pow(exp.unsigned_abs()) {
                Some(divisor) => {
                    value = value / divisor + u128::from(value % divisor != 0);
                }
                None => value = u128::from(value != 0),
            }
        }

        u64::try_from(value).unwrap_or(u64::MAX)
    }

}

/// Parse a memory quantity into whole bytes
pub fn to_bytes(input: &str) -> Result<u64, QuantityError> {
    Decimal::parse(input).map(|d| d.ceil_scaled(0))
}

/// Parse a CPU quantity into whole millicores
pub fn to_millicores(input: &str) -> Result<u64, QuantityError> {
    Decimal::parse(input).map(|d| d.ceil_scaled(3))
}

fn suffix_scale(suffix: &str) -> Option<(i32, u32)> {
    let scale = match suffix {
        "" => (0, 0),
        "n" => (-9, 0),
        "u" => (-6, 0),
        "m" => (-3, 0),
        "k" => (3, 0),
        "M" => (6, 0),
        "G" => (9, 0),
        "T" => (12, 0),
        "P" => (15, 0),
        "E" => (18, 0),
        "Ki" => (0, 1),
        "Mi" => (0, 2),
        "Gi" => (0, 3),
        "Ti" => (0, 4),
        "Pi" => (0, 5),
        "Ei" => (0, 6),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))?;
            (exponent.parse().ok()?, 0)
        }
    };
    Some(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_suffixes() {
        assert_eq!(to_bytes("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(to_bytes("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(to_bytes("1.5Gi").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(to_bytes("64Ki").unwrap(), 65536);
    }

    #[test]
    fn test_decimal_suffixes() {
        assert_eq!(to_bytes("128974848").unwrap(), 128_974_848);
        assert_eq!(to_bytes("129e6").unwrap(), 129_000_000);
        assert_eq!(to_bytes("129M").unwrap(), 129_000_000);
        assert_eq!(to_bytes("1k").unwrap(), 1000);
        assert_eq!(to_bytes("+2k").unwrap(), 2000);
    }

    #[test]
    fn test_cpu_millicores() {
        assert_eq!(to_millicores("500m").unwrap(), 500);
        assert_eq!(to_millicores("2").unwrap(), 2000);
        assert_eq!(to_millicores("0.25").unwrap(), 250);
        assert_eq!(to_millicores(".5").unwrap(), 500);
        assert_eq!(to_millicores("1.5").unwrap(), 1500);
        // metrics-server reports nanocores
        assert_eq!(to_millicores("250000000n").unwrap(), 250);
        assert_eq!(to_millicores("1500u").unwrap(), 2);
    }

    #[test]
    fn test_fractions_round_up() {
        assert_eq!(to_millicores("1n").unwrap(), 1);
        assert_eq!(to_bytes("1.5").unwrap(), 2);
        assert_eq!(to_bytes("0").unwrap(), 0);
    }

    #[test]
    fn test_saturates_instead_of_overflowing() {
        assert_eq!(to_bytes("100Ei").unwrap(), u64::MAX);
        assert_eq!(to_millicores("1e2147483647").unwrap(), u64::MAX);
        assert_eq!(to_bytes("1e-2147483648").unwrap(), 1);
    }

    #[test]
    fn test_exa_vs_exponent() {
        assert_eq!(to_bytes("1E").unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(to_bytes("1E3").unwrap(), 1000);
        assert_eq!(to_millicores("5e-3").unwrap(), 5);
    }

    #[test]
    fn test_invalid_quantities() {
        assert_eq!(to_bytes(""), Err(QuantityError::Empty));
        assert!(matches!(to_bytes("abc"), Err(QuantityError::InvalidNumber(_))));
        assert!(matches!(to_bytes("1.2.3"), Err(QuantityError::InvalidNumber(_))));
        assert!(matches!(
            to_bytes("12Xi"),
            Err(QuantityError::UnknownSuffix { .. })
        ));
        assert!(matches!(to_bytes("-1Gi"), Err(QuantityError::Negative(_))));
        // exponent underflows once the fraction digits are folded in
        assert!(matches!(
            to_bytes("1.5e-2147483648"),
            Err(QuantityError::InvalidNumber(_))
        ));
    }
}
