//! 定点金额
//!
//! 所有金额/数量类度量统一使用 4 位小数的定点数表示，
//! 内部以 `i64` 原始单位存储 (1 元 = 10_000)。
//! 累加使用 checked 运算，溢出作为算术错误上抛，避免浮点累积误差。

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// 定点金额 (scale = 4)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

/// 金额解析错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount '{0}'")]
    Invalid(String),

    #[error("amount '{0}' has more than 4 fractional digits")]
    TooPrecise(String),

    #[error("amount '{0}' out of range")]
    OutOfRange(String),
}

impl Amount {
    /// 小数位数
    pub const DECIMALS: u32 = 4;
    /// 1 个整数单位对应的原始单位数
    pub const SCALE: i64 = 10_000;
    pub const ZERO: Amount = Amount(0);

    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// 整数单位 (元)
    pub fn from_units(units: i64) -> Self {
        Self(units.saturating_mul(Self::SCALE))
    }

    /// 分 (1/100 元)
    pub fn from_cents(cents: i64) -> Self {
        Self(cents.saturating_mul(Self::SCALE / 100))
    }

    /// 从浮点数四舍五入转换，超出范围或非有限值返回 None
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * Self::SCALE as f64).round();
        if scaled < i64::MIN as f64 || scaled > i64::MAX as f64 {
            return None;
        }
        Some(Self(scaled as i64))
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Amount {
    /// 至少保留 2 位小数，去掉多余的尾部 0
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let scale = Self::SCALE as u64;
        let int_part = abs / scale;
        let mut frac = format!("{:04}", abs % scale);
        while frac.len() > 2 && frac.ends_with('0') {
            frac.pop();
        }
        write!(f, "{}{}.{}", sign, int_part, frac)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };

        let (int_str, frac_str) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };

        if int_str.is_empty() && frac_str.is_empty() {
            return Err(AmountParseError::Invalid(s.to_string()));
        }
        if !int_str.chars().all(|c| c.is_ascii_digit())
            || !frac_str.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AmountParseError::Invalid(s.to_string()));
        }
        if frac_str.len() > Self::DECIMALS as usize {
            return Err(AmountParseError::TooPrecise(s.to_string()));
        }

        let int_value: i64 = if int_str.is_empty() {
            0
        } else {
            int_str
                .parse()
                .map_err(|_| AmountParseError::OutOfRange(s.to_string()))?
        };

        let mut frac_value: i64 = 0;
        if !frac_str.is_empty() {
            let padded = format!("{:0<4}", frac_str);
            frac_value = padded
                .parse()
                .map_err(|_| AmountParseError::Invalid(s.to_string()))?;
        }

        let raw = int_value
            .checked_mul(Self::SCALE)
            .and_then(|v| v.checked_add(frac_value))
            .ok_or_else(|| AmountParseError::OutOfRange(s.to_string()))?;

        Ok(Self(if negative { -raw } else { raw }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    /// 接受十进制字符串 ("12.50") 或整数单位 (12)
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl<'de> Visitor<'de> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal string or an integer amount")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                v.checked_mul(Amount::SCALE)
                    .map(Amount)
                    .ok_or_else(|| E::custom("amount out of range"))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                i64::try_from(v)
                    .map_err(|_| E::custom("amount out of range"))
                    .and_then(|v| self.visit_i64(v))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("5".parse::<Amount>().unwrap(), Amount::from_units(5));
        assert_eq!("12.5".parse::<Amount>().unwrap().raw(), 125_000);
        assert_eq!("-0.0001".parse::<Amount>().unwrap().raw(), -1);
        assert_eq!(Amount::from_units(44).to_string(), "44.00");
        assert_eq!(Amount::from_raw(12_345).to_string(), "1.2345");
        assert_eq!(Amount::from_raw(-5_000).to_string(), "-0.50");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Amount>(), Err(AmountParseError::Empty));
        assert!(matches!("1.23456".parse::<Amount>(), Err(AmountParseError::TooPrecise(_))));
        assert!(matches!("abc".parse::<Amount>(), Err(AmountParseError::Invalid(_))));
        assert!(matches!(
            "99999999999999999".parse::<Amount>(),
            Err(AmountParseError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_checked_add_overflow() {
        let max = Amount::from_raw(i64::MAX);
        assert!(max.checked_add(Amount::from_raw(1)).is_none());
        assert_eq!(
            Amount::from_cents(150).checked_add(Amount::from_cents(50)),
            Some(Amount::from_units(2))
        );
    }

    #[test]
    fn test_serde_forms() {
        let parsed: Amount = serde_json::from_str("\"3.20\"").unwrap();
        assert_eq!(parsed, Amount::from_cents(320));
        let parsed: Amount = serde_json::from_str("7").unwrap();
        assert_eq!(parsed, Amount::from_units(7));
        assert_eq!(serde_json::to_string(&Amount::from_cents(320)).unwrap(), "\"3.20\"");
    }
}
