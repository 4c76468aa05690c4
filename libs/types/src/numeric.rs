//! Lenient numeric parsing for feed fields
//!
//! Uses rust_decimal for deterministic price arithmetic. Every parser here
//! returns `None` for empty or unparsable input: a bad field degrades the
//! record, it never rejects it.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Parse a decimal from plain or scientific notation.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

/// Parse a signed integer.
pub fn parse_i64(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<i64>().ok()
}

/// Decimal from a JSON number or numeric string.
pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s),
        _ => None,
    }
}

/// Integer from a JSON number (integral floats allowed) or numeric string.
pub fn i64_from_json(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => parse_i64(s),
        _ => None,
    }
}

/// Serde adapter: lenient `Option<Decimal>`.
pub fn lenient_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(decimal_from_json))
}

/// Serde adapter: lenient `Option<i64>`.
pub fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(i64_from_json))
}

/// Serde adapter: lenient `Option<u32>` (negative values are absent).
pub fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(i64_from_json)
        .and_then(|v| u32::try_from(v).ok()))
}

/// Serde adapter: lenient `Option<bool>` (accepts `true`/`false`, 0/1, "true"/"false").
pub fn lenient_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0),
        Some(Value::String(s)) => s.trim().parse::<bool>().ok(),
        _ => None,
    })
}

/// Serde adapter: lenient `Option<String>` (numbers are stringified).
pub fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_decimal_plain_and_scientific() {
        assert_eq!(
            parse_decimal("49032.72"),
            Some(Decimal::from_str("49032.72").unwrap())
        );
        assert_eq!(parse_decimal("1e3"), Some(Decimal::from(1000)));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("abc"), None);
    }

    #[test]
    fn test_parse_i64() {
        assert_eq!(parse_i64(" 5 "), Some(5));
        assert_eq!(parse_i64("-3"), Some(-3));
        assert_eq!(parse_i64("3.5"), None);
        assert_eq!(parse_i64(""), None);
    }

    #[test]
    fn test_decimal_from_json() {
        assert_eq!(
            decimal_from_json(&json!(12000.5)),
            Some(Decimal::from_str("12000.5").unwrap())
        );
        assert_eq!(decimal_from_json(&json!("0.01")), Some(Decimal::from_str("0.01").unwrap()));
        assert_eq!(decimal_from_json(&json!(null)), None);
        assert_eq!(decimal_from_json(&json!(true)), None);
    }

    #[test]
    fn test_i64_from_json() {
        assert_eq!(i64_from_json(&json!(560)), Some(560));
        assert_eq!(i64_from_json(&json!(2.0)), Some(2));
        assert_eq!(i64_from_json(&json!(2.5)), None);
        assert_eq!(i64_from_json(&json!("17")), Some(17));
    }
}
