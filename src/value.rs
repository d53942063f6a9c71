use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize, Serializer};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

const DATE_INPUT_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];

const DATETIME_INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const TRUE_LITERALS: &[&str] = &["true", "yes", "1"];
const FALSE_LITERALS: &[&str] = &["false", "no", "0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Text => "text",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::Date => "date",
            DataType::Datetime => "datetime",
        }
    }

    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "text" => Some(DataType::Text),
            "integer" => Some(DataType::Integer),
            "float" => Some(DataType::Float),
            "boolean" => Some(DataType::Boolean),
            "date" => Some(DataType::Date),
            "datetime" => Some(DataType::Datetime),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scalar as handed over by the file-parsing collaborator or a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        RawValue::Text(value.into())
    }

    /// Lossless-enough string rendering used for length checks and text columns.
    pub fn render(&self) -> Option<String> {
        match self {
            RawValue::Null => None,
            RawValue::Text(s) => Some(s.clone()),
            RawValue::Integer(i) => Some(i.to_string()),
            RawValue::Float(f) => Some(f.to_string()),
            RawValue::Boolean(b) => Some(b.to_string()),
        }
    }
}

impl From<&serde_json::Value> for RawValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => RawValue::Integer(i),
                None => RawValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => RawValue::Text(s.clone()),
            other => RawValue::Text(other.to_string()),
        }
    }
}

/// Typed cell value. Raw input is converted into this once, at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Date(d) => serde_json::Value::String(d.format(DATE_FORMAT).to_string()),
            Value::Datetime(dt) => serde_json::Value::String(format_datetime(dt)),
        }
    }

    /// Decodes a value read back from storage. Storage only ever holds values
    /// written through [`ParsePolicy::parse`], so a mismatch means corruption.
    pub fn from_stored(data_type: DataType, stored: &serde_json::Value) -> Option<Value> {
        if stored.is_null() {
            return Some(Value::Null);
        }
        match data_type {
            DataType::Text => match stored {
                serde_json::Value::String(s) => Some(Value::Text(s.clone())),
                other => Some(Value::Text(other.to_string())),
            },
            DataType::Integer => stored
                .as_i64()
                .or_else(|| stored.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .map(Value::Integer),
            DataType::Float => match stored {
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                other => other.as_f64(),
            }
            .map(Value::Float),
            DataType::Boolean => match stored {
                serde_json::Value::Bool(b) => Some(Value::Boolean(*b)),
                other => other.as_i64().map(|i| Value::Boolean(i != 0)),
            },
            DataType::Date => stored
                .as_str()
                .and_then(|s| NaiveDate::parse_from_str(s, DATE_FORMAT).ok())
                .map(Value::Date),
            DataType::Datetime => stored.as_str().and_then(parse_datetime).map(Value::Datetime),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Date(d) => serializer.serialize_str(&d.format(DATE_FORMAT).to_string()),
            Value::Datetime(dt) => serializer.serialize_str(&format_datetime(dt)),
        }
    }
}

pub fn format_datetime(dt: &NaiveDateTime) -> String {
    if dt.nanosecond() == 0 {
        dt.format("%Y-%m-%dT%H:%M:%S").to_string()
    } else {
        dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
    }
}

/// Inputs carrying an offset are normalized to UTC; datetimes are stored naive.
fn parse_datetime(input: &str) -> Option<NaiveDateTime> {
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(input) {
        return Some(with_offset.naive_utc());
    }
    DATETIME_INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
}

fn parse_date(input: &str) -> Option<NaiveDate> {
    DATE_INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(input, format).ok())
}

/// Parser strictness knobs shared by inference and write validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsePolicy {
    /// When false, numerals such as `007` are not numbers (identifiers, zip codes).
    pub allow_leading_zeros: bool,
    /// Accept `,` as the decimal separator (`19,99`).
    pub decimal_comma: bool,
}

impl Default for ParsePolicy {
    fn default() -> Self {
        Self {
            allow_leading_zeros: true,
            decimal_comma: false,
        }
    }
}

impl ParsePolicy {
    pub fn parse_bool(&self, raw: &RawValue) -> Option<bool> {
        match raw {
            RawValue::Boolean(b) => Some(*b),
            RawValue::Integer(1) => Some(true),
            RawValue::Integer(0) => Some(false),
            RawValue::Text(s) => {
                let lowered = s.trim().to_ascii_lowercase();
                if TRUE_LITERALS.contains(&lowered.as_str()) {
                    Some(true)
                } else if FALSE_LITERALS.contains(&lowered.as_str()) {
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Numeric parser shared by the integer and float candidates.
    pub fn parse_number(&self, raw: &RawValue) -> Option<f64> {
        match raw {
            RawValue::Integer(i) => Some(*i as f64),
            RawValue::Float(f) if f.is_finite() => Some(*f),
            RawValue::Text(s) => self.parse_numeric_text(s.trim()),
            _ => None,
        }
    }

    fn parse_numeric_text(&self, text: &str) -> Option<f64> {
        if text.is_empty() {
            return None;
        }
        let digits = text.trim_start_matches(['+', '-']);
        if !digits.starts_with(|c: char| c.is_ascii_digit() || c == '.' || c == ',') {
            // rejects inf, NaN and friends that str::parse would accept
            return None;
        }
        if !self.allow_leading_zeros
            && digits.len() > 1
            && digits.starts_with('0')
            && !digits[1..].starts_with(['.', ','])
        {
            return None;
        }
        let normalized = if self.decimal_comma {
            if text.contains('.') {
                return None;
            }
            text.replacen(',', ".", 1)
        } else {
            text.to_string()
        };
        normalized.parse::<f64>().ok().filter(|f| f.is_finite())
    }

    pub fn parse_integer(&self, raw: &RawValue) -> Option<i64> {
        if let RawValue::Integer(i) = raw {
            return Some(*i);
        }
        if let RawValue::Text(s) = raw {
            if let Ok(i) = s.trim().parse::<i64>() {
                if self.allow_leading_zeros || self.parse_number(raw).is_some() {
                    return Some(i);
                }
                return None;
            }
        }
        let number = self.parse_number(raw)?;
        if number.fract() != 0.0 || number < i64::MIN as f64 || number > i64::MAX as f64 {
            return None;
        }
        Some(number as i64)
    }

    pub fn parse_date(&self, raw: &RawValue) -> Option<NaiveDate> {
        match raw {
            RawValue::Text(s) => parse_date(s.trim()),
            _ => None,
        }
    }

    /// Datetimes require a time component; a bare date never parses here.
    pub fn parse_datetime(&self, raw: &RawValue) -> Option<NaiveDateTime> {
        match raw {
            RawValue::Text(s) => parse_datetime(s.trim()),
            _ => None,
        }
    }

    pub fn parse(&self, data_type: DataType, raw: &RawValue) -> Option<Value> {
        if matches!(raw, RawValue::Null) {
            return Some(Value::Null);
        }
        match data_type {
            DataType::Text => raw.render().map(Value::Text),
            DataType::Integer => self.parse_integer(raw).map(Value::Integer),
            DataType::Float => self.parse_number(raw).map(Value::Float),
            DataType::Boolean => self.parse_bool(raw).map(Value::Boolean),
            DataType::Date => self.parse_date(raw).map(Value::Date),
            DataType::Datetime => self.parse_datetime(raw).map(Value::Datetime),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawValue {
        RawValue::text(s)
    }

    #[test]
    fn boolean_literals_are_case_insensitive() {
        let policy = ParsePolicy::default();
        assert_eq!(policy.parse_bool(&text("TRUE")), Some(true));
        assert_eq!(policy.parse_bool(&text("No")), Some(false));
        assert_eq!(policy.parse_bool(&text("1")), Some(true));
        assert_eq!(policy.parse_bool(&text("maybe")), None);
    }

    #[test]
    fn numbers_reject_non_finite_words() {
        let policy = ParsePolicy::default();
        assert_eq!(policy.parse_number(&text("19.99")), Some(19.99));
        assert_eq!(policy.parse_number(&text("-3")), Some(-3.0));
        assert_eq!(policy.parse_number(&text("inf")), None);
        assert_eq!(policy.parse_number(&text("NaN")), None);
        assert_eq!(policy.parse_number(&text("12abc")), None);
    }

    #[test]
    fn integer_accepts_whole_floats_only() {
        let policy = ParsePolicy::default();
        assert_eq!(policy.parse_integer(&text("3")), Some(3));
        assert_eq!(policy.parse_integer(&text("3.0")), Some(3));
        assert_eq!(policy.parse_integer(&text("3.5")), None);
        assert_eq!(policy.parse_integer(&RawValue::Float(4.0)), Some(4));
    }

    #[test]
    fn leading_zero_policy() {
        let strict = ParsePolicy {
            allow_leading_zeros: false,
            ..ParsePolicy::default()
        };
        assert_eq!(strict.parse_integer(&text("007")), None);
        assert_eq!(strict.parse_number(&text("0.5")), Some(0.5));
        assert_eq!(strict.parse_integer(&text("0")), Some(0));
        assert_eq!(ParsePolicy::default().parse_integer(&text("007")), Some(7));
    }

    #[test]
    fn decimal_comma_policy() {
        let comma = ParsePolicy {
            decimal_comma: true,
            ..ParsePolicy::default()
        };
        assert_eq!(comma.parse_number(&text("19,99")), Some(19.99));
        assert_eq!(ParsePolicy::default().parse_number(&text("19,99")), None);
    }

    #[test]
    fn datetime_requires_time_component() {
        let policy = ParsePolicy::default();
        assert!(policy.parse_datetime(&text("2024-01-01")).is_none());
        assert!(policy.parse_datetime(&text("2024-01-01 10:30:00")).is_some());
        assert!(policy.parse_datetime(&text("2024-01-01T10:30:00Z")).is_some());
        assert!(policy.parse_date(&text("2024-01-01")).is_some());
        assert!(policy.parse_date(&text("2024-01-01 10:30:00")).is_none());
    }

    #[test]
    fn values_serialize_in_canonical_form() {
        let policy = ParsePolicy::default();
        let date = policy.parse(DataType::Date, &text("2024/02/03")).unwrap();
        assert_eq!(date.to_json(), serde_json::json!("2024-02-03"));
        let dt = policy
            .parse(DataType::Datetime, &text("2024-02-03 04:05:06"))
            .unwrap();
        assert_eq!(dt.to_json(), serde_json::json!("2024-02-03T04:05:06"));
        assert_eq!(
            Value::from_stored(DataType::Datetime, &dt.to_json()),
            Some(dt)
        );
    }

    #[test]
    fn stored_booleans_decode_from_integers() {
        assert_eq!(
            Value::from_stored(DataType::Boolean, &serde_json::json!(1)),
            Some(Value::Boolean(true))
        );
        assert_eq!(
            Value::from_stored(DataType::Float, &serde_json::json!(30)),
            Some(Value::Float(30.0))
        );
    }

    #[test]
    fn stored_reals_decode_from_full_precision_text() {
        assert_eq!(
            Value::from_stored(DataType::Float, &serde_json::json!("0.30000000000000004")),
            Some(Value::Float(0.1 + 0.2))
        );
        assert_eq!(
            Value::from_stored(DataType::Float, &serde_json::json!("19.989999999999998")),
            Some(Value::Float(19.99))
        );
        assert_eq!(Value::from_stored(DataType::Float, &serde_json::json!("abc")), None);
    }

    #[test]
    fn offsets_are_normalized_to_utc() {
        let policy = ParsePolicy::default();
        let shifted = policy.parse_datetime(&text("2024-02-03T10:00:00+02:00")).unwrap();
        let utc = policy.parse_datetime(&text("2024-02-03T08:00:00Z")).unwrap();
        assert_eq!(shifted, utc);
        assert_eq!(format_datetime(&shifted), "2024-02-03T08:00:00");
    }
}
