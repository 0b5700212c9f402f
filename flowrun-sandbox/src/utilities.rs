//! Pure helpers exposed to flow scripts through `context.utils`
//!
//! Nothing in here touches the host: no I/O, no clocks other than "now",
//! no process state. Each helper is wrapped by a worker op.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use fake::faker::address::en::ZipCode;
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::{FirstName, LastName};
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use rand::Rng;
use serde_json::{json, Map, Value};
use serde_json_path::JsonPath;
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum UtilityError {
    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("unknown date unit: {0}")]
    UnknownUnit(String),

    #[error("invalid date format: {0}")]
    InvalidFormat(String),

    #[error("date arithmetic out of range")]
    OutOfRange,

    #[error("invalid JSON path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("unknown fake data kind: {0}")]
    UnknownFakeKind(String),

    #[error("invalid XML: {0}")]
    Xml(String),
}

// ---------------------------------------------------------------------------
// Dates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl DateUnit {
    fn seconds(self) -> Option<i64> {
        match self {
            DateUnit::Seconds => Some(1),
            DateUnit::Minutes => Some(60),
            DateUnit::Hours => Some(3_600),
            DateUnit::Days => Some(86_400),
            DateUnit::Weeks => Some(604_800),
            DateUnit::Months | DateUnit::Years => None,
        }
    }
}

impl FromStr for DateUnit {
    type Err = UtilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = s.trim().to_lowercase();
        let unit = unit.strip_suffix('s').unwrap_or(&unit);
        match unit {
            "second" | "sec" => Ok(DateUnit::Seconds),
            "minute" | "min" => Ok(DateUnit::Minutes),
            "hour" => Ok(DateUnit::Hours),
            "day" => Ok(DateUnit::Days),
            "week" => Ok(DateUnit::Weeks),
            "month" => Ok(DateUnit::Months),
            "year" => Ok(DateUnit::Years),
            _ => Err(UtilityError::UnknownUnit(s.to_string())),
        }
    }
}

/// Interpret a script-supplied date.
///
/// `null` means now, numbers are epoch milliseconds, strings may be RFC 3339,
/// `YYYY-MM-DD[ T]HH:MM:SS`, `YYYY-MM-DD` or `MM/DD/YYYY` (naive forms are UTC).
pub fn parse_instant(input: &Value) -> Result<DateTime<Utc>, UtilityError> {
    match input {
        Value::Null => Ok(Utc::now()),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| UtilityError::InvalidDate(n.to_string())),
        Value::String(raw) => parse_date_str(raw.trim()),
        other => Err(UtilityError::InvalidDate(other.to_string())),
    }
}

fn parse_date_str(raw: &str) -> Result<DateTime<Utc>, UtilityError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Ok(naive.and_utc());
        }
    }
    for pattern in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, pattern) {
            if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
                return Ok(midnight.and_utc());
            }
        }
    }
    Err(UtilityError::InvalidDate(raw.to_string()))
}

/// Format a date with a strftime pattern; RFC 3339 with milliseconds when
/// no pattern is given.
pub fn format_date(input: &Value, format: Option<&str>) -> Result<String, UtilityError> {
    let instant = parse_instant(input)?;
    match format {
        None => Ok(instant.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Some(pattern) => {
            let mut out = String::new();
            write!(out, "{}", instant.format(pattern))
                .map_err(|_| UtilityError::InvalidFormat(pattern.to_string()))?;
            Ok(out)
        }
    }
}

pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn add_to_date(input: &Value, amount: i64, unit: DateUnit) -> Result<DateTime<Utc>, UtilityError> {
    let instant = parse_instant(input)?;
    match unit {
        DateUnit::Months => shift_months(instant, amount),
        DateUnit::Years => shift_months(instant, amount.checked_mul(12).ok_or(UtilityError::OutOfRange)?),
        fixed => {
            let per_unit = fixed.seconds().ok_or(UtilityError::OutOfRange)?;
            let secs = amount.checked_mul(per_unit).ok_or(UtilityError::OutOfRange)?;
            let delta = TimeDelta::try_seconds(secs).ok_or(UtilityError::OutOfRange)?;
            instant.checked_add_signed(delta).ok_or(UtilityError::OutOfRange)
        }
    }
}

fn shift_months(instant: DateTime<Utc>, months: i64) -> Result<DateTime<Utc>, UtilityError> {
    let magnitude = u32::try_from(months.unsigned_abs()).map_err(|_| UtilityError::OutOfRange)?;
    let shifted = if months >= 0 {
        instant.checked_add_months(Months::new(magnitude))
    } else {
        instant.checked_sub_months(Months::new(magnitude))
    };
    shifted.ok_or(UtilityError::OutOfRange)
}

/// Whole units from `from` to `to`, truncated toward zero.
pub fn date_diff(from: &Value, to: &Value, unit: DateUnit) -> Result<i64, UtilityError> {
    let start = parse_instant(from)?;
    let end = parse_instant(to)?;
    match unit {
        DateUnit::Months => months_between(start, end),
        DateUnit::Years => Ok(months_between(start, end)? / 12),
        fixed => {
            let per_unit = fixed.seconds().ok_or(UtilityError::OutOfRange)?;
            Ok((end - start).num_seconds() / per_unit)
        }
    }
}

fn months_between(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64, UtilityError> {
    let mut months = i64::from(end.year() - start.year()) * 12
        + (i64::from(end.month()) - i64::from(start.month()));
    let landed = shift_months(start, months)?;
    if months > 0 && landed > end {
        months -= 1;
    } else if months < 0 && landed < end {
        months += 1;
    }
    Ok(months)
}

// ---------------------------------------------------------------------------
// JSON path
// ---------------------------------------------------------------------------

/// Evaluate an RFC 9535 JSON path and return every match in document order.
///
/// A path without the leading `$` is taken relative to the root, so
/// `encounter.id` means `$.encounter.id`.
pub fn json_path(document: &Value, path: &str) -> Result<Vec<Value>, UtilityError> {
    let trimmed = path.trim();
    let normalized = if trimmed.starts_with('$') {
        trimmed.to_string()
    } else if trimmed.starts_with('[') {
        format!("${}", trimmed)
    } else {
        format!("$.{}", trimmed)
    };

    let query = JsonPath::parse(&normalized).map_err(|e| UtilityError::InvalidPath {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    Ok(query.query(document).all().into_iter().cloned().collect())
}

// ---------------------------------------------------------------------------
// Fake data
// ---------------------------------------------------------------------------

/// Generate fake data of the named kind using the thread RNG.
pub fn fake(kind: &str, options: &Value) -> Result<Value, UtilityError> {
    fake_with(&mut rand::thread_rng(), kind, options)
}

/// Same as [`fake`] with a caller-supplied RNG.
pub fn fake_with<R: Rng + ?Sized>(rng: &mut R, kind: &str, options: &Value) -> Result<Value, UtilityError> {
    let value = match kind {
        "uuid" => json!(uuid::Uuid::new_v4().to_string()),
        "firstName" => json!(FirstName().fake_with_rng::<String, _>(rng)),
        "lastName" => json!(LastName().fake_with_rng::<String, _>(rng)),
        "fullName" => {
            let first: String = FirstName().fake_with_rng(rng);
            let last: String = LastName().fake_with_rng(rng);
            json!(format!("{} {}", first, last))
        }
        "email" => json!(SafeEmail().fake_with_rng::<String, _>(rng)),
        "phone" => json!(PhoneNumber().fake_with_rng::<String, _>(rng)),
        "zipCode" => json!(ZipCode().fake_with_rng::<String, _>(rng)),
        "boolean" => json!(rng.gen_bool(0.5)),
        "integer" => {
            let min = options.get("min").and_then(Value::as_i64).unwrap_or(0);
            let max = options.get("max").and_then(Value::as_i64).unwrap_or(1_000);
            let (low, high) = if min <= max { (min, max) } else { (max, min) };
            json!(rng.gen_range(low..=high))
        }
        "date" => {
            let days = options.get("days").and_then(Value::as_i64).unwrap_or(365).max(0);
            let back = TimeDelta::try_days(rng.gen_range(0..=days)).ok_or(UtilityError::OutOfRange)?;
            let date = Utc::now()
                .date_naive()
                .checked_sub_signed(back)
                .ok_or(UtilityError::OutOfRange)?;
            json!(date.format("%Y-%m-%d").to_string())
        }
        other => return Err(UtilityError::UnknownFakeKind(other.to_string())),
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

/// Parse XML into JSON shaped like xml2js defaults: `{ root: node }`, where a
/// node with only text is a string, attributes live under `"$"`, text next
/// to children or attributes lives under `"_"`, and every child element is an
/// array.
pub fn parse_xml(text: &str) -> Result<Value, UtilityError> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<(String, Element)> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| UtilityError::Xml(format!("at byte {}: {}", reader.buffer_position(), e)))?;
        match event {
            Event::Start(start) => stack.push(open_element(&start)?),
            Event::Empty(start) => {
                let (name, element) = open_element(&start)?;
                close_element(&mut stack, &mut root, name, element)?;
            }
            Event::End(_) => {
                let (name, element) = stack
                    .pop()
                    .ok_or_else(|| UtilityError::Xml("unbalanced closing tag".to_string()))?;
                close_element(&mut stack, &mut root, name, element)?;
            }
            Event::Text(content) => {
                let unescaped = content.unescape().map_err(|e| UtilityError::Xml(e.to_string()))?;
                if let Some((_, element)) = stack.last_mut() {
                    element.text.push_str(&unescaped);
                }
            }
            Event::CData(content) => {
                if let Some((_, element)) = stack.last_mut() {
                    element.text.push_str(&String::from_utf8_lossy(&content.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(UtilityError::Xml("unclosed element".to_string()));
    }
    let (name, value) = root.ok_or_else(|| UtilityError::Xml("document has no root element".to_string()))?;
    let mut document = Map::new();
    document.insert(name, value);
    Ok(Value::Object(document))
}

#[derive(Default)]
struct Element {
    attributes: Map<String, Value>,
    children: Map<String, Value>,
    text: String,
}

impl Element {
    fn into_value(self) -> Value {
        if self.attributes.is_empty() && self.children.is_empty() {
            return Value::String(self.text);
        }
        let mut node = Map::new();
        if !self.attributes.is_empty() {
            node.insert("$".to_string(), Value::Object(self.attributes));
        }
        if !self.text.is_empty() {
            node.insert("_".to_string(), Value::String(self.text));
        }
        node.extend(self.children);
        Value::Object(node)
    }
}

fn open_element(start: &BytesStart<'_>) -> Result<(String, Element), UtilityError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut element = Element::default();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| UtilityError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| UtilityError::Xml(e.to_string()))?;
        element.attributes.insert(key, Value::String(value.into_owned()));
    }
    Ok((name, element))
}

fn close_element(
    stack: &mut [(String, Element)],
    root: &mut Option<(String, Value)>,
    name: String,
    element: Element,
) -> Result<(), UtilityError> {
    let value = element.into_value();
    match stack.last_mut() {
        Some((_, parent)) => {
            let slot = parent
                .children
                .entry(name)
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = slot {
                items.push(value);
            }
            Ok(())
        }
        None if root.is_none() => {
            *root = Some((name, value));
            Ok(())
        }
        None => Err(UtilityError::Xml("multiple root elements".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_date_parsing_forms() {
        let expected = "2024-03-01T00:00:00.000Z";
        for input in ["2024-03-01", "03/01/2024", "2024-03-01T00:00:00Z", "2024-03-01 00:00:00"] {
            assert_eq!(format_date(&json!(input), None).unwrap(), expected, "{input}");
        }
        assert_eq!(
            format_date(&json!(1_709_251_200_000i64), None).unwrap(),
            expected
        );
        assert!(matches!(
            parse_instant(&json!("yesterday-ish")),
            Err(UtilityError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_format_with_pattern() {
        let formatted = format_date(&json!("2024-07-04T15:30:00Z"), Some("%m/%d/%Y %H:%M")).unwrap();
        assert_eq!(formatted, "07/04/2024 15:30");
    }

    #[test]
    fn test_add_months_clamps_to_month_end() {
        let shifted = add_to_date(&json!("2024-01-31"), 1, DateUnit::Months).unwrap();
        assert_eq!(shifted.format("%Y-%m-%d").to_string(), "2024-02-29");

        let back = add_to_date(&json!("2024-03-10"), -2, "weeks".parse().unwrap()).unwrap();
        assert_eq!(back.format("%Y-%m-%d").to_string(), "2024-02-25");
    }

    #[test]
    fn test_date_diff_units() {
        let a = json!("2023-01-15");
        let b = json!("2024-03-14");
        assert_eq!(date_diff(&a, &b, DateUnit::Months).unwrap(), 13);
        assert_eq!(date_diff(&a, &b, DateUnit::Years).unwrap(), 1);
        assert_eq!(date_diff(&b, &a, DateUnit::Days).unwrap(), -424);
        assert_eq!("fortnight".parse::<DateUnit>(), Err(UtilityError::UnknownUnit("fortnight".into())));
    }

    #[test]
    fn test_json_path_queries() {
        let doc = json!({
            "encounter": {
                "id": "e-1",
                "procedures": [
                    { "code": "99213", "modifiers": ["25"] },
                    { "code": "93000", "id": "p-2" }
                ]
            },
            "odd key": { "id": "o-1" }
        });

        assert_eq!(json_path(&doc, "$.encounter.id").unwrap(), vec![json!("e-1")]);
        assert_eq!(
            json_path(&doc, "$.encounter.procedures[*].code").unwrap(),
            vec![json!("99213"), json!("93000")]
        );
        assert_eq!(
            json_path(&doc, "$.encounter.procedures[-1].code").unwrap(),
            vec![json!("93000")]
        );
        let mut ids = json_path(&doc, "$..id").unwrap();
        ids.sort_by_key(|v| v.to_string());
        assert_eq!(ids, vec![json!("e-1"), json!("o-1"), json!("p-2")]);
        assert_eq!(json_path(&doc, "$['odd key'].id").unwrap(), vec![json!("o-1")]);
        assert_eq!(json_path(&doc, "encounter.id").unwrap(), vec![json!("e-1")]);
        assert!(json_path(&doc, "$.missing.deeper").unwrap().is_empty());
        assert_matches!(json_path(&doc, "$.encounter["), Err(UtilityError::InvalidPath { .. }));
    }

    #[test]
    fn test_json_path_filters_slices_and_unions() {
        let doc = json!({
            "lines": [
                { "code": "A", "units": 1 },
                { "code": "B", "units": 4 },
                { "code": "C", "units": 2 }
            ],
            "a]b": "bracketed"
        });

        assert_eq!(
            json_path(&doc, "$.lines[?@.units > 1].code").unwrap(),
            vec![json!("B"), json!("C")]
        );
        assert_eq!(
            json_path(&doc, "$.lines[0:2].code").unwrap(),
            vec![json!("A"), json!("B")]
        );
        assert_eq!(
            json_path(&doc, "$.lines[0,2].code").unwrap(),
            vec![json!("A"), json!("C")]
        );
        assert_eq!(json_path(&doc, "$['a]b']").unwrap(), vec![json!("bracketed")]);
    }

    #[test]
    fn test_fake_data_kinds() {
        let mut rng = StdRng::seed_from_u64(7);
        let number = fake_with(&mut rng, "integer", &json!({ "min": 5, "max": 9 })).unwrap();
        let number = number.as_i64().unwrap();
        assert!((5..=9).contains(&number));

        let email = fake_with(&mut rng, "email", &Value::Null).unwrap();
        assert!(email.as_str().unwrap().contains('@'));

        let full = fake_with(&mut rng, "fullName", &Value::Null).unwrap();
        assert!(full.as_str().unwrap().contains(' '));

        let zip = fake_with(&mut rng, "zipCode", &Value::Null).unwrap();
        assert!(!zip.as_str().unwrap().is_empty());

        let date = fake_with(&mut rng, "date", &json!({ "days": 0 })).unwrap();
        assert_eq!(date, json!(Utc::now().date_naive().format("%Y-%m-%d").to_string()));

        assert_eq!(
            fake_with(&mut rng, "ssn", &Value::Null),
            Err(UtilityError::UnknownFakeKind("ssn".into()))
        );
    }

    #[test]
    fn test_parse_xml_shape() {
        let doc = parse_xml(
            r#"<?xml version="1.0"?>
            <claim id="c-9">
                <patient>Jane &amp; Co</patient>
                <line code="99213"/>
                <line code="93000">ECG</line>
                <note><![CDATA[<raw>]]></note>
            </claim>"#,
        )
        .unwrap();

        assert_eq!(
            doc,
            json!({
                "claim": {
                    "$": { "id": "c-9" },
                    "patient": ["Jane & Co"],
                    "line": [
                        { "$": { "code": "99213" } },
                        { "$": { "code": "93000" }, "_": "ECG" }
                    ],
                    "note": ["<raw>"]
                }
            })
        );
    }

    #[test]
    fn test_parse_xml_rejects_broken_documents() {
        assert!(parse_xml("<a><b></a>").is_err());
        assert!(parse_xml("").is_err());
        assert!(parse_xml("<a/><b/>").is_err());
    }
}
