/*
Copyright 2024-2025 The Spice.ai OSS Authors

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

     https://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The SQL-fragment filter suite.
//!
//! Every filter is a pure function over a wrapped criterion value. Comparison
//! filters synthesize `NAME OP value` using the wrapper's bound name unless an
//! explicit field name argument overrides it; with neither, the fragment is
//! emitted without a left operand. Empty values (absent, blank string, empty
//! list) short-circuit to the empty string so template authors can chain
//! optional criteria.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use minijinja::value::Value;

use crate::value::{SqlValue, SqlWrapper};

/// Splits a template value into its underlying [`SqlValue`] and the field
/// name to use: the explicit argument wins over the wrapper's bound name.
fn resolve(value: &Value, field: Option<String>) -> (SqlValue, Option<String>) {
    if let Some(wrapper) = value.downcast_object_ref::<SqlWrapper>() {
        (wrapper.value.clone(), field.or_else(|| wrapper.name.clone()))
    } else {
        (SqlValue::from_template_value(value), field)
    }
}

/// `None`/blank → `None`; numerics raw; strings quoted. Booleans take the
/// numeric path and keep their capitalized `True`/`False` rendering; only the
/// `sql` filter maps them to `1`/`0`.
fn format_scalar(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Null => None,
        SqlValue::Str(s) if s.is_empty() => None,
        SqlValue::Bool(b) => Some(if *b { "True".into() } else { "False".into() }),
        SqlValue::Int(i) => Some(i.to_string()),
        SqlValue::Float(f) => Some(f.to_string()),
        SqlValue::Str(s) => Some(format!("'{s}'")),
        SqlValue::List(_) | SqlValue::Range { .. } => None,
    }
}

fn quote_element(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::Str(s) => format!("'{s}'"),
        other => format!("'{other}'"),
    }
}

fn join_elements(items: &[SqlValue]) -> String {
    items
        .iter()
        .map(quote_element)
        .collect::<Vec<_>>()
        .join(", ")
}

fn with_field(field: Option<&str>, fragment: &str) -> String {
    match field {
        Some(f) => format!("{f} {fragment}"),
        None => fragment.to_string(),
    }
}

/// `quote`: value rendered as a bare SQL literal; lists comma-joined.
pub fn filter_quote(value: Value) -> String {
    let (v, _) = resolve(&value, None);
    match &v {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::List(items) => join_elements(items),
        SqlValue::Str(s) => format!("'{s}'"),
        other => format_scalar(other).unwrap_or_else(|| "NULL".to_string()),
    }
}

/// `sql`: as `quote` but empty → `NULL`, booleans → `1`/`0`, lists parenthesized.
pub fn filter_sql(value: Value) -> String {
    let (v, _) = resolve(&value, None);
    match &v {
        SqlValue::Null => "NULL".to_string(),
        SqlValue::Str(s) if s.is_empty() => "NULL".to_string(),
        SqlValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        SqlValue::List(items) if items.is_empty() => "NULL".to_string(),
        SqlValue::List(items) => format!("({})", join_elements(items)),
        SqlValue::Str(s) => format!("'{s}'"),
        other => format_scalar(other).unwrap_or_else(|| "NULL".to_string()),
    }
}

fn comparison(value: &Value, field: Option<String>, op: &str) -> String {
    let (v, f) = resolve(value, field);
    if v.is_empty() {
        return String::new();
    }
    match format_scalar(&v) {
        Some(formatted) => with_field(f.as_deref(), &format!("{op} {formatted}")),
        None => String::new(),
    }
}

/// `eq`: scalar → `F = v`, list → `F IN (...)`.
pub fn filter_eq(value: Value, field: Option<String>) -> String {
    let (v, f) = resolve(&value, field);
    if v.is_empty() {
        return String::new();
    }
    match &v {
        SqlValue::List(items) => {
            with_field(f.as_deref(), &format!("IN ({})", join_elements(items)))
        }
        other => match format_scalar(other) {
            Some(formatted) => with_field(f.as_deref(), &format!("= {formatted}")),
            None => String::new(),
        },
    }
}

/// `ne`: scalar → `F <> v`, list → `F NOT IN (...)`.
pub fn filter_ne(value: Value, field: Option<String>) -> String {
    let (v, f) = resolve(&value, field);
    if v.is_empty() {
        return String::new();
    }
    match &v {
        SqlValue::List(items) => {
            with_field(f.as_deref(), &format!("NOT IN ({})", join_elements(items)))
        }
        other => match format_scalar(other) {
            Some(formatted) => with_field(f.as_deref(), &format!("<> {formatted}")),
            None => String::new(),
        },
    }
}

pub fn filter_gt(value: Value, field: Option<String>) -> String {
    comparison(&value, field, ">")
}

pub fn filter_lt(value: Value, field: Option<String>) -> String {
    comparison(&value, field, "<")
}

pub fn filter_gte(value: Value, field: Option<String>) -> String {
    comparison(&value, field, ">=")
}

pub fn filter_lte(value: Value, field: Option<String>) -> String {
    comparison(&value, field, "<=")
}

/// `like`: `F LIKE '%v%'`.
pub fn filter_like(value: Value, field: Option<String>) -> String {
    let (v, f) = resolve(&value, field);
    if v.is_empty() {
        return String::new();
    }
    match &v {
        SqlValue::List(_) | SqlValue::Range { .. } => String::new(),
        other => with_field(f.as_deref(), &format!("LIKE '%{other}%'")),
    }
}

/// `between`: range → `F BETWEEN start AND end`; a missing side renders `NULL`.
pub fn filter_between(value: Value, field: Option<String>) -> String {
    let (v, f) = resolve(&value, field);
    let SqlValue::Range { start, end } = &v else {
        return String::new();
    };
    if start.is_none() && end.is_none() {
        return String::new();
    }
    let side = |v: &Option<Box<SqlValue>>| {
        v.as_deref()
            .and_then(format_scalar)
            .unwrap_or_else(|| "NULL".to_string())
    };
    with_field(
        f.as_deref(),
        &format!("BETWEEN {} AND {}", side(start), side(end)),
    )
}

/// `start` (alias `begin`): the range's start side; non-ranges pass through.
pub fn filter_start(value: Value) -> Value {
    let (v, _) = resolve(&value, None);
    match &v {
        SqlValue::Range { start, .. } => start
            .as_ref()
            .map(|s| s.to_minijinja())
            .unwrap_or_else(|| Value::from(())),
        other => other.to_minijinja(),
    }
}

/// `end` (alias `finish`): the range's end side; non-ranges pass through.
pub fn filter_end(value: Value) -> Value {
    let (v, _) = resolve(&value, None);
    match &v {
        SqlValue::Range { end, .. } => end
            .as_ref()
            .map(|e| e.to_minijinja())
            .unwrap_or_else(|| Value::from(())),
        other => other.to_minijinja(),
    }
}

/// `add_days(n)`: shifts `YYYYMMDD` values, best-effort ISO-8601 otherwise.
/// Values that parse as neither are returned unchanged.
pub fn filter_add_days(value: Value, days: i64) -> Value {
    let (v, _) = resolve(&value, None);
    let text = match &v {
        SqlValue::Null => return value,
        SqlValue::Str(s) if s.is_empty() => return value,
        other => other.to_string(),
    };

    match parse_loose_date(&text) {
        Some(date) => match date.checked_add_signed(Duration::days(days)) {
            Some(shifted) => Value::from(shifted.format("%Y%m%d").to_string()),
            None => value,
        },
        None => value,
    }
}

fn parse_loose_date(text: &str) -> Option<NaiveDate> {
    if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        return NaiveDate::parse_from_str(text, "%Y%m%d").ok();
    }
    let normalized = text.replace('Z', "+00:00");
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt.date());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

/// Registers the whole suite under canonical names and documented aliases.
pub fn register(env: &mut minijinja::Environment<'_>) {
    env.add_filter("quote", filter_quote);
    env.add_filter("sql", filter_sql);
    env.add_filter("eq", filter_eq);
    env.add_filter("ne", filter_ne);
    env.add_filter("gt", filter_gt);
    env.add_filter("lt", filter_lt);
    env.add_filter("gte", filter_gte);
    env.add_filter("ge", filter_gte);
    env.add_filter("lte", filter_lte);
    env.add_filter("le", filter_lte);
    env.add_filter("like", filter_like);
    env.add_filter("between", filter_between);
    env.add_filter("start", filter_start);
    env.add_filter("begin", filter_start);
    env.add_filter("end", filter_end);
    env.add_filter("finish", filter_end);
    env.add_filter("add_days", filter_add_days);
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;

    fn wrapped(json: serde_json::Value, name: &str) -> Value {
        let env = Environment::new();
        Value::from_object(SqlWrapper::new(&json, name, &env, "20240115"))
    }

    #[test]
    fn eq_scalar_and_list() {
        assert_eq!(filter_eq(wrapped(serde_json::json!(101), "ID"), None), "ID = 101");
        assert_eq!(
            filter_eq(wrapped(serde_json::json!(["a", "b"]), "STATE"), None),
            "STATE IN ('a', 'b')"
        );
        assert_eq!(
            filter_eq(wrapped(serde_json::json!("x"), "A"), Some("B".into())),
            "B = 'x'"
        );
    }

    #[test]
    fn empty_values_short_circuit() {
        for json in [
            serde_json::json!(null),
            serde_json::json!(""),
            serde_json::json!([]),
        ] {
            assert_eq!(filter_eq(wrapped(json.clone(), "F"), None), "");
            assert_eq!(filter_ne(wrapped(json.clone(), "F"), None), "");
            assert_eq!(filter_gt(wrapped(json.clone(), "F"), None), "");
            assert_eq!(filter_like(wrapped(json, "F"), None), "");
        }
    }

    #[test]
    fn eq_matches_quote_for_scalars() {
        let value = wrapped(serde_json::json!("ankara"), "CITY");
        let quoted = filter_quote(value.clone());
        assert_eq!(filter_eq(value, None), format!("CITY = {quoted}"));
    }

    #[test]
    fn missing_field_omits_left_operand() {
        let env = Environment::new();
        let anonymous = Value::from_object(SqlWrapper {
            value: SqlValue::Str("x".into()),
            name: None,
        });
        let _ = env;
        assert_eq!(filter_eq(anonymous, None), "= 'x'");
    }

    #[test]
    fn quote_keeps_capitalized_booleans() {
        assert_eq!(filter_quote(wrapped(serde_json::json!(true), "F")), "True");
        assert_eq!(filter_quote(wrapped(serde_json::json!(false), "F")), "False");
        assert_eq!(
            filter_eq(wrapped(serde_json::json!(true), "ACTIVE"), None),
            "ACTIVE = True"
        );
    }

    #[test]
    fn sql_filter_semantics() {
        assert_eq!(filter_sql(wrapped(serde_json::json!(true), "F")), "1");
        assert_eq!(filter_sql(wrapped(serde_json::json!(false), "F")), "0");
        assert_eq!(filter_sql(wrapped(serde_json::json!(""), "F")), "NULL");
        assert_eq!(filter_sql(wrapped(serde_json::json!([]), "F")), "NULL");
        assert_eq!(
            filter_sql(wrapped(serde_json::json!([1, "a"]), "F")),
            "(1, 'a')"
        );
    }

    #[test]
    fn between_handles_partial_ranges() {
        assert_eq!(
            filter_between(
                wrapped(serde_json::json!({"start": "20240101", "end": "20240131"}), "D"),
                None
            ),
            "D BETWEEN '20240101' AND '20240131'"
        );
        assert_eq!(
            filter_between(wrapped(serde_json::json!({"start": "20240101"}), "D"), None),
            "D BETWEEN '20240101' AND NULL"
        );
        assert_eq!(filter_between(wrapped(serde_json::json!({}), "D"), None), "");
        assert_eq!(filter_between(wrapped(serde_json::json!("x"), "D"), None), "");
    }

    #[test]
    fn start_end_pass_through() {
        let range = wrapped(serde_json::json!({"begin": "a", "finish": "b"}), "R");
        assert_eq!(filter_start(range.clone()).to_string(), "a");
        assert_eq!(filter_end(range).to_string(), "b");
        let scalar = wrapped(serde_json::json!("solo"), "S");
        assert_eq!(filter_start(scalar).to_string(), "solo");
    }

    #[test]
    fn add_days_formats() {
        assert_eq!(
            filter_add_days(wrapped(serde_json::json!("20240115"), "D"), -7).to_string(),
            "20240108"
        );
        assert_eq!(
            filter_add_days(wrapped(serde_json::json!("2024-01-15T10:00:00Z"), "D"), 1)
                .to_string(),
            "20240116"
        );
        // Unparseable values come back unchanged.
        assert_eq!(
            filter_add_days(wrapped(serde_json::json!("soon"), "D"), 1).to_string(),
            "soon"
        );
    }

    #[test]
    fn like_wraps_in_wildcards() {
        assert_eq!(
            filter_like(wrapped(serde_json::json!("smith"), "NAME"), None),
            "NAME LIKE '%smith%'"
        );
    }
}
