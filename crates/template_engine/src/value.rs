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

use std::fmt;
use std::sync::Arc;

use minijinja::value::{Object, ObjectRepr, Value};
use minijinja::Environment;

use crate::preprocess::evaluate_template_value;

/// A criterion value after JSON decoding: a scalar, a list of scalars, or a
/// `start`/`end` range. Filters pattern-match on this sum.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<SqlValue>),
    Range {
        start: Option<Box<SqlValue>>,
        end: Option<Box<SqlValue>>,
    },
}

impl SqlValue {
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => SqlValue::Null,
            serde_json::Value::Bool(b) => SqlValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => SqlValue::Str(s.clone()),
            serde_json::Value::Array(items) => {
                SqlValue::List(items.iter().map(SqlValue::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let side = |keys: [&str; 2]| {
                    keys.iter()
                        .find_map(|k| map.get(*k))
                        .filter(|v| !v.is_null())
                        .map(|v| Box::new(SqlValue::from_json(v)))
                };
                SqlValue::Range {
                    start: side(["start", "begin"]),
                    end: side(["end", "finish"]),
                }
            }
        }
    }

    /// Empty per the filter short-circuit rules: absent, blank string, or an
    /// empty list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            SqlValue::Null => true,
            SqlValue::Str(s) => s.is_empty(),
            SqlValue::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Runs every string scalar (including range sides) through the value
    /// preprocessor. List elements are taken verbatim.
    #[must_use]
    pub fn preprocessed(self, env: &Environment<'_>, now: &str) -> Self {
        let run = |v: SqlValue| match v {
            SqlValue::Str(s) => SqlValue::Str(evaluate_template_value(&s, now, env)),
            other => other,
        };
        match self {
            SqlValue::Range { start, end } => SqlValue::Range {
                start: start.map(|v| Box::new(run(*v))),
                end: end.map(|v| Box::new(run(*v))),
            },
            other => run(other),
        }
    }

    #[must_use]
    pub fn to_minijinja(&self) -> Value {
        match self {
            SqlValue::Null => Value::from(()),
            SqlValue::Bool(b) => Value::from(*b),
            SqlValue::Int(i) => Value::from(*i),
            SqlValue::Float(f) => Value::from(*f),
            SqlValue::Str(s) => Value::from(s.clone()),
            SqlValue::List(items) => {
                Value::from(items.iter().map(SqlValue::to_minijinja).collect::<Vec<_>>())
            }
            SqlValue::Range { start, end } => {
                let mut map = std::collections::BTreeMap::new();
                if let Some(s) = start {
                    map.insert("start".to_string(), s.to_minijinja());
                }
                if let Some(e) = end {
                    map.insert("end".to_string(), e.to_minijinja());
                }
                Value::from_serialize(&map)
            }
        }
    }

    /// Best-effort conversion from an arbitrary template value, used when a
    /// filter receives something other than a [`SqlWrapper`].
    #[must_use]
    pub fn from_template_value(value: &Value) -> Self {
        use minijinja::value::ValueKind;
        match value.kind() {
            ValueKind::Undefined | ValueKind::None => SqlValue::Null,
            _ => serde_json::to_value(value)
                .map(|json| SqlValue::from_json(&json))
                .unwrap_or(SqlValue::Null),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => Ok(()),
            SqlValue::Bool(b) => write!(f, "{b}"),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Float(v) => write!(f, "{v}"),
            SqlValue::Str(s) => write!(f, "{s}"),
            SqlValue::List(items) => {
                let rendered: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", rendered.join(", "))
            }
            SqlValue::Range { start, end } => {
                let side = |v: &Option<Box<SqlValue>>| {
                    v.as_ref().map(ToString::to_string).unwrap_or_default()
                };
                write!(f, "{}..{}", side(start), side(end))
            }
        }
    }
}

/// A criterion value bound to the criterion name it arrived under. Filters use
/// the bound name to synthesize `NAME OP value` fragments.
#[derive(Debug)]
pub struct SqlWrapper {
    pub value: SqlValue,
    pub name: Option<String>,
}

impl SqlWrapper {
    /// Wraps a decoded criterion, preprocessing string values against `now`.
    #[must_use]
    pub fn new(json: &serde_json::Value, name: &str, env: &Environment<'_>, now: &str) -> Self {
        SqlWrapper {
            value: SqlValue::from_json(json).preprocessed(env, now),
            name: Some(name.to_string()),
        }
    }
}

impl Object for SqlWrapper {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key = key.as_str()?;
        match key {
            "start" | "begin" => match &self.value {
                SqlValue::Range { start, .. } => {
                    start.as_ref().map(|v| v.to_minijinja())
                }
                _ => None,
            },
            "end" | "finish" => match &self.value {
                SqlValue::Range { end, .. } => end.as_ref().map(|v| v.to_minijinja()),
                _ => None,
            },
            "value" => Some(self.value.to_minijinja()),
            "name" => self.name.as_deref().map(Value::from),
            _ => None,
        }
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_object_with_begin_finish_becomes_range() {
        let json = serde_json::json!({"begin": "20240101", "finish": "20240131"});
        let value = SqlValue::from_json(&json);
        let SqlValue::Range { start, end } = value else {
            panic!("expected range");
        };
        assert_eq!(*start.expect("start"), SqlValue::Str("20240101".into()));
        assert_eq!(*end.expect("end"), SqlValue::Str("20240131".into()));
    }

    #[test]
    fn emptiness_rules() {
        assert!(SqlValue::Null.is_empty());
        assert!(SqlValue::Str(String::new()).is_empty());
        assert!(SqlValue::List(vec![]).is_empty());
        assert!(!SqlValue::Int(0).is_empty());
        assert!(!SqlValue::Bool(false).is_empty());
    }

    #[test]
    fn wrapper_renders_as_bare_value() {
        let env = Environment::new();
        let wrapper = SqlWrapper::new(&serde_json::json!(101), "ID", &env, "20240101");
        let value = Value::from_object(wrapper);
        assert_eq!(value.to_string(), "101");
    }
}
