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

use std::sync::LazyLock;

use chrono::{Duration, NaiveDate};
use minijinja::Environment;
use regex::Regex;

static RELATIVE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{8})\s*([+-])\s*(\d+)([dwm])")
        .unwrap_or_else(|e| unreachable!("relative date pattern is valid: {e}"))
});

/// Resolves `{{now}}` and relative-date arithmetic inside a criterion string.
///
/// The string is first rendered as a template with `now` bound to today's
/// `YYYYMMDD` (the full filter suite is available when `env` carries it); a
/// render failure degrades to literal `{{now}}` substitution. Afterwards a
/// `YYYYMMDD ±N[dwm]` expression anywhere in the string collapses the whole
/// value to the computed date. Months are 30-day approximations. Values that
/// parse as neither are returned unchanged.
#[must_use]
pub fn evaluate_template_value(raw: &str, now: &str, env: &Environment<'_>) -> String {
    if raw.is_empty() {
        return raw.to_string();
    }

    let mut processed = raw.to_string();
    if processed.contains("{{") {
        match env.render_str(&processed, minijinja::context! { now => now }) {
            Ok(rendered) => processed = rendered,
            Err(_) => {
                processed = processed.replace("{{now}}", now).replace("{{ now }}", now);
            }
        }
    }

    if let Some(caps) = RELATIVE_DATE.captures(&processed) {
        let base = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let sign = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let amount: i64 = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or_default();
        let unit = caps.get(4).map(|m| m.as_str()).unwrap_or_default();

        if let Ok(date) = NaiveDate::parse_from_str(base, "%Y%m%d") {
            let days = match unit {
                "w" => amount * 7,
                "m" => amount * 30,
                _ => amount,
            };
            let delta = if sign == "-" { -days } else { days };
            if let Some(shifted) = date.checked_add_signed(Duration::days(delta)) {
                processed = shifted.format("%Y%m%d").to_string();
            }
        }
    }

    processed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(raw: &str, now: &str) -> String {
        let env = Environment::new();
        evaluate_template_value(raw, now, &env)
    }

    #[test]
    fn substitutes_now() {
        assert_eq!(eval("{{now}}", "20240115"), "20240115");
        assert_eq!(eval("{{ now }}", "20240115"), "20240115");
    }

    #[test]
    fn relative_days() {
        assert_eq!(eval("20240115 -1d", "20240115"), "20240114");
        assert_eq!(eval("20240115 +10d", "20240115"), "20240125");
    }

    #[test]
    fn now_with_offset() {
        assert_eq!(eval("{{now}} -30d", "20240131"), "20240101");
    }

    #[test]
    fn weeks_and_thirty_day_months() {
        assert_eq!(eval("20240115 +1w", "20240115"), "20240122");
        assert_eq!(eval("20240115 -1m", "20240115"), "20231216");
    }

    #[test]
    fn unparseable_values_pass_through() {
        assert_eq!(eval("hello", "20240115"), "hello");
        assert_eq!(eval("2024-01-15", "20240115"), "2024-01-15");
        assert_eq!(eval("", "20240115"), "");
    }
}
