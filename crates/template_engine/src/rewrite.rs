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

//! Source rewrite that turns `{% tag args %}body{% endtag %}` spans into
//! ordinary function calls (`{{ tag(args, __body="...") }}`) before the
//! template reaches the renderer. This keeps argument evaluation, conditional
//! inclusion and source ordering inside the template engine while the tag
//! implementations stay plain functions.

use regex::Regex;
use snafu::prelude::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid block tag name: {name}"))]
    InvalidTagName { name: String },
}

/// The keyword argument carrying the raw block body into the tag function.
pub const BODY_KWARG: &str = "__body";

/// Expands every registered block tag in `source`. Both parenthesized and
/// bare argument lists are accepted; the body is carried verbatim as a string
/// literal and rendered by the tag itself. Blocks of the same tag do not nest.
pub fn expand_block_tags(source: &str, tag_names: &[String]) -> Result<String> {
    let mut expanded = source.to_string();
    for name in tag_names {
        ensure!(
            !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'),
            InvalidTagNameSnafu { name: name.clone() }
        );
        let pattern = format!(
            r"(?s)\{{%-?\s*{name}\b(?P<args>.*?)-?%\}}(?P<body>.*?)\{{%-?\s*end{name}\s*-?%\}}"
        );
        let re = Regex::new(&pattern)
            .unwrap_or_else(|e| unreachable!("block tag pattern is valid for {name}: {e}"));
        expanded = re
            .replace_all(&expanded, |caps: &regex::Captures<'_>| {
                let args = normalize_args(caps.name("args").map_or("", |m| m.as_str()));
                let body = escape_string_literal(caps.name("body").map_or("", |m| m.as_str()));
                if args.is_empty() {
                    format!("{{{{ {name}({BODY_KWARG}={body}) }}}}")
                } else {
                    format!("{{{{ {name}({args}, {BODY_KWARG}={body}) }}}}")
                }
            })
            .into_owned();
    }
    Ok(expanded)
}

/// Strips one layer of outer parentheses so `{% reader ('t', 'c') %}` and
/// `{% reader 't', 'c' %}` rewrite identically.
fn normalize_args(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('(') && trimmed.ends_with(')') {
        let inner = &trimmed[1..trimmed.len() - 1];
        // Only strip when the parens actually wrap the whole list.
        let mut depth = 0i32;
        let mut wraps = true;
        for ch in inner.chars() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        wraps = false;
                        break;
                    }
                }
                _ => {}
            }
        }
        if wraps && depth == 0 {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

fn escape_string_literal(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 2);
    out.push('"');
    for ch in body.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> Vec<String> {
        vec!["reader".to_string(), "python".to_string()]
    }

    #[test]
    fn rewrites_bare_arguments() {
        let out = expand_block_tags(
            "{% reader 'ext', 'conn' %} SELECT 1 {% endreader %}",
            &tags(),
        )
        .expect("rewrite");
        assert_eq!(out, "{{ reader('ext', 'conn', __body=\" SELECT 1 \") }}");
    }

    #[test]
    fn rewrites_parenthesized_arguments() {
        let out = expand_block_tags(
            "{% reader ('ext', 'conn', TRUE) %}SELECT 1{% endreader %}",
            &tags(),
        )
        .expect("rewrite");
        assert_eq!(
            out,
            "{{ reader('ext', 'conn', TRUE, __body=\"SELECT 1\") }}"
        );
    }

    #[test]
    fn keeps_surrounding_sql() {
        let out = expand_block_tags(
            "{% reader 'ext', 'c' %}SELECT 1{% endreader %}\nSELECT * FROM ext",
            &tags(),
        )
        .expect("rewrite");
        assert!(out.ends_with("\nSELECT * FROM ext"));
        assert!(out.starts_with("{{ reader("));
    }

    #[test]
    fn escapes_body_content() {
        let out = expand_block_tags(
            "{% python name='t' %}\nreturn [{\"x\": 1}]\n{% endpython %}",
            &tags(),
        )
        .expect("rewrite");
        assert_eq!(
            out,
            "{{ python(name='t', __body=\"\\nreturn [{\\\"x\\\": 1}]\\n\") }}"
        );
    }

    #[test]
    fn multiple_blocks_expand_in_order() {
        let out = expand_block_tags(
            "{% reader 'a', 'c' %}S1{% endreader %} {% reader 'b', 'c' %}S2{% endreader %}",
            &tags(),
        )
        .expect("rewrite");
        let first = out.find("reader('a'").expect("first block");
        let second = out.find("reader('b'").expect("second block");
        assert!(first < second);
    }

    #[test]
    fn plain_templates_are_untouched() {
        let src = "SELECT * FROM t WHERE {{ ID | eq }}";
        let out = expand_block_tags(src, &tags()).expect("rewrite");
        assert_eq!(out, src);
    }
}
