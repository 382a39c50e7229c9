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

//! Template resolution and rendering for one request.
//!
//! Rendering is synchronous template work plus potentially long block-tag
//! I/O, so it runs on a blocking thread; the per-request context is threaded
//! into the block tags, which use the runtime handle for async driver calls.

use std::sync::Arc;

use snafu::prelude::*;
use template_engine::Engine;
use tokio::runtime::Handle;

use crate::command::QueryCommand;
use crate::request::RequestContext;
use crate::tags::{PythonTag, ReaderTag};
use crate::templates::TemplateStore;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{source}"))]
    Template { source: crate::templates::Error },

    #[snafu(display("{message}"))]
    Render { message: String },
}

impl Error {
    /// Whether the failure is a missing template rather than a render fault.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Template {
                source: crate::templates::Error::TemplateNotFound { .. }
            }
        )
    }
}

/// Renders the command into final SQL, running `reader`/`python` side effects
/// against the request context. Already-rendered commands pass through.
///
/// # Errors
///
/// `Template` when the named template cannot be resolved; `Render` on
/// template syntax errors or fatal block-tag failures.
pub async fn render_command(
    templates: Arc<TemplateStore>,
    ctx: Arc<RequestContext>,
    cmd: QueryCommand,
) -> Result<String> {
    if cmd.already_rendered {
        return Ok(cmd.query);
    }

    let source = if cmd.query.is_empty() {
        if cmd.template.is_empty() {
            return Err(Error::Template {
                source: crate::templates::Error::TemplateNotFound {
                    template: String::new(),
                },
            });
        }
        templates
            .load(&cmd.template)
            .context(TemplateSnafu)?
            .sql
            .clone()
    } else {
        cmd.query.clone()
    };

    let handle = Handle::current();
    let render_ctx = Arc::clone(&ctx);
    let criteria = cmd.criteria;
    let outcome = tokio::task::spawn_blocking(move || {
        let engine = Engine::builder()
            .with_criteria(criteria)
            .with_tag(Arc::new(ReaderTag::new(
                Arc::clone(&render_ctx),
                handle.clone(),
            )))
            .with_tag(Arc::new(PythonTag::new(render_ctx, handle)))
            .build();
        engine.render(&source)
    })
    .await;

    match outcome {
        Ok(Ok(sql)) => Ok(sql),
        Ok(Err(e)) => {
            tracing::error!("Template rendering failed: {e}");
            RenderSnafu {
                message: render_message(&e),
            }
            .fail()
        }
        Err(join_error) => RenderSnafu {
            message: format!("Render task failed: {join_error}"),
        }
        .fail(),
    }
}

/// Unwraps minijinja's error chain so the client sees the tag's own message
/// (e.g. `Python Script Error: ...`) rather than the template frame around it.
fn render_message(error: &template_engine::Error) -> String {
    let mut current: Option<&dyn std::error::Error> = Some(error);
    let mut message = error.to_string();
    while let Some(e) = current {
        message = e.to_string();
        current = e.source();
    }
    // minijinja prefixes its kind; the detail after the colon is the payload.
    if let Some((kind, detail)) = message.split_once(": ") {
        if kind.contains("invalid operation") {
            return detail.to_string();
        }
    }
    message
}

/// True when the SQL is blank or consists only of `--` comment lines.
#[must_use]
pub fn is_effectively_empty(sql: &str) -> bool {
    sql.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

/// The stripped contents of leading `--` comment lines, used as the message
/// body for comment-only renders.
#[must_use]
pub fn comment_lines(sql: &str) -> Vec<String> {
    sql.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("--"))
        .map(|line| line.trim_start_matches("--").trim().to_string())
        .collect()
}

/// Statements whose schema cannot be probed: the engine would execute them.
#[must_use]
pub fn is_modification_sql(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    ["CREATE", "INSERT", "UPDATE", "DELETE", "DROP"]
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_comment_only_sql() {
        assert!(is_effectively_empty(""));
        assert!(is_effectively_empty("   \n  "));
        assert!(is_effectively_empty("-- a comment\n--another"));
        assert!(!is_effectively_empty("-- note\nSELECT 1"));
    }

    #[test]
    fn comment_lines_are_stripped() {
        assert_eq!(
            comment_lines("-- first\nSELECT 1\n--  second "),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn modification_prefixes() {
        assert!(is_modification_sql("  create table t (x int)"));
        assert!(is_modification_sql("DROP TABLE t"));
        assert!(is_modification_sql("insert into t values (1)"));
        assert!(!is_modification_sql("SELECT * FROM t"));
        assert!(!is_modification_sql("WITH x AS (SELECT 1) SELECT * FROM x"));
    }
}
