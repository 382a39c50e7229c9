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

//! Jinja-style SQL templating.
//!
//! An [`Engine`] is built per render cycle: criteria values are wrapped into
//! [`SqlWrapper`]s bound to their criterion names, the SQL-fragment filter
//! suite and the `now`/boolean/`zip` globals are registered, and any
//! [`BlockTag`] extensions are mounted as functions over a source rewrite of
//! their `{% tag %}…{% endtag %}` spans.

use std::collections::BTreeMap;
use std::sync::Arc;

use minijinja::value::{Kwargs, Rest, Value};
use minijinja::{Environment, State};
use snafu::prelude::*;

pub mod filters;
pub mod preprocess;
pub mod rewrite;
mod tags;
mod value;

pub use preprocess::evaluate_template_value;
pub use tags::{tag_error, BlockTag};
pub use value::{SqlValue, SqlWrapper};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Template rendering failed: {source}"))]
    Render { source: minijinja::Error },

    #[snafu(display("Unable to expand block tags: {source}"))]
    ExpandBlockTags { source: rewrite::Error },
}

/// Today's date in the `YYYYMMDD` form the templates work with.
#[must_use]
pub fn today_compact() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

pub struct Engine {
    env: Environment<'static>,
    context: BTreeMap<String, Value>,
    tag_names: Vec<String>,
}

impl Engine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Renders a template source to SQL. Block tags run their side effects in
    /// source order during this call.
    ///
    /// # Errors
    ///
    /// Fails on template syntax errors or a fatal error raised by a block tag.
    pub fn render(&self, source: &str) -> Result<String> {
        let expanded =
            rewrite::expand_block_tags(source, &self.tag_names).context(ExpandBlockTagsSnafu)?;
        self.env
            .render_str(&expanded, &self.context)
            .context(RenderSnafu)
    }
}

pub struct EngineBuilder {
    now: Option<String>,
    criteria: serde_json::Map<String, serde_json::Value>,
    tags: Vec<Arc<dyn BlockTag>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        EngineBuilder {
            now: None,
            criteria: serde_json::Map::new(),
            tags: Vec::new(),
        }
    }

    /// Overrides the `now` global, mainly for deterministic tests.
    #[must_use]
    pub fn with_now(mut self, now: impl Into<String>) -> Self {
        self.now = Some(now.into());
        self
    }

    #[must_use]
    pub fn with_criteria(mut self, criteria: serde_json::Map<String, serde_json::Value>) -> Self {
        self.criteria = criteria;
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: Arc<dyn BlockTag>) -> Self {
        self.tags.push(tag);
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        let now = self.now.unwrap_or_else(today_compact);
        let mut env = base_environment(&now);

        // Criteria wrapping happens against the filter-bearing environment so
        // `{{ now | add_days(-7) }}` style values resolve during preprocessing.
        let mut context = BTreeMap::new();
        for (key, json) in &self.criteria {
            let wrapper = SqlWrapper::new(json, key, &env, &now);
            context.insert(key.clone(), Value::from_object(wrapper));
        }

        let tag_names: Vec<String> = self.tags.iter().map(|t| t.name().to_string()).collect();
        for tag in self.tags {
            let body_context = context.clone();
            let name = tag.name();
            env.add_function(
                name,
                move |state: &State<'_, '_>,
                      args: Rest<Value>,
                      kwargs: Kwargs|
                      -> Result<Value, minijinja::Error> {
                    let raw_body: Option<String> = kwargs.get(rewrite::BODY_KWARG)?;
                    let body = match raw_body {
                        Some(raw) if raw.contains("{{") || raw.contains("{%") => {
                            state.env().render_str(&raw, &body_context)?
                        }
                        Some(raw) => raw,
                        None => String::new(),
                    };
                    let emitted = tag.call(&args, &kwargs, &body)?;
                    Ok(Value::from(emitted))
                },
            );
        }

        Engine {
            env,
            context,
            tag_names,
        }
    }
}

/// Builds the filter- and global-bearing environment shared by rendering and
/// criterion preprocessing.
#[must_use]
pub fn base_environment(now: &str) -> Environment<'static> {
    let mut env = Environment::new();
    env.add_global("now", Value::from(now));
    // Case-variant boolean aliases so templates can write TRUE/True/true.
    env.add_global("TRUE", Value::from(true));
    env.add_global("True", Value::from(true));
    env.add_global("FALSE", Value::from(false));
    env.add_global("False", Value::from(false));
    env.add_function("zip", zip_function);
    filters::register(&mut env);
    env
}

fn zip_function(args: Rest<Value>) -> Result<Value, minijinja::Error> {
    let mut sequences: Vec<Vec<Value>> = Vec::with_capacity(args.len());
    for arg in args.iter() {
        sequences.push(arg.try_iter()?.collect());
    }
    let shortest = sequences.iter().map(Vec::len).min().unwrap_or(0);
    let mut zipped = Vec::with_capacity(shortest);
    for idx in 0..shortest {
        zipped.push(Value::from(
            sequences
                .iter()
                .map(|seq| seq[idx].clone())
                .collect::<Vec<_>>(),
        ));
    }
    Ok(Value::from(zipped))
}
