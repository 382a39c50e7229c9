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

use minijinja::value::{Kwargs, Value};

/// A custom `{% tag %}…{% endtag %}` extension.
///
/// Positional arguments and keyword arguments are evaluated by the template
/// engine; `body` arrives already rendered with the request's criteria
/// context. The returned string is emitted into the rendered SQL in place of
/// the block — tags that only produce side effects return an empty string.
///
/// Implementations run on the rendering thread and may block on I/O.
pub trait BlockTag: Send + Sync {
    fn name(&self) -> &'static str;

    /// Executes the tag.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the whole render; recoverable failures should
    /// be emitted as `-- ...` SQL comments instead.
    fn call(&self, args: &[Value], kwargs: &Kwargs, body: &str) -> Result<String, minijinja::Error>;
}

/// Builds the `minijinja` error used by tags to surface a fatal failure.
#[must_use]
pub fn tag_error(message: impl Into<String>) -> minijinja::Error {
    minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, message.into())
}
