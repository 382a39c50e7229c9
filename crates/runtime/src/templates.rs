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

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Query source not found for template: {template}"))]
    TemplateNotFound { template: String },

    #[snafu(display("Unable to read template {path:?}: {source}"))]
    UnableToReadTemplate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to parse template {path:?}: {source}"))]
    UnableToParseTemplate {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateParam {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_yaml::Value>,
}

fn default_param_type() -> String {
    "text".to_string()
}

/// A template file: the SQL body plus the parameter descriptors the UI renders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sql: String,
    #[serde(default)]
    pub params: Vec<TemplateParam>,
}

/// Loads `*.yaml` templates from the configured directories, first hit wins.
/// Parsed files are cached per path and busted on mtime change.
pub struct TemplateStore {
    dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<PathBuf, (SystemTime, Arc<TemplateMetadata>)>>,
}

impl TemplateStore {
    #[must_use]
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        TemplateStore {
            dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a template name to its parsed metadata.
    ///
    /// # Errors
    ///
    /// `TemplateNotFound` when no directory has the file; parse errors
    /// otherwise.
    pub fn load(&self, template: &str) -> Result<Arc<TemplateMetadata>> {
        // Template names are plain filenames; refuse path escapes.
        let file_name = Path::new(template)
            .file_name()
            .map(PathBuf::from)
            .context(TemplateNotFoundSnafu {
                template: template.to_string(),
            })?;

        for dir in &self.dirs {
            let path = dir.join(&file_name);
            if path.exists() {
                return self.load_path(&path, template);
            }
        }
        TemplateNotFoundSnafu {
            template: template.to_string(),
        }
        .fail()
    }

    fn load_path(&self, path: &Path, template: &str) -> Result<Arc<TemplateMetadata>> {
        let modified = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        if let Ok(cache) = self.cache.lock() {
            if let Some((cached_mtime, metadata)) = cache.get(path) {
                if *cached_mtime == modified {
                    return Ok(Arc::clone(metadata));
                }
            }
        }

        let text = std::fs::read_to_string(path).context(UnableToReadTemplateSnafu {
            path: path.to_path_buf(),
        })?;
        let mut metadata: TemplateMetadata =
            serde_yaml::from_str(&text).context(UnableToParseTemplateSnafu {
                path: path.to_path_buf(),
            })?;
        metadata.name = template.to_string();

        let metadata = Arc::new(metadata);
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_path_buf(), (modified, Arc::clone(&metadata)));
        }
        Ok(metadata)
    }

    /// Every readable template, one entry per unique filename across the
    /// directories (earlier directories shadow later ones). Unparseable files
    /// are skipped.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<TemplateMetadata>> {
        let mut seen: Vec<String> = Vec::new();
        let mut templates = Vec::new();
        for dir in &self.dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(std::result::Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.extension()
                        .and_then(|e| e.to_str())
                        .is_some_and(|e| e.eq_ignore_ascii_case("yaml"))
                })
                .collect();
            paths.sort();

            for path in paths {
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if seen.iter().any(|s| s == file_name) {
                    continue;
                }
                match self.load_path(&path, file_name) {
                    Ok(metadata) => {
                        seen.push(file_name.to_string());
                        templates.push(metadata);
                    }
                    Err(e) => {
                        tracing::warn!("Skipping template {path:?}: {e}");
                    }
                }
            }
        }
        templates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_template(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).expect("write template");
    }

    #[test]
    fn loads_sql_and_params() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(
            dir.path(),
            "accounts.yaml",
            "description: Account search\nsql: \"SELECT * FROM ACCOUNTS WHERE {{ ID | eq }}\"\nparams:\n  - name: ID\n    label: Account id\n    required: true\n",
        );

        let store = TemplateStore::new(vec![dir.path().to_path_buf()]);
        let metadata = store.load("accounts.yaml").expect("load");
        assert_eq!(metadata.name, "accounts.yaml");
        assert!(metadata.sql.contains("{{ ID | eq }}"));
        assert_eq!(metadata.params.len(), 1);
        assert_eq!(metadata.params[0].param_type, "text");
        assert!(metadata.params[0].required);
    }

    #[test]
    fn missing_template_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = TemplateStore::new(vec![dir.path().to_path_buf()]);
        let err = store.load("nope.yaml").expect_err("missing");
        assert!(matches!(err, Error::TemplateNotFound { .. }));
    }

    #[test]
    fn first_directory_wins_and_list_dedupes() {
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        write_template(first.path(), "q.yaml", "sql: SELECT 1");
        write_template(second.path(), "q.yaml", "sql: SELECT 2");
        write_template(second.path(), "other.yaml", "sql: SELECT 3");

        let store = TemplateStore::new(vec![
            first.path().to_path_buf(),
            second.path().to_path_buf(),
        ]);
        assert_eq!(store.load("q.yaml").expect("load").sql, "SELECT 1");

        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.iter().filter(|t| t.name == "q.yaml").count(), 1);
    }

    #[test]
    fn cache_busts_on_mtime_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_template(dir.path(), "q.yaml", "sql: SELECT 1");
        let store = TemplateStore::new(vec![dir.path().to_path_buf()]);
        assert_eq!(store.load("q.yaml").expect("load").sql, "SELECT 1");

        std::thread::sleep(std::time::Duration::from_millis(20));
        write_template(dir.path(), "q.yaml", "sql: SELECT 99");

        assert_eq!(store.load("q.yaml").expect("reload").sql, "SELECT 99");
    }
}
