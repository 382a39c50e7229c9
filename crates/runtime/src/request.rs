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
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::registry::ConnectionRegistry;
use crate::session::Session;

/// Bound on in-flight log lines between the render task and the stream.
pub const LOG_CHANNEL_DEPTH: usize = 64;

/// One line of user-visible output produced during rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogLine {
    Stdout(String),
    Stderr(String),
    System(String),
}

impl LogLine {
    #[must_use]
    pub fn stream_type(&self) -> &'static str {
        match self {
            LogLine::Stdout(_) => "stdout",
            LogLine::Stderr(_) => "stderr",
            LogLine::System(_) => "system",
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            LogLine::Stdout(s) | LogLine::Stderr(s) | LogLine::System(s) => s,
        }
    }
}

/// Per-request mutable state, constructed fresh on every handler entry and
/// threaded explicitly into the template engine's block tags. Values must
/// never leak into an unrelated request.
pub struct RequestContext {
    pub session_id: String,
    pub session: Arc<Session>,
    /// Name → connection string snapshot taken at request start.
    pub connection_map: HashMap<String, String>,
    pub registry: Arc<ConnectionRegistry>,
    /// When set, `reader` blocks fetch only the first batch and skip parquet
    /// materialization.
    pub schema_inference: bool,
    pub downloads_dir: PathBuf,
    /// Web-visible prefix emitted in `-- [DOWNLOAD_FILE]:` markers.
    pub public_download_prefix: String,
    has_side_effects: AtomicBool,
    log_sender: Mutex<Option<mpsc::Sender<LogLine>>>,
    captured_stdout: Mutex<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        registry: Arc<ConnectionRegistry>,
        schema_inference: bool,
        downloads_dir: PathBuf,
        public_download_prefix: String,
    ) -> Arc<Self> {
        Arc::new(RequestContext {
            session_id: session.id.clone(),
            connection_map: registry.connection_map_snapshot(),
            registry,
            session,
            schema_inference,
            downloads_dir,
            public_download_prefix,
            has_side_effects: AtomicBool::new(false),
            log_sender: Mutex::new(None),
            captured_stdout: Mutex::new(String::new()),
        })
    }

    /// Marks that rendering mutated the session's table namespace; the ticket
    /// must then carry the original command so `do_get` re-renders.
    pub fn mark_side_effects(&self) {
        self.has_side_effects.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        self.has_side_effects.load(Ordering::Relaxed)
    }

    /// Attaches the log channel for this request; only `do_get` streams logs.
    pub fn set_log_sender(&self, sender: mpsc::Sender<LogLine>) {
        if let Ok(mut slot) = self.log_sender.lock() {
            *slot = Some(sender);
        }
    }

    /// Drops the sender so the consumer observes the completion sentinel
    /// (channel closure). Called once rendering finishes, success or not.
    pub fn close_log(&self) {
        if let Ok(mut slot) = self.log_sender.lock() {
            slot.take();
        }
    }

    /// Enqueues a log line (from the rendering thread) and mirrors stdout
    /// lines into the captured buffer used by empty-SQL grid responses.
    pub fn push_log(&self, line: LogLine) {
        if let LogLine::Stdout(text) = &line {
            self.capture_stdout(text);
        }
        let sender = self
            .log_sender
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(sender) = sender {
            if sender.blocking_send(line).is_err() {
                tracing::debug!("Log consumer went away; dropping line");
            }
        }
    }

    pub fn capture_stdout(&self, text: &str) {
        if let Ok(mut captured) = self.captured_stdout.lock() {
            captured.push_str(text);
        }
    }

    #[must_use]
    pub fn captured_stdout(&self) -> String {
        self.captured_stdout
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Resolves a `reader` connection reference: literal URLs pass through,
    /// otherwise the session snapshot is consulted by exact name, then the
    /// metadata store case-insensitively, then the snapshot case-insensitively.
    #[must_use]
    pub fn resolve_connection(&self, reference: &str) -> String {
        if reference.contains("://") {
            return reference.to_string();
        }
        if let Some(resolved) = self.connection_map.get(reference) {
            return resolved.clone();
        }
        if let Some(resolved) = self.registry.connection_by_name_nocase(reference) {
            return resolved;
        }
        for (name, connection_string) in &self.connection_map {
            if name.eq_ignore_ascii_case(reference) {
                return connection_string.clone();
            }
        }
        reference.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionManager;
    use std::collections::HashMap as StdHashMap;

    fn context(seeds: &StdHashMap<String, String>) -> (tempfile::TempDir, Arc<RequestContext>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(
            ConnectionRegistry::open(&dir.path().join("data.db"), seeds).expect("registry"),
        );
        let sessions = SessionManager::new(4);
        let ctx = RequestContext::new(
            sessions.get_or_create("s1"),
            registry,
            false,
            dir.path().join("downloads"),
            "/temp_downloads".to_string(),
        );
        (dir, ctx)
    }

    #[test]
    fn side_effect_flag_starts_clear() {
        let (_dir, ctx) = context(&StdHashMap::new());
        assert!(!ctx.has_side_effects());
        ctx.mark_side_effects();
        assert!(ctx.has_side_effects());
    }

    #[test]
    fn resolves_connections_in_priority_order() {
        let seeds = StdHashMap::from([("Warehouse".to_string(), "sqlite://w.db".to_string())]);
        let (_dir, ctx) = context(&seeds);

        assert_eq!(ctx.resolve_connection("mssql://u:p@h/db"), "mssql://u:p@h/db");
        assert_eq!(ctx.resolve_connection("Warehouse"), "sqlite://w.db");
        assert_eq!(ctx.resolve_connection("warehouse"), "sqlite://w.db");
        // Unknown names fall through unchanged (treated as a local path later).
        assert_eq!(ctx.resolve_connection("missing"), "missing");
    }

    #[test]
    fn stdout_lines_are_captured() {
        let (_dir, ctx) = context(&StdHashMap::new());
        ctx.push_log(LogLine::Stdout("hello\n".to_string()));
        ctx.push_log(LogLine::System("sys\n".to_string()));
        assert_eq!(ctx.captured_stdout(), "hello\n");
    }
}
