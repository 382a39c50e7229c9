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

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tempfile::TempPath;

use crate::analytical::AnalyticalContext;

pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// One client session: an isolated analytical context plus the temporary
/// files it owns. Dropping the session reclaims both.
pub struct Session {
    pub id: String,
    pub context: AnalyticalContext,
    pub created_at: DateTime<Utc>,
    last_used: Mutex<DateTime<Utc>>,
    /// Serializes render+execute cycles: the per-session context is not safe
    /// for concurrent use by distinct requests.
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    parquet_files: Mutex<Vec<TempPath>>,
}

impl Session {
    fn new(id: String) -> Self {
        let now = Utc::now();
        Session {
            id,
            context: AnalyticalContext::new(),
            created_at: now,
            last_used: Mutex::new(now),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            parquet_files: Mutex::new(Vec::new()),
        }
    }

    pub fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Utc::now();
        }
    }

    #[must_use]
    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
            .lock()
            .map(|t| *t)
            .unwrap_or(self.created_at)
    }

    /// The lock requests of this session take for one render+execute cycle.
    #[must_use]
    pub fn execution_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.exec_lock)
    }

    /// Ties a temporary Parquet file's lifetime to this session; the file is
    /// deleted when the session is evicted or the server shuts down.
    pub fn track_parquet_file(&self, path: TempPath) {
        if let Ok(mut files) = self.parquet_files.lock() {
            files.push(path);
        }
    }

    /// Number of temporary parquet files currently owned by this session.
    #[must_use]
    pub fn tracked_parquet_count(&self) -> usize {
        self.parquet_files.lock().map(|f| f.len()).unwrap_or(0)
    }
}

/// Creates and evicts per-session analytical contexts.
///
/// Sessions are created lazily on first reference and evicted in insertion
/// order (FIFO) once the cap is exceeded. The manager is the sole owner of
/// analytical contexts.
pub struct SessionManager {
    sessions: Mutex<IndexMap<String, Arc<Session>>>,
    capacity: usize,
}

impl SessionManager {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        SessionManager {
            sessions: Mutex::new(IndexMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns the session, creating it (and evicting the oldest, at
    /// capacity) when absent.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Session> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(session) = sessions.get(session_id) {
            session.touch();
            return Arc::clone(session);
        }

        if sessions.len() >= self.capacity {
            if let Some((evicted_id, _)) = sessions.shift_remove_index(0) {
                tracing::info!("Evicting oldest session '{evicted_id}' at capacity");
            }
        }

        tracing::info!("Creating new session context for: {session_id}");
        let session = Arc::new(Session::new(session_id.to_string()));
        sessions.insert(session_id.to_string(), Arc::clone(&session));
        session
    }

    #[must_use]
    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .map(|s| s.contains_key(session_id))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_are_reused_by_id() {
        let manager = SessionManager::new(10);
        let a = manager.get_or_create("s1");
        let b = manager.get_or_create("s1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn fifo_eviction_above_capacity() {
        let manager = SessionManager::new(2);
        manager.get_or_create("first");
        manager.get_or_create("second");
        manager.get_or_create("third");
        assert_eq!(manager.len(), 2);
        assert!(!manager.exists("first"));
        assert!(manager.exists("second"));
        assert!(manager.exists("third"));
    }

    #[test]
    fn re_referencing_does_not_duplicate() {
        let manager = SessionManager::new(2);
        manager.get_or_create("a");
        manager.get_or_create("b");
        manager.get_or_create("a");
        manager.get_or_create("c");
        // "a" was inserted first and stays first in insertion order, so it is
        // the one evicted.
        assert!(!manager.exists("a"));
        assert!(manager.exists("b"));
        assert!(manager.exists("c"));
    }

    #[tokio::test]
    async fn session_isolation() {
        let manager = SessionManager::new(10);
        let a = manager.get_or_create("a");
        let b = manager.get_or_create("b");

        let batch = arrow_convert::rows_to_batch(
            &["x".to_string()],
            &[vec![arrow_convert::Cell::Int(1)]],
        )
        .expect("batch");
        a.context
            .register_batches("private", batch.schema(), vec![batch])
            .expect("register");

        assert!(a.context.collect("SELECT * FROM private").await.is_ok());
        assert!(b.context.collect("SELECT * FROM private").await.is_err());
    }
}
