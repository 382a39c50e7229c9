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

//! The sqlgate runtime.
//!
//! Clients submit template references or inline templated queries over Arrow
//! Flight; templates render into SQL through a Jinja-style engine whose
//! `reader` and `python` block tags materialize external data into the
//! session's private analytical context; results stream back as Arrow record
//! batches, or as a log multiplex when the render produced user-visible
//! output.

use std::sync::Arc;

use snafu::prelude::*;

pub mod analytical;
pub mod command;
pub mod config;
pub mod external;
pub mod flight;
pub mod pipeline;
pub mod registry;
pub mod request;
pub mod session;
pub mod tags;
pub mod templates;

use config::Config;
use registry::ConnectionRegistry;
use request::RequestContext;
use session::{Session, SessionManager};
use templates::TemplateStore;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to initialize the connection registry: {source}"))]
    UnableToInitializeRegistry { source: registry::Error },

    #[snafu(display("{source}"))]
    FlightServer { source: flight::Error },
}

pub struct Runtime {
    pub config: Config,
    pub sessions: SessionManager,
    pub registry: Arc<ConnectionRegistry>,
    pub templates: Arc<TemplateStore>,
}

impl Runtime {
    /// Builds the runtime: opens the metadata store, seeds the system
    /// connections, and wires the template directories.
    ///
    /// # Errors
    ///
    /// Fails when the metadata database cannot be opened.
    pub fn new(config: Config) -> Result<Self> {
        let seeds = config.seed_connection_map();
        let registry = ConnectionRegistry::open(&config.metadata_db_path, &seeds)
            .context(UnableToInitializeRegistrySnafu)?;
        let templates = TemplateStore::new(config.template_dirs.clone());
        let sessions = SessionManager::new(config.max_sessions);

        Ok(Runtime {
            sessions,
            registry: Arc::new(registry),
            templates: Arc::new(templates),
            config,
        })
    }

    /// A fresh per-request context bound to the given session. Constructed on
    /// every handler entry and never reused across requests.
    #[must_use]
    pub fn request_context(
        &self,
        session: &Arc<Session>,
        schema_inference: bool,
    ) -> Arc<RequestContext> {
        RequestContext::new(
            Arc::clone(session),
            Arc::clone(&self.registry),
            schema_inference,
            self.config.downloads_dir.clone(),
            self.config.public_download_prefix.clone(),
        )
    }
}

/// Starts the Flight server and blocks until it exits.
///
/// # Errors
///
/// Fails when the server cannot bind or crashes.
pub async fn start(runtime: Arc<Runtime>) -> Result<()> {
    flight::start(runtime).await.context(FlightServerSnafu)
}
