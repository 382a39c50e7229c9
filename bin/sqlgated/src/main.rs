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

use std::sync::Arc;

use clap::Parser;
use runtime::config::Config;
use runtime::Runtime;
use snafu::prelude::*;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to construct the runtime: {source}"))]
    UnableToConstructRuntime { source: runtime::Error },

    #[snafu(display("Unable to start the server: {source}"))]
    UnableToStartServer { source: runtime::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Parser, Debug)]
#[clap(about = "sqlgate: template-driven SQL gateway over Arrow Flight")]
#[clap(rename_all = "kebab-case")]
pub struct Args {
    /// Print the version and exit.
    #[arg(long)]
    pub version: bool,

    #[clap(flatten)]
    pub runtime: Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,datafusion=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    if args.version {
        println!("sqlgated {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_tracing();

    let runtime = Arc::new(Runtime::new(args.runtime).context(UnableToConstructRuntimeSnafu)?);

    let server = tokio::spawn(runtime::start(Arc::clone(&runtime)));

    tokio::select! {
        outcome = server => {
            match outcome {
                Ok(result) => result.context(UnableToStartServerSnafu)?,
                Err(e) => {
                    tracing::error!("Flight server task failed: {e}");
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down; session contexts and cached files are being released");
        }
    }

    // Dropping the runtime tears down sessions, which removes their
    // temporary parquet files.
    drop(runtime);
    Ok(())
}
