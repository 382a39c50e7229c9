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

use arrow_convert::Cell;
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

/// Row batches in flight between a driver task and the cursor.
pub(crate) type RowBatch = Vec<Vec<Cell>>;

pub(crate) const CHANNEL_DEPTH: usize = 4;

/// A batched cursor over one executed statement.
///
/// The column list is available immediately; batches arrive in execution
/// order. [`SqlCursor::next_batch`] returns `None` once the source is
/// exhausted. Dropping the cursor closes the channel, which cancels the
/// driver task and closes the underlying connection.
#[derive(Debug)]
pub struct SqlCursor {
    columns: Vec<String>,
    rows: mpsc::Receiver<Result<RowBatch>>,
    exhausted: bool,
}

impl SqlCursor {
    pub(crate) fn new(columns: Vec<String>, rows: mpsc::Receiver<Result<RowBatch>>) -> Self {
        SqlCursor {
            columns,
            rows,
            exhausted: false,
        }
    }

    /// Column names as reported by the source, in result order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Source column names normalized to lowercase for registration.
    #[must_use]
    pub fn normalized_columns(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.to_lowercase()).collect()
    }

    /// Next batch of rows, or `None` when the statement is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates a mid-stream driver failure; the cursor is exhausted after
    /// an error.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>> {
        if self.exhausted {
            return Ok(None);
        }
        match self.rows.recv().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(e)) => {
                self.exhausted = true;
                Err(e)
            }
            None => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}

/// Completes the column handshake from a freshly spawned driver task.
pub(crate) async fn await_columns(
    meta: oneshot::Receiver<Result<Vec<String>>>,
    rows: mpsc::Receiver<Result<RowBatch>>,
) -> Result<SqlCursor> {
    match meta.await {
        Ok(Ok(columns)) => Ok(SqlCursor::new(columns, rows)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::DriverStopped),
    }
}
