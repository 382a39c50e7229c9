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
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures::{pin_mut, TryStreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{NoTls, Row};

use crate::cursor::{await_columns, RowBatch, CHANNEL_DEPTH};
use crate::{clean_driver_message, Error, Result, SqlCursor};

pub(crate) async fn open(url: &str, sql: &str, batch_size: usize) -> Result<SqlCursor> {
    let (meta_tx, meta_rx) = oneshot::channel();
    let (row_tx, row_rx) = mpsc::channel(CHANNEL_DEPTH);

    let url = url.to_string();
    let sql = sql.to_string();
    tokio::spawn(async move {
        run_statement(&url, &sql, batch_size, meta_tx, &row_tx).await;
    });

    await_columns(meta_rx, row_rx).await
}

async fn run_statement(
    url: &str,
    sql: &str,
    batch_size: usize,
    meta_tx: oneshot::Sender<Result<Vec<String>>>,
    row_tx: &mpsc::Sender<Result<RowBatch>>,
) {
    let (client, connection) = match tokio_postgres::connect(url, NoTls).await {
        Ok(pair) => pair,
        Err(e) => {
            let _ = meta_tx.send(Err(Error::UnableToConnect {
                message: clean_driver_message(&e.to_string()),
            }));
            return;
        }
    };

    // The connection future drives the socket; it resolves when the client is
    // dropped at the end of this task.
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("Postgres connection closed: {e}");
        }
    });

    let statement = match client.prepare(sql).await {
        Ok(statement) => statement,
        Err(e) => {
            let _ = meta_tx.send(Err(Error::QueryFailed {
                message: clean_driver_message(&e.to_string()),
            }));
            driver.abort();
            return;
        }
    };

    let column_types: Vec<Type> = statement.columns().iter().map(|c| c.type_().clone()).collect();
    let columns: Vec<String> = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    if meta_tx.send(Ok(columns)).is_err() {
        driver.abort();
        return;
    }

    let params: [&(dyn ToSql + Sync); 0] = [];
    let stream = match client
        .query_raw(&statement, params.iter().map(|p| *p as &dyn ToSql))
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            let _ = row_tx
                .send(Err(Error::QueryFailed {
                    message: clean_driver_message(&e.to_string()),
                }))
                .await;
            driver.abort();
            return;
        }
    };
    pin_mut!(stream);

    let mut batch: RowBatch = Vec::with_capacity(batch_size);
    loop {
        match stream.try_next().await {
            Ok(Some(row)) => {
                batch.push(row_to_cells(&row, &column_types));
                if batch.len() >= batch_size
                    && row_tx.send(Ok(std::mem::take(&mut batch))).await.is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                if !batch.is_empty() {
                    let _ = row_tx.send(Ok(batch)).await;
                }
                break;
            }
            Err(e) => {
                let _ = row_tx
                    .send(Err(Error::QueryFailed {
                        message: clean_driver_message(&e.to_string()),
                    }))
                    .await;
                break;
            }
        }
    }
}

fn row_to_cells(row: &Row, column_types: &[Type]) -> Vec<Cell> {
    column_types
        .iter()
        .enumerate()
        .map(|(idx, ty)| value_to_cell(row, idx, ty))
        .collect()
}

fn value_to_cell(row: &Row, idx: usize, ty: &Type) -> Cell {
    // `Type` values are runtime constants, so this dispatches by equality
    // rather than pattern matching.
    if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, Cell::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, |v| Cell::Int(i64::from(v)))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, |v| Cell::Int(i64::from(v)))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, Cell::Int)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, |v| Cell::Float(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, Cell::Float)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, Cell::Bytes)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, Cell::Timestamp)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, |dt| Cell::Timestamp(dt.naive_utc()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, Cell::Date)
    } else if *ty == Type::TIME {
        row.try_get::<_, Option<NaiveTime>>(idx)
            .ok()
            .flatten()
            .map_or(Cell::Null, |t| Cell::Str(t.format("%H:%M:%S%.f").to_string()))
    } else {
        match row.try_get::<_, Option<String>>(idx) {
            Ok(value) => value.map_or(Cell::Null, Cell::Str),
            Err(_) => {
                tracing::warn!("Unsupported Postgres type {ty} in column {idx}; emitting NULL");
                Cell::Null
            }
        }
    }
}
