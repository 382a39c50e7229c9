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

use arrow::array::RecordBatch;
use arrow::ipc::writer::{DictionaryTracker, IpcDataGenerator, IpcWriteOptions};
use arrow::util::pretty::pretty_format_batches;
use arrow_flight::encode::FlightDataEncoderBuilder;
use arrow_flight::error::FlightError;
use arrow_flight::{FlightData, SchemaAsIpc, Ticket};
use futures::stream::BoxStream;
use futures::{stream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tonic::{Request, Response, Status};

use super::util::{
    handle_datafusion_error, internal_error, log_batch, log_schema, message_batch,
    strip_engine_prefixes, LOG_PREVIEW_MAX_ROWS, SUCCESS_MESSAGE,
};
use super::Service;
use crate::command::QueryCommand;
use crate::external;
use crate::pipeline;
use crate::request::{LogLine, RequestContext, LOG_CHANNEL_DEPTH};

type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
type RenderTask = JoinHandle<pipeline::Result<String>>;

pub(crate) async fn handle(
    service: &Service,
    request: Request<Ticket>,
) -> Result<Response<DoGetStream>, Status> {
    let header_session = request
        .metadata()
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let ticket = request.into_inner();

    let mut cmd = QueryCommand::from_ticket_bytes(&ticket.ticket);
    if cmd.session_id.is_none() {
        cmd.session_id = header_session;
    }

    let session = service.runtime.sessions.get_or_create(cmd.session());
    let guard = session.execution_lock().lock_owned().await;
    let ctx = service.runtime.request_context(&session, false);

    // Rendering runs in the background; log lines stream through the bounded
    // channel and channel closure is the completion sentinel.
    let (log_tx, mut log_rx) = mpsc::channel(LOG_CHANNEL_DEPTH);
    ctx.set_log_sender(log_tx);

    let render_ctx = Arc::clone(&ctx);
    let templates = Arc::clone(&service.runtime.templates);
    let render_cmd = cmd.clone();
    let render_task: RenderTask = tokio::spawn(async move {
        let outcome = pipeline::render_command(templates, Arc::clone(&render_ctx), render_cmd).await;
        render_ctx.close_log();
        outcome
    });

    // The first observation decides the response mode. A log line before the
    // sentinel commits the whole stream to the two-column log schema.
    match log_rx.recv().await {
        Some(first) => Ok(Response::new(log_stream_mode(
            ctx, guard, first, log_rx, render_task,
        ))),
        None => grid_mode(service, ctx, guard, cmd, render_task).await,
    }
}

/// Log-streaming mode: every frame uses `{stream_type, stream_content}`.
/// After the sentinel, a render error becomes one `stderr` row; otherwise a
/// non-empty rendered SQL executes and is summarized as a `system` row.
fn log_stream_mode(
    ctx: Arc<RequestContext>,
    guard: OwnedMutexGuard<()>,
    first: LogLine,
    mut log_rx: mpsc::Receiver<LogLine>,
    render_task: RenderTask,
) -> DoGetStream {
    let batches = async_stream::stream! {
        let _guard = guard;
        yield Ok::<RecordBatch, FlightError>(log_batch(&first));
        while let Some(line) = log_rx.recv().await {
            yield Ok(log_batch(&line));
        }

        match render_task.await {
            Err(join_error) => {
                yield Ok(log_batch(&LogLine::Stderr(format!(
                    "\n[RENDER ERROR]: {join_error}"
                ))));
            }
            Ok(Err(e)) => {
                yield Ok(log_batch(&LogLine::Stderr(format!("\n[RENDER ERROR]: {e}"))));
            }
            Ok(Ok(sql)) => {
                if !pipeline::is_effectively_empty(&sql) {
                    match ctx.session.context.collect(&sql).await {
                        Ok(result) => {
                            let rows: usize = result.iter().map(RecordBatch::num_rows).sum();
                            let mut summary = format!("\n[SQL RESULT]: {rows} rows returned.\n");
                            if rows < LOG_PREVIEW_MAX_ROWS {
                                match pretty_format_batches(&result) {
                                    Ok(table) => summary.push_str(&table.to_string()),
                                    Err(e) => summary.push_str(&e.to_string()),
                                }
                            } else {
                                summary.push_str(
                                    "(Result too large for terminal view, run SQL separately for Grid View)",
                                );
                            }
                            yield Ok(log_batch(&LogLine::System(summary)));
                        }
                        Err(e) => {
                            yield Ok(log_batch(&LogLine::Stderr(format!(
                                "\n[SQL ERROR]: {}",
                                strip_engine_prefixes(&e.to_string())
                            ))));
                        }
                    }
                }
            }
        }
    };

    FlightDataEncoderBuilder::new()
        .with_schema(log_schema())
        .build(batches)
        .map(|result| result.map_err(internal_error))
        .boxed()
}

/// Grid mode: the render finished before producing any output. Errors
/// propagate as Flight errors; empty SQL becomes a one-row `{Result}` table;
/// external targets stream from their own connection; everything else streams
/// from the embedded engine.
async fn grid_mode(
    service: &Service,
    ctx: Arc<RequestContext>,
    guard: OwnedMutexGuard<()>,
    cmd: QueryCommand,
    render_task: RenderTask,
) -> Result<Response<DoGetStream>, Status> {
    let rendered = render_task
        .await
        .map_err(|e| Status::internal(format!("Render task failed: {e}")))?
        .map_err(super::render_error_to_status)?;

    if pipeline::is_effectively_empty(&rendered) {
        let captured = ctx.captured_stdout();
        let comments = pipeline::comment_lines(&rendered);
        let message = if !captured.trim().is_empty() {
            captured.trim().to_string()
        } else if !comments.is_empty() {
            comments.join("\n")
        } else {
            SUCCESS_MESSAGE.to_string()
        };
        let batch = message_batch("Result", &message);
        let stream = FlightDataEncoderBuilder::new()
            .with_schema(batch.schema())
            .build(stream::once(async move { Ok(batch) }))
            .map(|result| result.map_err(internal_error));
        return Ok(Response::new(hold_guard(stream, guard).boxed()));
    }

    if cmd.targets_external_connection() {
        let connection_id = cmd.connection_id.clone().unwrap_or_default();
        if let Some(connection_string) = service.runtime.registry.connection_by_id(&connection_id)
        {
            tracing::info!("Executing rendered query on connection {connection_id}");
            let result = external::execute(&connection_string, &rendered)
                .await
                .map_err(|e| Status::internal(e.to_string()))?;
            let stream = FlightDataEncoderBuilder::new()
                .with_schema(result.schema)
                .build(
                    result
                        .batches
                        .map(|item| item.map_err(|e| FlightError::ExternalError(Box::new(e)))),
                )
                .map(|item| item.map_err(internal_error));
            return Ok(Response::new(hold_guard(stream, guard).boxed()));
        }
        tracing::warn!("Connection ID {connection_id} not found. Falling back to default session.");
    }

    let stream = sql_to_flight_stream(&ctx, &rendered).await?;
    Ok(Response::new(hold_guard(stream, guard).boxed()))
}

/// Streams the embedded engine's record batches as Flight IPC frames, schema
/// first, dictionaries included.
async fn sql_to_flight_stream(
    ctx: &RequestContext,
    sql: &str,
) -> Result<DoGetStream, Status> {
    let batch_stream = ctx
        .session
        .context
        .query_stream(sql)
        .await
        .map_err(handle_datafusion_error)?;

    let schema = batch_stream.schema();
    let options = IpcWriteOptions::default();
    let schema_flight_data = FlightData::from(SchemaAsIpc::new(&schema, &options));

    let batches_stream = batch_stream
        .then(move |batch_result| {
            let options_clone = options.clone();
            async move {
                let encoder = IpcDataGenerator::default();
                let mut tracker = DictionaryTracker::new(false);

                match batch_result {
                    Ok(batch) => {
                        let (flight_dictionaries, flight_batch) = encoder
                            .encoded_batch(&batch, &mut tracker, &options_clone)
                            .map_err(|e| Status::internal(e.to_string()))?;

                        let mut flights: Vec<FlightData> =
                            flight_dictionaries.into_iter().map(Into::into).collect();
                        flights.push(flight_batch.into());
                        Ok(flights)
                    }
                    Err(e) => Err(handle_datafusion_error(e)),
                }
            }
        })
        .map(|result| match result {
            Ok(flights) => stream::iter(flights.into_iter().map(Ok)).left_stream(),
            Err(e) => stream::once(async { Err(e) }).right_stream(),
        })
        .flatten();

    Ok(stream::once(async { Ok(schema_flight_data) })
        .chain(batches_stream)
        .boxed())
}

/// Keeps the session's execution lock alive for the lifetime of the response
/// stream.
fn hold_guard<S, T>(stream: S, guard: OwnedMutexGuard<()>) -> impl Stream<Item = T>
where
    S: Stream<Item = T>,
{
    stream.map(move |item| {
        let _held = &guard;
        item
    })
}
