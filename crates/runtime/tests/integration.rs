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

use std::path::Path;
use std::sync::Arc;

use arrow::array::Array;
use clap::Parser;
use runtime::command::QueryCommand;
use runtime::config::Config;
use runtime::pipeline;
use runtime::request::LogLine;
use runtime::Runtime;

struct Fixture {
    runtime: Arc<Runtime>,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("templates")).expect("templates dir");
    let config = Config::parse_from([
        "sqlgated",
        "--templates",
        dir.path().join("templates").to_str().expect("utf8 path"),
        "--metadata-db",
        dir.path().join("data.db").to_str().expect("utf8 path"),
        "--downloads-dir",
        dir.path().join("downloads").to_str().expect("utf8 path"),
        "--max-sessions",
        "10",
    ]);
    Fixture {
        runtime: Arc::new(Runtime::new(config).expect("runtime")),
        _dir: dir,
    }
}

fn write_template(runtime: &Runtime, name: &str, yaml: &str) {
    let dir = &runtime.config.template_dirs[0];
    std::fs::write(dir.join(name), yaml).expect("write template");
}

fn seeded_sqlite(dir: &Path) -> String {
    let path = dir.join("source.db");
    let conn = rusqlite::Connection::open(&path).expect("open sqlite");
    conn.execute_batch(
        "CREATE TABLE ACCOUNTS (ID INTEGER PRIMARY KEY, NAME TEXT, STATE TEXT);
         INSERT INTO ACCOUNTS VALUES
            (1, 'alice', 'CA'), (2, 'bob', 'NY'), (3, 'carol', 'CA');",
    )
    .expect("seed");
    format!("sqlite://{}", path.display())
}

async fn render(
    fx: &Fixture,
    cmd: QueryCommand,
    schema_inference: bool,
) -> (pipeline::Result<String>, Arc<runtime::request::RequestContext>) {
    let session = fx.runtime.sessions.get_or_create(cmd.session());
    let ctx = fx.runtime.request_context(&session, schema_inference);
    let outcome = pipeline::render_command(
        Arc::clone(&fx.runtime.templates),
        Arc::clone(&ctx),
        cmd,
    )
    .await;
    (outcome, ctx)
}

#[tokio::test(flavor = "multi_thread")]
async fn template_with_eq_filter_renders_and_executes() {
    let fx = fixture();
    write_template(
        &fx.runtime,
        "accounts.yaml",
        "sql: \"SELECT * FROM (VALUES (101), (102)) AS t(id) WHERE {{ ID | eq('id') }}\"\n",
    );

    let cmd = QueryCommand {
        template: "accounts.yaml".to_string(),
        criteria: serde_json::json!({"ID": 101})
            .as_object()
            .expect("criteria")
            .clone(),
        session_id: Some("s1".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    let sql = rendered.expect("render");
    assert!(sql.ends_with("WHERE id = 101"), "got: {sql}");
    assert!(!ctx.has_side_effects());

    let rows = ctx.session.context.collect(&sql).await.expect("execute");
    assert_eq!(rows.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_template_is_not_found() {
    let fx = fixture();
    let cmd = QueryCommand {
        template: "absent.yaml".to_string(),
        ..QueryCommand::default()
    };
    let (rendered, _ctx) = render(&fx, cmd, false).await;
    let err = rendered.expect_err("must fail");
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_block_materializes_external_table() {
    let fx = fixture();
    let uri = seeded_sqlite(fx._dir.path());

    let query = format!(
        "{{% reader 'ext', '{uri}' %}} SELECT ID, NAME FROM ACCOUNTS {{% endreader %}}\nSELECT * FROM ext WHERE id > 1"
    );
    let cmd = QueryCommand {
        query,
        session_id: Some("s-reader".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    let sql = rendered.expect("render");
    assert!(ctx.has_side_effects());
    assert_eq!(sql.trim(), "SELECT * FROM ext WHERE id > 1");

    let rows = ctx.session.context.collect(&sql).await.expect("execute");
    assert_eq!(rows.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_reregistration_replaces_table() {
    let fx = fixture();
    let uri = seeded_sqlite(fx._dir.path());
    let query = format!(
        "{{% reader 'ext', '{uri}' %}} SELECT ID FROM ACCOUNTS {{% endreader %}}SELECT COUNT(*) AS c FROM ext"
    );

    for _ in 0..2 {
        let cmd = QueryCommand {
            query: query.clone(),
            session_id: Some("s-idem".to_string()),
            ..QueryCommand::default()
        };
        let (rendered, ctx) = render(&fx, cmd, false).await;
        let sql = rendered.expect("render");
        let rows = ctx.session.context.collect(&sql).await.expect("execute");
        let count = rows[0]
            .column(0)
            .as_any()
            .downcast_ref::<arrow::array::Int64Array>()
            .expect("count")
            .value(0);
        // Re-execution replaces the table rather than appending.
        assert_eq!(count, 3);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_parquet_cache_registers_view() {
    let fx = fixture();
    let uri = seeded_sqlite(fx._dir.path());
    let query = format!(
        "{{% reader 'ext', '{uri}', TRUE %}} SELECT ID, NAME FROM ACCOUNTS {{% endreader %}}\nSELECT COUNT(*) AS c FROM ext"
    );
    let cmd = QueryCommand {
        query,
        session_id: Some("s-parquet".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    let sql = rendered.expect("render");
    // The cached-to-disk note renders as a comment above the outer query.
    assert!(sql.contains("Cached 'ext' to disk"), "got: {sql}");
    assert_eq!(ctx.session.tracked_parquet_count(), 1);

    let rows = ctx.session.context.collect(&sql).await.expect("execute");
    let count = rows[0]
        .column(0)
        .as_any()
        .downcast_ref::<arrow::array::Int64Array>()
        .expect("count")
        .value(0);
    assert_eq!(count, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_parquet_cache_handles_zero_rows() {
    let fx = fixture();
    let uri = seeded_sqlite(fx._dir.path());
    let query = format!(
        "{{% reader 'ext', '{uri}', TRUE %}} SELECT ID, NAME FROM ACCOUNTS WHERE ID > 100 {{% endreader %}}\nSELECT COUNT(*) AS c FROM ext"
    );
    let cmd = QueryCommand {
        query,
        session_id: Some("s-parquet-empty".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    let sql = rendered.expect("render");
    // An empty source still writes the cache file and registers the view.
    assert!(sql.contains("Cached 'ext' to disk"), "got: {sql}");
    assert_eq!(ctx.session.tracked_parquet_count(), 1);

    let rows = ctx.session.context.collect(&sql).await.expect("execute");
    let count = rows[0]
        .column(0)
        .as_any()
        .downcast_ref::<arrow::array::Int64Array>()
        .expect("count")
        .value(0);
    assert_eq!(count, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_resolves_registered_connection_names() {
    let fx = fixture();
    let uri = seeded_sqlite(fx._dir.path());
    fx.runtime
        .registry
        .save("Warehouse", "sqlite", &uri)
        .expect("save connection");

    // Case-insensitive reference through the metadata store.
    let query = "{% reader 'ext', 'warehouse' %} SELECT ID FROM ACCOUNTS {% endreader %}SELECT * FROM ext".to_string();
    let cmd = QueryCommand {
        query,
        session_id: Some("s-conn".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    let sql = rendered.expect("render");
    let rows = ctx.session.context.collect(&sql).await.expect("execute");
    assert_eq!(rows.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_error_degrades_to_comment() {
    let fx = fixture();
    let query = "{% reader 'ext', 'sqlite:///nonexistent/path/x.db' %} SELECT 1 {% endreader %}"
        .to_string();
    let cmd = QueryCommand {
        query,
        session_id: Some("s-err".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    let sql = rendered.expect("render must not fail");
    assert!(sql.contains("-- Error in reader tag:"), "got: {sql}");
    assert!(ctx.has_side_effects());
    assert!(pipeline::is_effectively_empty(&sql));
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_inference_side_effect_parity() {
    let fx = fixture();
    let uri = seeded_sqlite(fx._dir.path());

    // A plain template renders without side effects: the optimized ticket
    // carries the rendered SQL.
    let plain = QueryCommand {
        query: "SELECT 1".to_string(),
        session_id: Some("s-parity".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, plain.clone(), true).await;
    assert!(rendered.is_ok());
    assert!(!ctx.has_side_effects());
    let optimized = plain.into_rendered("SELECT 1".to_string());
    assert!(optimized.already_rendered);

    // A reader template marks side effects even under schema inference, so
    // the ticket must echo the original command.
    let effectful = QueryCommand {
        query: format!(
            "{{% reader 'ext', '{uri}' %}} SELECT ID FROM ACCOUNTS {{% endreader %}}SELECT * FROM ext"
        ),
        session_id: Some("s-parity".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, effectful, true).await;
    assert!(rendered.is_ok());
    assert!(ctx.has_side_effects());
}

#[tokio::test(flavor = "multi_thread")]
async fn already_rendered_commands_skip_rendering() {
    let fx = fixture();
    // A reader block in an already-rendered command must NOT execute.
    let cmd = QueryCommand {
        query: "{% reader 'x', 'y' %} SELECT 1 {% endreader %}SELECT 42".to_string(),
        already_rendered: true,
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    assert_eq!(
        rendered.expect("passthrough"),
        "{% reader 'x', 'y' %} SELECT 1 {% endreader %}SELECT 42"
    );
    assert!(!ctx.has_side_effects());
}

#[tokio::test(flavor = "multi_thread")]
async fn python_block_registers_table() {
    let fx = fixture();
    let cmd = QueryCommand {
        query: "{% python name='out' %}\nreturn [{\"x\": 1}, {\"x\": 2}]\n{% endpython %}\nSELECT * FROM out ORDER BY x".to_string(),
        session_id: Some("s-py".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    let sql = rendered.expect("render");
    assert!(ctx.has_side_effects());

    let rows = ctx.session.context.collect(&sql).await.expect("execute");
    assert_eq!(rows.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
    let column = rows[0]
        .column(0)
        .as_any()
        .downcast_ref::<arrow::array::Int64Array>()
        .expect("int column");
    assert_eq!(column.value(0), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn python_print_feeds_the_log_queue() {
    let fx = fixture();
    let session = fx.runtime.sessions.get_or_create("s-print");
    let ctx = fx.runtime.request_context(&session, false);

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    ctx.set_log_sender(tx);

    let cmd = QueryCommand {
        query: "{% python %}\nprint(\"hello\")\nreturn None\n{% endpython %}".to_string(),
        session_id: Some("s-print".to_string()),
        ..QueryCommand::default()
    };
    let outcome = pipeline::render_command(
        Arc::clone(&fx.runtime.templates),
        Arc::clone(&ctx),
        cmd,
    )
    .await;
    ctx.close_log();

    let sql = outcome.expect("render");
    assert!(pipeline::is_effectively_empty(&sql));
    assert_eq!(rx.recv().await, Some(LogLine::Stdout("hello\n".to_string())));
    // Channel closure is the completion sentinel.
    assert_eq!(rx.recv().await, None);
    assert_eq!(ctx.captured_stdout(), "hello\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn python_script_errors_surface() {
    let fx = fixture();
    let cmd = QueryCommand {
        query: "{% python %}\nraise ValueError(\"broken\")\n{% endpython %}".to_string(),
        session_id: Some("s-pyerr".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, _ctx) = render(&fx, cmd, false).await;
    let err = rendered.expect_err("must fail");
    let message = err.to_string();
    assert!(message.contains("Python Script Error"), "got: {message}");
    assert!(message.contains("broken"), "got: {message}");
}

#[tokio::test(flavor = "multi_thread")]
async fn information_schema_lists_session_tables() {
    let fx = fixture();
    let uri = seeded_sqlite(fx._dir.path());
    let cmd = QueryCommand {
        query: format!(
            "{{% reader 'ext', '{uri}' %}} SELECT ID FROM ACCOUNTS {{% endreader %}}SELECT 1"
        ),
        session_id: Some("s-schema".to_string()),
        ..QueryCommand::default()
    };
    let (rendered, ctx) = render(&fx, cmd, false).await;
    rendered.expect("render");

    let tables = ctx
        .session
        .context
        .collect(
            "SELECT table_name FROM information_schema.tables
             WHERE table_schema NOT IN ('information_schema', 'pg_catalog')
             ORDER BY table_name",
        )
        .await
        .expect("information_schema");
    let names: Vec<String> = tables
        .iter()
        .flat_map(|batch| {
            let column = batch
                .column(0)
                .as_any()
                .downcast_ref::<arrow::array::StringArray>()
                .expect("names");
            (0..column.len()).map(|i| column.value(i).to_string()).collect::<Vec<_>>()
        })
        .collect();
    assert!(names.contains(&"ext".to_string()), "got: {names:?}");
}
