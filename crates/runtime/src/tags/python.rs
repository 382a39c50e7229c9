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

//! `{% python [name=]'out_name' %} script {% endpython %}`
//!
//! Runs the block body in-process through the embedded Python interpreter.
//! The script sees `ctx` (the session's analytical context), `json` and
//! `datetime`, and a `print` that feeds the request's log queue. The return
//! value decides what happens: `None` is side-effect only, a file-like object
//! becomes a downloadable artifact, anything iterable becomes a registered
//! table.

use std::collections::hash_map::DefaultHasher;
use std::ffi::CString;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow_convert::{records_to_batches, Cell, RecordValue};
use chrono::{NaiveDate, NaiveDateTime};
use indexmap::IndexMap;
use minijinja::value::{Kwargs, Value};
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyList, PyString, PyTuple};
use template_engine::{tag_error, BlockTag};
use tokio::runtime::Handle;

use crate::request::{LogLine, RequestContext};

const DEFAULT_OUTPUT_NAME: &str = "python_output";

pub struct PythonTag {
    ctx: Arc<RequestContext>,
    handle: Handle,
}

impl PythonTag {
    #[must_use]
    pub fn new(ctx: Arc<RequestContext>, handle: Handle) -> Self {
        PythonTag { ctx, handle }
    }
}

impl BlockTag for PythonTag {
    fn name(&self) -> &'static str {
        "python"
    }

    fn call(
        &self,
        args: &[Value],
        kwargs: &Kwargs,
        body: &str,
    ) -> Result<String, minijinja::Error> {
        let output_name: String = kwargs
            .get::<Option<String>>("name")
            .ok()
            .flatten()
            .or_else(|| args.first().map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string());

        if body.trim().is_empty() {
            return Err(tag_error("Python block is empty"));
        }

        match self.execute(&output_name, body) {
            Ok(emitted) => Ok(emitted),
            Err(message) => {
                self.ctx.push_log(LogLine::Stderr(format!(
                    "Error executing python block: {message}\n"
                )));
                tracing::error!("Python execution error: {message}");
                Err(tag_error(format!("Python Script Error: {message}")))
            }
        }
    }
}

impl PythonTag {
    fn execute(&self, output_name: &str, code: &str) -> Result<String, String> {
        let dedented = dedent(code);
        let mut hasher = DefaultHasher::new();
        code.hash(&mut hasher);
        let func_name = format!("_python_block_{:08x}", hasher.finish() & 0xFFFF_FFFF);
        let indented = indent(&dedented, "    ");
        // Wrapping in a function makes `return` valid at the top level of the
        // block body.
        let script = format!("\ndef {func_name}():\n{indented}\n");

        Python::attach(|py| {
            let globals = PyDict::new(py);
            let session_handle = SessionHandle {
                ctx: Arc::clone(&self.ctx),
                handle: self.handle.clone(),
            };
            let print_capture = PrintCapture {
                ctx: Arc::clone(&self.ctx),
            };
            globals
                .set_item("ctx", session_handle.into_pyobject(py).map_err(stringify)?)
                .map_err(stringify)?;
            globals
                .set_item("print", print_capture.into_pyobject(py).map_err(stringify)?)
                .map_err(stringify)?;
            globals
                .set_item("json", py.import("json").map_err(stringify)?)
                .map_err(stringify)?;
            globals
                .set_item("datetime", py.import("datetime").map_err(stringify)?)
                .map_err(stringify)?;

            let c_script =
                CString::new(script).map_err(|e| format!("Invalid python block: {e}"))?;
            py.run(&c_script, Some(&globals), None).map_err(stringify)?;

            let func = globals
                .get_item(&func_name)
                .map_err(stringify)?
                .ok_or_else(|| "Python block function not defined".to_string())?;
            let result = func.call0().map_err(stringify)?;

            if result.is_none() {
                return Ok(String::new());
            }

            if result.hasattr("read").unwrap_or(false) || result.hasattr("getvalue").unwrap_or(false)
            {
                return Ok(self.save_binary_output(py, output_name, &result));
            }

            self.register_result(py, output_name, &result)
        })
    }

    /// Saves a file-like return value into a fresh directory under the
    /// downloads area and emits the client-visible marker comment.
    fn save_binary_output(
        &self,
        _py: Python<'_>,
        output_name: &str,
        result: &Bound<'_, PyAny>,
    ) -> String {
        let saved = (|| -> Result<String, String> {
            if result.hasattr("seek").unwrap_or(false) {
                let _ = result.call_method1("seek", (0,));
            }
            let bytes = read_binary_payload(result)?;

            let subdir_id = uuid::Uuid::new_v4().simple().to_string();
            let target_dir = self.ctx.downloads_dir.join(&subdir_id);
            std::fs::create_dir_all(&target_dir).map_err(|e| e.to_string())?;

            let file_name = if output_name == DEFAULT_OUTPUT_NAME {
                format!(
                    "download_{}.bin",
                    chrono::Local::now().format("%Y%m%d_%H%M%S")
                )
            } else {
                // Flatten any path components the template supplied.
                std::path::Path::new(output_name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| DEFAULT_OUTPUT_NAME.to_string())
            };

            std::fs::write(target_dir.join(&file_name), bytes).map_err(|e| e.to_string())?;
            self.ctx.push_log(LogLine::Stdout(format!(
                "\n[SYSTEM]: Binary output saved to {file_name}\n"
            )));
            Ok(format!(
                "-- [DOWNLOAD_FILE]:{}/{subdir_id}/{file_name}",
                self.ctx.public_download_prefix
            ))
        })();

        match saved {
            Ok(marker) => marker,
            Err(e) => {
                tracing::error!("Failed to save binary output: {e}");
                self.ctx.push_log(LogLine::System(format!(
                    "[SYSTEM ERROR]: Failed to save binary output: {e}\n"
                )));
                String::new()
            }
        }
    }

    /// Converts an iterable return value into Arrow and registers it under
    /// `output_name` in the session context.
    fn register_result(
        &self,
        _py: Python<'_>,
        output_name: &str,
        result: &Bound<'_, PyAny>,
    ) -> Result<String, String> {
        let records = match extract_records(result) {
            Ok(records) => records,
            Err(e) => {
                self.ctx.push_log(LogLine::System(format!(
                    "[SYSTEM ERROR]: Failed to convert Python result to Arrow table: {e}\n"
                )));
                tracing::error!("Failed to convert result: {e}");
                return Ok(String::new());
            }
        };

        let row_count = records.len();
        let (schema, batches) = match records_to_batches(&records) {
            Ok(converted) => converted,
            Err(e) => {
                self.ctx.push_log(LogLine::System(format!(
                    "[SYSTEM ERROR]: Failed to convert Python result to Arrow table: {e}\n"
                )));
                return Ok(String::new());
            }
        };

        self.ctx
            .session
            .context
            .register_batches(output_name, schema, batches)
            .map_err(|e| e.to_string())?;
        self.ctx.mark_side_effects();
        tracing::info!("[{}] Registered result of '{output_name}'", self.ctx.session_id);
        self.ctx.push_log(LogLine::Stdout(format!(
            "\nTable '{output_name}' registered successfully ({row_count} rows).\n"
        )));
        Ok(String::new())
    }
}

fn stringify(e: PyErr) -> String {
    e.to_string()
}

fn read_binary_payload(result: &Bound<'_, PyAny>) -> Result<Vec<u8>, String> {
    let payload = if result.hasattr("read").unwrap_or(false) {
        result.call_method0("read").map_err(stringify)?
    } else {
        result.call_method0("getvalue").map_err(stringify)?
    };
    if let Ok(bytes) = payload.extract::<Vec<u8>>() {
        return Ok(bytes);
    }
    payload
        .extract::<String>()
        .map(String::into_bytes)
        .map_err(stringify)
}

/// Materializes the script's return value into conversion records. Accepts
/// plain iterables of dicts or scalars, plus duck-typed `to_pylist()`
/// (pyarrow) and `to_dict('records')` (dataframe) producers.
fn extract_records(result: &Bound<'_, PyAny>) -> Result<Vec<RecordValue>, String> {
    if result.is_instance_of::<PyString>() || result.is_instance_of::<PyBytes>() {
        return Err(format!(
            "Unsupported return type: {}",
            result.get_type().name().map_or_else(|_| "?".to_string(), |n| n.to_string())
        ));
    }

    let iterable = if result.hasattr("to_pylist").unwrap_or(false) {
        result.call_method0("to_pylist").map_err(stringify)?
    } else if result.hasattr("to_dict").unwrap_or(false)
        && result.hasattr("columns").unwrap_or(false)
    {
        result
            .call_method1("to_dict", ("records",))
            .map_err(stringify)?
    } else {
        result.clone()
    };

    let mut records = Vec::new();
    let iter = iterable.try_iter().map_err(stringify)?;
    for item in iter {
        let item = item.map_err(stringify)?;
        if let Ok(dict) = item.downcast::<PyDict>() {
            let mut map = IndexMap::new();
            for (key, value) in dict.iter() {
                let key = key.str().map_err(stringify)?.to_string();
                map.insert(key, py_to_cell(&value));
            }
            records.push(RecordValue::Map(map));
        } else {
            records.push(RecordValue::Scalar(py_to_cell(&item)));
        }
    }
    Ok(records)
}

fn py_to_cell(value: &Bound<'_, PyAny>) -> Cell {
    if value.is_none() {
        return Cell::Null;
    }
    if let Ok(b) = value.extract::<bool>() {
        // bool is checked before int: Python booleans are ints.
        if value.is_instance_of::<pyo3::types::PyBool>() {
            return Cell::Bool(b);
        }
    }
    if value.is_instance_of::<PyBytes>() {
        if let Ok(bytes) = value.extract::<Vec<u8>>() {
            return Cell::Bytes(bytes);
        }
    }
    if let Ok(i) = value.extract::<i64>() {
        return Cell::Int(i);
    }
    if let Ok(f) = value.extract::<f64>() {
        return Cell::Float(f);
    }
    if let Ok(s) = value.extract::<String>() {
        return Cell::Str(s);
    }
    if value.hasattr("isoformat").unwrap_or(false) {
        if let Ok(iso) = value.call_method0("isoformat") {
            let iso = iso.to_string();
            if value.hasattr("hour").unwrap_or(false) {
                if let Some(ts) = parse_iso_datetime(&iso) {
                    return Cell::Timestamp(ts);
                }
            } else if let Ok(date) = NaiveDate::parse_from_str(&iso, "%Y-%m-%d") {
                return Cell::Date(date);
            }
            return Cell::Str(iso);
        }
    }
    match value.str() {
        Ok(rendered) => Cell::Str(rendered.to_string()),
        Err(_) => Cell::Null,
    }
}

fn parse_iso_datetime(iso: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(iso) {
        return Some(dt.naive_utc());
    }
    NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S%.f").ok()
}

/// The `ctx` object handed to user scripts: a thin bridge into the session's
/// analytical context.
#[pyclass]
struct SessionHandle {
    ctx: Arc<RequestContext>,
    handle: Handle,
}

#[pymethods]
impl SessionHandle {
    /// Runs SQL in the session context and returns the rows as a list of
    /// dicts.
    fn sql(&self, py: Python<'_>, query: &str) -> PyResult<Py<PyAny>> {
        let batches = self
            .handle
            .block_on(self.ctx.session.context.collect(query))
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        let rows = batches_to_json_rows(&batches)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        let list = PyList::empty(py);
        for row in &rows {
            list.append(json_to_py(py, row)?)?;
        }
        Ok(list.into_any().unbind())
    }

    /// Alias of [`SessionHandle::sql`] for scripts written against cursor-style
    /// APIs.
    fn execute(&self, py: Python<'_>, query: &str) -> PyResult<Py<PyAny>> {
        self.sql(py, query)
    }

    /// Registers a list of records as a named table in the session context.
    fn register(&self, _py: Python<'_>, name: &str, rows: Bound<'_, PyAny>) -> PyResult<()> {
        let records = extract_records(&rows).map_err(PyRuntimeError::new_err)?;
        let (schema, batches) =
            records_to_batches(&records).map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        self.ctx
            .session
            .context
            .register_batches(name, schema, batches)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        self.ctx.mark_side_effects();
        Ok(())
    }
}

/// The overridden `print`: every call lands on the request's log queue (and
/// the captured-stdout buffer) instead of the server's stdout.
#[pyclass]
struct PrintCapture {
    ctx: Arc<RequestContext>,
}

#[pymethods]
impl PrintCapture {
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__(
        &self,
        args: &Bound<'_, PyTuple>,
        kwargs: Option<&Bound<'_, PyDict>>,
    ) -> PyResult<()> {
        let get_kwarg = |key: &str, default: &str| -> String {
            kwargs
                .and_then(|k| k.get_item(key).ok().flatten())
                .and_then(|v| v.extract::<String>().ok())
                .unwrap_or_else(|| default.to_string())
        };
        let sep = get_kwarg("sep", " ");
        let end = get_kwarg("end", "\n");

        let mut parts = Vec::with_capacity(args.len());
        for arg in args.iter() {
            parts.push(arg.str()?.to_string());
        }
        let message = format!("{}{end}", parts.join(&sep));
        self.ctx.push_log(LogLine::Stdout(message));
        Ok(())
    }
}

fn batches_to_json_rows(
    batches: &[arrow::array::RecordBatch],
) -> Result<Vec<serde_json::Value>, Box<dyn std::error::Error + Send + Sync>> {
    let buf = Vec::new();
    let mut writer = arrow_json::ArrayWriter::new(buf);
    writer.write_batches(batches.iter().collect::<Vec<_>>().as_slice())?;
    writer.finish()?;
    let rendered = writer.into_inner();
    if rendered.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_slice(&rendered)?)
}

fn json_to_py<'py>(py: Python<'py>, value: &serde_json::Value) -> PyResult<Bound<'py, PyAny>> {
    match value {
        serde_json::Value::Null => Ok(py.None().into_bound(py)),
        serde_json::Value::Bool(b) => Ok(b.into_pyobject(py)?.to_owned().into_any()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i.into_pyobject(py)?.into_any())
            } else {
                Ok(n.as_f64().unwrap_or(f64::NAN).into_pyobject(py)?.into_any())
            }
        }
        serde_json::Value::String(s) => Ok(s.as_str().into_pyobject(py)?.into_any()),
        serde_json::Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            Ok(list.into_any())
        }
        serde_json::Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            Ok(dict.into_any())
        }
    }
}

fn dedent(code: &str) -> String {
    let min_indent = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    code.lines()
        .map(|line| {
            if line.len() >= min_indent {
                &line[min_indent..]
            } else {
                line.trim_start()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn indent(code: &str, prefix: &str) -> String {
    code.lines()
        .map(|line| {
            if line.trim().is_empty() {
                line.to_string()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
