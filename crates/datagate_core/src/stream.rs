//! Chunked response streaming.
//!
//! [`ChunkedStream`] pulls backend rows lazily, projects them into records
//! and yields the rendered body in chunks of at most `chunk_size` rows.
//! Cancellation is observed between chunks: the row iterator and the read
//! transaction are dropped and the stream ends.

use crate::backends::{RowStream, Transaction};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::format::Format;
use crate::types::Row;
use crate::ufunc::page::cursor_after;
use crate::ufunc::Query;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Default rows per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// Shared flag a client connection sets when it goes away.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels every stream holding a clone of this token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

fn flatten_into(out: &mut Vec<(String, Value)>, prefix: &str, value: &Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, inner) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, &name, inner);
            }
        }
        other => out.push((prefix.to_string(), other.clone())),
    }
}

fn flatten(record: &Row) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in record {
        flatten_into(&mut out, key, value);
    }
    out
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn cells(header: &[String], record: &Row) -> Vec<String> {
    let flat: Map<String, Value> = flatten(record).into_iter().collect();
    header
        .iter()
        .map(|h| flat.get(h).map(cell).unwrap_or_default())
        .collect()
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

fn html_cell(value: &Value) -> String {
    match value {
        Value::Object(map) if map.contains_key("link") => {
            let text = map.get("value").map(cell).unwrap_or_default();
            match map.get("link").and_then(Value::as_str) {
                Some(link) => format!("<a href=\"{}\">{}</a>", escape_html(link), escape_html(&text)),
                None => escape_html(&text),
            }
        }
        other => escape_html(&cell(other)),
    }
}

/// Renders records of one format piece by piece.
#[derive(Debug)]
enum Renderer {
    Json,
    Jsonl,
    Csv { header: Option<Vec<String>> },
    Ascii { header: Option<Vec<String>>, widths: Vec<usize> },
    Html { header: Option<Vec<String>> },
}

impl Renderer {
    fn new(format: Format) -> CoreResult<Self> {
        Ok(match format {
            Format::Json => Self::Json,
            Format::Jsonl => Self::Jsonl,
            Format::Csv => Self::Csv { header: None },
            Format::Ascii => Self::Ascii {
                header: None,
                widths: Vec::new(),
            },
            Format::Html => Self::Html { header: None },
            Format::RdfXml => {
                return Err(ErrorKind::UnsupportedMediaType
                    .err()
                    .with("given", format.content_type())
                    .into())
            }
        })
    }

    fn open(&self) -> String {
        match self {
            Self::Json => "{\"_data\":[".to_string(),
            Self::Html { .. } => "<table>\n".to_string(),
            _ => String::new(),
        }
    }

    fn chunk(&mut self, records: &[Row], first: bool) -> CoreResult<String> {
        let mut out = String::new();
        match self {
            Self::Json => {
                for (i, record) in records.iter().enumerate() {
                    if !(first && i == 0) {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(record)?);
                }
            }
            Self::Jsonl => {
                for record in records {
                    out.push_str(&serde_json::to_string(record)?);
                    out.push('\n');
                }
            }
            Self::Csv { header } => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                for record in records {
                    if header.is_none() {
                        let names: Vec<String> = flatten(record).into_iter().map(|(k, _)| k).collect();
                        writer.write_record(&names).map_err(csv_error)?;
                        *header = Some(names);
                    }
                    if let Some(header) = header.as_deref() {
                        writer.write_record(cells(header, record)).map_err(csv_error)?;
                    }
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| CoreError::internal(e.to_string()))?;
                out.push_str(&String::from_utf8_lossy(&bytes));
            }
            Self::Ascii { header, widths } => {
                if header.is_none() {
                    if let Some(record) = records.first() {
                        let names: Vec<String> = flatten(record).into_iter().map(|(k, _)| k).collect();
                        *widths = names.iter().map(|n| n.chars().count()).collect();
                        for record in records {
                            for (w, c) in widths.iter_mut().zip(cells(&names, record)) {
                                *w = (*w).max(c.chars().count());
                            }
                        }
                        push_ascii_line(&mut out, &names, widths);
                        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
                        push_ascii_line(&mut out, &rule, widths);
                        *header = Some(names);
                    }
                }
                if let Some(header) = header.as_deref() {
                    for record in records {
                        push_ascii_line(&mut out, &cells(header, record), widths);
                    }
                }
            }
            Self::Html { header } => {
                for record in records {
                    let flat = flatten_html(record);
                    if header.is_none() {
                        let names: Vec<String> = flat.iter().map(|(k, _)| k.clone()).collect();
                        out.push_str("<tr>");
                        for name in &names {
                            out.push_str(&format!("<th>{}</th>", escape_html(name)));
                        }
                        out.push_str("</tr>\n");
                        *header = Some(names);
                    }
                    if let Some(header) = header.as_deref() {
                        let values: Map<String, Value> = flat.into_iter().collect();
                        out.push_str("<tr>");
                        for name in header {
                            let value = values.get(name).unwrap_or(&Value::Null);
                            out.push_str(&format!("<td>{}</td>", html_cell(value)));
                        }
                        out.push_str("</tr>\n");
                    }
                }
            }
        }
        Ok(out)
    }

    fn close(&self, page: Option<&Value>) -> String {
        match self {
            Self::Json => match page {
                Some(page) => format!("],\"_page\":{page}}}"),
                None => "]}".to_string(),
            },
            Self::Html { .. } => "</table>\n".to_string(),
            _ => String::new(),
        }
    }
}

/// Like [`flatten`], but keeps `{value, link}` geometry cells whole.
fn flatten_html(record: &Row) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    for (key, value) in record {
        match value {
            Value::Object(map) if map.contains_key("link") => out.push((key.clone(), value.clone())),
            other => flatten_into(&mut out, key, other),
        }
    }
    out
}

fn push_ascii_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(c, w)| format!("{c:<w$}"))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

/// Projection passing rows through unchanged.
///
/// # Errors
///
/// Never fails.
pub fn as_is(row: &Row) -> CoreResult<Row> {
    Ok(row.clone())
}

fn csv_error(err: csv::Error) -> CoreError {
    CoreError::internal(format!("csv output: {err}"))
}

/// A response body produced chunk by chunk from a backend row stream.
pub struct ChunkedStream<'a> {
    rows: Option<RowStream>,
    txn: Option<Transaction>,
    project: Box<dyn FnMut(&Row) -> CoreResult<Row> + Send + 'a>,
    renderer: Renderer,
    chunk_size: usize,
    cancel: CancelToken,
    paging: Option<Query>,
    last: Option<Row>,
    seen: usize,
    started: bool,
    done: bool,
}

impl<'a> ChunkedStream<'a> {
    /// Streams `rows` rendered as `format`, projecting every row with
    /// `project`.
    ///
    /// # Errors
    ///
    /// `UnsupportedMediaType` for formats that cannot be streamed.
    pub fn new(
        rows: RowStream,
        format: Format,
        project: impl FnMut(&Row) -> CoreResult<Row> + Send + 'a,
    ) -> CoreResult<Self> {
        Ok(Self {
            rows: Some(rows),
            txn: None,
            project: Box::new(project),
            renderer: Renderer::new(format)?,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: CancelToken::new(),
            paging: None,
            last: None,
            seen: 0,
            started: false,
            done: false,
        })
    }

    /// Rows per chunk, at least one.
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Observes `token` between chunks.
    #[must_use]
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Keeps the read transaction open until the stream ends.
    #[must_use]
    pub fn hold(mut self, txn: Transaction) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Appends `_page.next` to JSON output for a paged query.
    #[must_use]
    pub fn paged(mut self, query: &Query) -> Self {
        if query.page.is_some() {
            self.paging = Some(query.clone());
        }
        self
    }

    /// Whether the stream was cut short by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drains the stream into one string.
    ///
    /// # Errors
    ///
    /// The first row or rendering error.
    pub fn collect_string(self) -> CoreResult<String> {
        self.collect::<CoreResult<Vec<String>>>().map(|parts| parts.concat())
    }

    fn release(&mut self) {
        self.rows = None;
        if let Some(txn) = self.txn.take() {
            debug!(txn = %txn.id().as_str(), rows = self.seen, "stream released");
        }
        self.done = true;
    }

    fn next_chunk(&mut self) -> CoreResult<Option<String>> {
        let Some(rows) = self.rows.as_mut() else {
            return Ok(None);
        };
        let mut records = Vec::with_capacity(self.chunk_size);
        for row in rows.by_ref() {
            let row = row?;
            records.push((self.project)(&row)?);
            self.seen += 1;
            if self.paging.is_some() {
                self.last = Some(row);
            }
            if records.len() == self.chunk_size {
                break;
            }
        }
        let exhausted = records.len() < self.chunk_size;
        let first = !self.started;
        let mut out = if first { self.renderer.open() } else { String::new() };
        self.started = true;
        out.push_str(&self.renderer.chunk(&records, first)?);
        if exhausted {
            let page = self.page();
            out.push_str(&self.renderer.close(page.as_ref()));
            self.release();
        }
        Ok(Some(out))
    }

    fn page(&self) -> Option<Value> {
        let query = self.paging.as_ref()?;
        let full = query.row_limit() == Some(self.seen);
        let next = self
            .last
            .as_ref()
            .filter(|_| full)
            .and_then(|last| cursor_after(query, last));
        Some(json!({ "next": next }))
    }
}

impl Iterator for ChunkedStream<'_> {
    type Item = CoreResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            debug!(rows = self.seen, "stream cancelled");
            self.release();
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.release();
                None
            }
            Err(e) => {
                self.release();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(n: usize) -> RowStream {
        Box::new((0..n).map(|i| {
            let mut row = Row::new();
            row.insert("_id".into(), Value::from(format!("r{i}")));
            row.insert("n".into(), Value::from(i));
            Ok(row)
        }))
    }

    #[test]
    fn json_chunks_join_into_one_document() {
        let stream = ChunkedStream::new(rows(5), Format::Json, as_is)
            .unwrap()
            .chunk_size(2);
        let chunks: Vec<String> = stream.map(Result::unwrap).collect();
        assert_eq!(chunks.len(), 3);
        let body: Value = serde_json::from_str(&chunks.concat()).unwrap();
        assert_eq!(body["_data"].as_array().unwrap().len(), 5);
        assert_eq!(body["_data"][4]["n"], 4);
    }

    #[test]
    fn empty_streams_are_valid_documents() {
        let body = ChunkedStream::new(rows(0), Format::Json, as_is)
            .unwrap()
            .collect_string()
            .unwrap();
        assert_eq!(body, r#"{"_data":[]}"#);
    }

    #[test]
    fn cancellation_stops_at_a_chunk_boundary() {
        let token = CancelToken::new();
        let mut stream = ChunkedStream::new(rows(10), Format::Jsonl, as_is)
            .unwrap()
            .chunk_size(3)
            .cancel_token(token.clone());
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first.lines().count(), 3);
        token.cancel();
        assert!(stream.next().is_none());
        assert!(stream.is_cancelled());
        assert!(stream.next().is_none());
    }

    #[test]
    fn csv_flattens_nested_values() {
        let nested: RowStream = Box::new(std::iter::once(Ok(serde_json::from_str::<Row>(
            r#"{"_id":"a","city":{"_id":"c1"},"tags":["x","y"],"note":null}"#,
        )
        .unwrap())));
        let body = ChunkedStream::new(nested, Format::Csv, as_is)
            .unwrap()
            .collect_string()
            .unwrap();
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some("_id,city._id,tags,note"));
        assert_eq!(lines.next(), Some(r#"a,c1,"[""x"",""y""]","#));
    }

    #[test]
    fn ascii_pads_columns() {
        let body = ChunkedStream::new(rows(2), Format::Ascii, as_is)
            .unwrap()
            .collect_string()
            .unwrap();
        assert_eq!(body, "_id  n\n---  -\nr0   0\nr1   1\n");
    }

    #[test]
    fn html_links_geometry_cells() {
        let row: Row = serde_json::from_value(json!({
            "place": {"value": "POINT (1 2)", "link": "https://osm/?a=1&b=2"},
        }))
        .unwrap();
        let body = ChunkedStream::new(Box::new(std::iter::once(Ok(row))), Format::Html, as_is)
            .unwrap()
            .collect_string()
            .unwrap();
        assert!(body.contains(r#"<a href="https://osm/?a=1&amp;b=2">POINT (1 2)</a>"#));
    }

    #[test]
    fn rdf_is_not_streamed() {
        let err = ChunkedStream::new(rows(1), Format::RdfXml, as_is).err().unwrap();
        assert_eq!(err.code(), "UnsupportedMediaType");
    }

    #[test]
    fn row_errors_end_the_stream() {
        let failing: RowStream = Box::new(
            vec![
                Ok(Row::new()),
                Err(CoreError::backend("default", "connection lost")),
            ]
            .into_iter(),
        );
        let mut stream = ChunkedStream::new(failing, Format::Jsonl, as_is).unwrap();
        assert_eq!(stream.next().unwrap().unwrap_err().code(), "BackendError");
        assert!(stream.next().is_none());
    }
}
