//! Plan execution against a per-request SQLite session.
//!
//! SQLite work, table parsing and chart rendering run on the blocking pool.
//! A session opened with a deadline interrupts any statement still running
//! once the deadline passes.

use std::collections::BTreeMap;
use std::ffi::c_int;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::Engine;
use reqwest::Client;
use rusqlite::fallible_iterator::FallibleIterator;
use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection, Statement};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::plan::{is_valid_name, Plan, PlotKind, Step};
use super::plot::{render_plot, PlotError};
use super::table::{Cell, Table, TableError};

/// SQLite VM instructions between deadline checks.
const DEADLINE_CHECK_OPS: c_int = 1_000;

/// Why a single step failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error(transparent)]
    Plot(#[from] PlotError),
    #[error("{0}")]
    Column(String),
    #[error("analysis worker failed: {0}")]
    Worker(String),
}

/// Errors executing a plan.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to open analysis session: {0}")]
    Session(#[from] rusqlite::Error),
    #[error("failed to load table '{name}': {source}")]
    Load { name: String, source: StepError },
    #[error("step {} ({op}) failed: {source}", .index + 1)]
    Step {
        index: usize,
        op: &'static str,
        source: StepError,
    },
    #[error("execution deadline passed")]
    TimedOut,
    #[error("result references unknown binding '${0}'")]
    UnknownReference(String),
}

/// Runs the steps of a plan in order and assembles the result.
pub struct PlanExecutor {
    conn: Arc<Mutex<Connection>>,
    http: Client,
    bindings: BTreeMap<String, Value>,
    deadline: Option<Instant>,
}

impl PlanExecutor {
    /// Open a fresh in-memory session.
    pub fn new(http: Client) -> Result<Self, ExecutionError> {
        Self::open(http, None)
    }

    /// Open a session whose SQL is interrupted once `deadline` passes.
    pub fn with_deadline(http: Client, deadline: Instant) -> Result<Self, ExecutionError> {
        Self::open(http, Some(deadline))
    }

    fn open(http: Client, deadline: Option<Instant>) -> Result<Self, ExecutionError> {
        let conn = Connection::open_in_memory()?;
        if let Some(deadline) = deadline {
            conn.progress_handler(
                DEADLINE_CHECK_OPS,
                Some(move || Instant::now() >= deadline),
            );
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            http,
            bindings: BTreeMap::new(),
            deadline,
        })
    }

    /// Preload a table (e.g. an uploaded attachment) before running a plan.
    pub async fn load_table(&mut self, table: Table) -> Result<(), ExecutionError> {
        let name = table.name.clone();
        match self.blocking(move |conn| load_into(conn, &table)).await {
            Ok(rows) => {
                self.bindings.insert(name, Value::from(rows));
                Ok(())
            }
            Err(_) if self.expired() => Err(ExecutionError::TimedOut),
            Err(source) => Err(ExecutionError::Load { name, source }),
        }
    }

    /// Execute every step, stopping at the first failure.
    ///
    /// With a null result template the named bindings are returned as an
    /// object. A step that fails after the deadline reports `TimedOut`.
    pub async fn run(mut self, plan: &Plan) -> Result<Value, ExecutionError> {
        for (index, step) in plan.steps.iter().enumerate() {
            debug!(step = index + 1, op = step.op(), "Executing plan step");
            let value = match self.execute(step).await {
                Ok(value) => value,
                Err(_) if self.expired() => return Err(ExecutionError::TimedOut),
                Err(source) => {
                    return Err(ExecutionError::Step {
                        index,
                        op: step.op(),
                        source,
                    })
                }
            };
            if let Some(name) = step.binding() {
                self.bindings.insert(name.to_string(), value);
            }
        }
        info!(steps = plan.steps.len(), "Plan executed");

        if plan.result.is_null() {
            return Ok(Value::Object(self.bindings.into_iter().collect()));
        }
        substitute(&plan.result, &self.bindings)
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn execute(&mut self, step: &Step) -> Result<Value, StepError> {
        match step {
            Step::ScrapeTable { url, name, index } => {
                let html = fetch(&self.http, url).await?.text().await.map_err(fetch_err)?;
                let (name, index) = (name.clone(), *index);
                self.blocking(move |conn| {
                    let table = Table::from_html(&name, &html, index)?;
                    load_into(conn, &table).map(Value::from)
                })
                .await
            }
            Step::FetchCsv { url, name } => {
                let bytes = fetch(&self.http, url).await?.bytes().await.map_err(fetch_err)?;
                let name = name.clone();
                self.blocking(move |conn| {
                    let table = Table::from_csv(&name, &bytes)?;
                    load_into(conn, &table).map(Value::from)
                })
                .await
            }
            Step::Data {
                name,
                columns,
                rows,
            } => {
                let table = Table::from_json_rows(name, columns, rows)?;
                self.blocking(move |conn| load_into(conn, &table).map(Value::from))
                    .await
            }
            Step::Sql { query, .. } => {
                let query = query.clone();
                self.blocking(move |conn| run_sql(conn, &query)).await
            }
            Step::Plot {
                query,
                x,
                y,
                kind,
                regression,
                title,
                ..
            } => {
                if let Some(title) = title {
                    debug!(title = %title, "Rendering plot");
                }
                let (query, x, y) = (query.clone(), x.clone(), y.clone());
                let (kind, regression) = (*kind, *regression);
                self.blocking(move |conn| {
                    let points = plot_points(conn, &query, &x, &y, kind)?;
                    Ok(Value::String(render_plot(kind, &points, regression)?))
                })
                .await
            }
        }
    }

    /// Run `work` against the session on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> Result<T, StepError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StepError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StepError::Worker("analysis session lock poisoned".into()))?;
            work(&mut *guard)
        })
        .await
        .map_err(|e| StepError::Worker(e.to_string()))?
    }
}

fn load_into(conn: &mut Connection, table: &Table) -> Result<usize, StepError> {
    debug!(table = %table.describe(), "Loading table");
    table.load_into(conn)?;
    Ok(table.rows.len())
}

/// Run a SQL script statement by statement and return the last result.
///
/// Queries give a scalar for 1x1 results and a list of row objects
/// otherwise; statements without result columns give null.
fn run_sql(conn: &Connection, sql: &str) -> Result<Value, StepError> {
    let mut batch = Batch::new(conn, sql);
    let mut last = Value::Null;
    while let Some(mut stmt) = batch.next()? {
        last = if stmt.column_count() == 0 {
            stmt.execute([])?;
            Value::Null
        } else {
            collect_rows(&mut stmt)?
        };
    }
    Ok(last)
}

fn collect_rows(stmt: &mut Statement<'_>) -> Result<Value, StepError> {
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Map::new();
        for (i, col) in columns.iter().enumerate() {
            obj.insert(col.clone(), sql_to_json(row.get_ref(i)?));
        }
        out.push(obj);
    }

    if columns.len() == 1 && out.len() == 1 {
        return Ok(out
            .pop()
            .and_then(|mut obj| obj.remove(&columns[0]))
            .unwrap_or(Value::Null));
    }
    Ok(Value::Array(out.into_iter().map(Value::Object).collect()))
}

/// Collect (x, y) pairs for a chart. Bar charts with non-numeric x use
/// the row position instead.
fn plot_points(
    conn: &Connection,
    sql: &str,
    x: &str,
    y: &str,
    kind: PlotKind,
) -> Result<Vec<(f64, f64)>, StepError> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let position = |wanted: &str| {
        names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                StepError::Column(format!(
                    "query has no column '{}' (columns: {})",
                    wanted,
                    names.join(", ")
                ))
            })
    };
    let (xi, yi) = (position(x)?, position(y)?);

    let mut raw = Vec::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        raw.push((number(row.get_ref(xi)?), number(row.get_ref(yi)?)));
    }

    let categorical = kind == PlotKind::Bar && raw.iter().any(|(x, _)| x.is_none());
    Ok(raw
        .into_iter()
        .enumerate()
        .filter_map(|(i, (x, y))| {
            let x = if categorical { Some(i as f64) } else { x };
            Some((x?, y?))
        })
        .collect())
}

/// GET an http(s) URL, failing on non-success statuses.
async fn fetch(http: &Client, url: &str) -> Result<reqwest::Response, StepError> {
    let parsed = Url::parse(url)
        .map_err(|e| StepError::Fetch(format!("invalid URL '{}': {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(StepError::Fetch(format!(
            "unsupported URL scheme '{}'",
            parsed.scheme()
        )));
    }

    let resp = http.get(parsed).send().await.map_err(fetch_err)?;
    if !resp.status().is_success() {
        return Err(StepError::Fetch(format!(
            "HTTP {} from {}",
            resp.status(),
            url
        )));
    }
    Ok(resp)
}

fn fetch_err(e: reqwest::Error) -> StepError {
    StepError::Fetch(e.to_string())
}

fn number(value: ValueRef<'_>) -> Option<f64> {
    match value {
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f),
        ValueRef::Text(t) => Cell::parse(&String::from_utf8_lossy(t)).as_f64(),
        _ => None,
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

/// Replace `"$name"` strings in the template with bound values.
fn substitute(template: &Value, bindings: &BTreeMap<String, Value>) -> Result<Value, ExecutionError> {
    match template {
        Value::String(s) => match s.strip_prefix('$') {
            Some(name) if is_valid_name(name) => bindings
                .get(name)
                .cloned()
                .ok_or_else(|| ExecutionError::UnknownReference(name.to_string())),
            _ => Ok(template.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), substitute(v, bindings)?)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn plan(value: Value) -> Plan {
        let plan: Plan = serde_json::from_value(value).unwrap();
        plan.validate().unwrap();
        plan
    }

    fn executor() -> PlanExecutor {
        PlanExecutor::new(Client::new()).unwrap()
    }

    #[tokio::test]
    async fn test_data_sql_and_result_template() {
        let plan = plan(json!({
            "steps": [
                {"op": "data", "name": "sales", "columns": ["region", "amount"],
                 "rows": [["north", 10], ["south", "$1,200"], ["east", 7.5]]},
                {"op": "sql", "query": "SELECT SUM(amount) FROM sales", "name": "total"},
                {"op": "sql", "query": "SELECT region, amount FROM sales ORDER BY amount DESC LIMIT 2", "name": "top"},
                {"op": "sql", "query": "SELECT region FROM sales WHERE amount > 1000", "name": "biggest"}
            ],
            "result": {"total": "$total", "top": "$top", "biggest": "$biggest", "note": "$5 flat"}
        }));

        let result = executor().run(&plan).await.unwrap();
        assert_eq!(result["total"], json!(1217.5));
        assert_eq!(result["top"][0], json!({"region": "south", "amount": 1200}));
        assert_eq!(result["biggest"], json!("south"));
        assert_eq!(result["note"], json!("$5 flat"));
    }

    #[tokio::test]
    async fn test_null_result_returns_bindings() {
        let plan = plan(json!({
            "steps": [
                {"op": "sql", "query": "CREATE TABLE t AS SELECT 1 AS x UNION ALL SELECT 2"},
                {"op": "sql", "query": "SELECT COUNT(*) FROM t", "name": "n"}
            ]
        }));
        assert_eq!(executor().run(&plan).await.unwrap(), json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_sql_script_runs_every_statement() {
        let plan = plan(json!({
            "steps": [
                {"op": "sql", "query": "CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (1), (2);", "name": "setup"},
                {"op": "sql", "query": "SELECT SUM(x) FROM t", "name": "total"},
                {"op": "sql", "query": "INSERT INTO t VALUES (10);\nSELECT MAX(x) FROM t;", "name": "max"}
            ],
            "result": ["$setup", "$total", "$max"]
        }));
        assert_eq!(executor().run(&plan).await.unwrap(), json!([null, 3, 10]));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_running_query() {
        let plan = plan(json!({
            "steps": [{"op": "sql", "name": "n", "query":
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 500000000) SELECT COUNT(*) FROM c"}],
            "result": "$n"
        }));
        let started = Instant::now();
        let exec =
            PlanExecutor::with_deadline(Client::new(), started + Duration::from_millis(100)).unwrap();

        assert!(matches!(exec.run(&plan).await, Err(ExecutionError::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failure_reports_step() {
        let plan = plan(json!({
            "steps": [
                {"op": "data", "name": "t", "columns": ["a"], "rows": [[1]]},
                {"op": "sql", "query": "SELECT missing FROM t", "name": "v"}
            ],
            "result": "$v"
        }));
        match executor().run(&plan).await {
            Err(ExecutionError::Step { index, op, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(op, "sql");
            }
            other => panic!("expected step failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_reference() {
        let plan = plan(json!({"steps": [], "result": ["$nothing"]}));
        assert!(matches!(
            executor().run(&plan).await,
            Err(ExecutionError::UnknownReference(name)) if name == "nothing"
        ));
    }

    #[tokio::test]
    async fn test_plot_from_query() {
        let plan = plan(json!({
            "steps": [
                {"op": "data", "name": "pts", "columns": ["rank", "peak"],
                 "rows": [[1, 1], [2, 3], [3, 2], [4, 5]]},
                {"op": "plot", "query": "SELECT rank, peak FROM pts", "x": "Rank", "y": "peak",
                 "regression": true, "name": "chart"},
                {"op": "data", "name": "cats", "columns": ["label", "n"], "rows": [["a", 3], ["b", 4]]},
                {"op": "plot", "query": "SELECT label, n FROM cats", "x": "label", "y": "n",
                 "kind": "bar", "name": "bars"}
            ],
            "result": ["$chart", "$bars"]
        }));
        let result = executor().run(&plan).await.unwrap();
        for uri in result.as_array().unwrap() {
            assert!(uri.as_str().unwrap().starts_with("data:image/png;base64,"));
        }
    }

    #[tokio::test]
    async fn test_plot_missing_column() {
        let plan = plan(json!({
            "steps": [
                {"op": "data", "name": "t", "columns": ["a"], "rows": [[1]]},
                {"op": "plot", "query": "SELECT a FROM t", "x": "a", "y": "b", "name": "p"}
            ]
        }));
        let err = executor().run(&plan).await.unwrap_err();
        assert!(err.to_string().contains("no column 'b'"), "{err}");
    }

    #[tokio::test]
    async fn test_scrape_and_csv_over_http() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/films");
                then.status(200).header("content-type", "text/html").body(
                    "<table><tr><th>Title</th><th>Year</th></tr>\
                     <tr><td>A</td><td>1995</td></tr>\
                     <tr><td>B</td><td>2005</td></tr></table>",
                );
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/ratings.csv");
                then.status(200).body("title,rating\nA,7.5\nB,8.0\n");
            })
            .await;

        let plan = plan(json!({
            "steps": [
                {"op": "scrape_table", "url": server.url("/films"), "name": "films"},
                {"op": "fetch_csv", "url": server.url("/ratings.csv"), "name": "ratings"},
                {"op": "sql", "name": "old",
                 "query": "SELECT f.title FROM films f JOIN ratings r ON r.title = f.title WHERE f.year < 2000"}
            ],
            "result": {"old": "$old", "rows": "$films"}
        }));

        let result = executor().run(&plan).await.unwrap();
        assert_eq!(result, json!({"old": "A", "rows": 2}));
    }

    #[tokio::test]
    async fn test_rejects_non_http_urls() {
        let plan = plan(json!({
            "steps": [{"op": "fetch_csv", "url": "file:///etc/passwd", "name": "t"}]
        }));
        let err = executor().run(&plan).await.unwrap_err();
        assert!(err.to_string().contains("unsupported URL scheme"), "{err}");
    }

    #[tokio::test]
    async fn test_preloaded_attachment() {
        let mut exec = executor();
        let table = Table::from_csv("uploaded", b"x,y\n1,2\n3,4\n").unwrap();
        exec.load_table(table).await.unwrap();
        let plan = plan(json!({
            "steps": [{"op": "sql", "query": "SELECT MAX(y) FROM uploaded", "name": "m"}],
            "result": ["$m", "$uploaded"]
        }));
        assert_eq!(exec.run(&plan).await.unwrap(), json!([4, 2]));
    }
}
