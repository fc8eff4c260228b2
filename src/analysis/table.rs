//! Tabular data loaded into an analysis session.
//!
//! Tables come from scraped HTML, CSV files, or literal rows supplied by the
//! plan. Cells are typed on load so SQL comparisons and aggregates behave
//! numerically.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{Connection, ToSql};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use thiserror::Error;

static FOOTNOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]").expect("valid footnote regex"));

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(\d{1,3}(,\d{3})+|\d+)?(\.\d+)?([eE][-+]?\d+)?$").expect("valid number regex")
});

static NON_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid identifier regex"));

/// Errors building or loading a table.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("no <table> at index {index} (page has {found})")]
    TableNotFound { index: usize, found: usize },
    #[error("table has no columns")]
    NoColumns,
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("HTML selector error: {0}")]
    Selector(String),
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    /// Type a raw text cell.
    ///
    /// Footnote markers, currency symbols, thousands separators and a
    /// trailing `%` are stripped before trying a numeric parse; text that is
    /// not numeric keeps its original (footnote-free) form.
    pub fn parse(raw: &str) -> Self {
        let text = FOOTNOTE.replace_all(raw, "");
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return Cell::Null;
        }

        let candidate = text
            .trim_start_matches(['$', '€', '£'])
            .trim_end_matches('%')
            .trim();
        let has_digit = candidate.bytes().any(|b| b.is_ascii_digit());
        if has_digit && NUMBER.is_match(candidate) {
            let plain = candidate.replace(',', "");
            if let Ok(i) = plain.parse::<i64>() {
                return Cell::Integer(i);
            }
            if let Ok(f) = plain.parse::<f64>() {
                if f.is_finite() {
                    return Cell::Real(f);
                }
            }
        }

        Cell::Text(text)
    }

    /// Convert a JSON value from a plan's literal rows.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Integer(i64::from(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(Cell::Integer)
                .or_else(|| n.as_f64().map(Cell::Real))
                .unwrap_or(Cell::Null),
            Value::String(s) => Cell::parse(s),
            other => Cell::Text(other.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Integer(i) => Some(*i as f64),
            Cell::Real(f) => Some(*f),
            _ => None,
        }
    }
}

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Owned(match self {
            Cell::Null => SqlValue::Null,
            Cell::Integer(i) => SqlValue::Integer(*i),
            Cell::Real(f) => SqlValue::Real(*f),
            Cell::Text(s) => SqlValue::Text(s.clone()),
        }))
    }
}

/// Turn arbitrary header text into a SQL identifier.
///
/// Lower-cases, replaces every run of non-alphanumerics with `_`, and
/// prefixes names that would start with a digit.
pub fn sanitize_identifier(raw: &str) -> String {
    let stripped = FOOTNOTE.replace_all(raw, "").to_lowercase();
    let ident = NON_IDENT.replace_all(&stripped, "_");
    let ident = ident.trim_matches('_');
    if ident.starts_with(|c: char| c.is_ascii_digit()) {
        format!("c_{}", ident)
    } else {
        ident.to_string()
    }
}

/// An in-memory table ready to load into SQLite.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    /// Build a table from header text and typed rows.
    ///
    /// Rows shorter than the header are padded with nulls; longer rows are
    /// truncated.
    pub fn new(name: &str, headers: &[String], rows: Vec<Vec<Cell>>) -> Result<Self, TableError> {
        if headers.is_empty() {
            return Err(TableError::NoColumns);
        }

        let mut seen = HashSet::new();
        let columns: Vec<String> = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                let base = match sanitize_identifier(header) {
                    s if s.is_empty() => format!("col_{}", i + 1),
                    s => s,
                };
                let mut candidate = base.clone();
                let mut n = 2;
                while !seen.insert(candidate.clone()) {
                    candidate = format!("{}_{}", base, n);
                    n += 1;
                }
                candidate
            })
            .collect();

        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, Cell::Null);
                row
            })
            .collect();

        Ok(Self {
            name: name.to_string(),
            columns,
            rows,
        })
    }

    /// Build a table from raw text cells.
    pub fn from_text_rows(
        name: &str,
        headers: &[String],
        rows: Vec<Vec<String>>,
    ) -> Result<Self, TableError> {
        let typed = rows
            .into_iter()
            .filter(|row| row.iter().any(|c| !c.trim().is_empty()))
            .map(|row| row.iter().map(|c| Cell::parse(c)).collect())
            .collect();
        Self::new(name, headers, typed)
    }

    /// Parse CSV bytes; the first record is the header.
    pub fn from_csv(name: &str, data: &[u8]) -> Result<Self, TableError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(data);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }
        Self::from_text_rows(name, &headers, rows)
    }

    /// Parse the `index`-th `<table>` of an HTML document.
    ///
    /// The header is the first row containing `<th>` cells (or the first row
    /// when there are none); every following row becomes data.
    pub fn from_html(name: &str, html: &str, index: usize) -> Result<Self, TableError> {
        let document = Html::parse_document(html);
        let table_sel = selector("table")?;
        let row_sel = selector("tr")?;
        let cell_sel = selector("th, td")?;
        let th_sel = selector("th")?;

        let tables: Vec<ElementRef> = document.select(&table_sel).collect();
        let table = tables.get(index).ok_or(TableError::TableNotFound {
            index,
            found: tables.len(),
        })?;

        let rows: Vec<ElementRef> = table
            .select(&row_sel)
            .filter(|row| owning_table(*row) == Some(*table))
            .collect();
        let header_pos = rows
            .iter()
            .position(|row| row.select(&th_sel).next().is_some())
            .unwrap_or(0);

        let cells_of = |row: &ElementRef| -> Vec<String> {
            row.select(&cell_sel)
                .map(|cell| cell.text().collect::<Vec<_>>().join(" "))
                .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
                .collect()
        };

        let headers = rows.get(header_pos).map(cells_of).unwrap_or_default();
        let data = rows.iter().skip(header_pos + 1).map(cells_of).collect();
        Self::from_text_rows(name, &headers, data)
    }

    /// Build a table from a plan's literal `columns`/`rows`.
    pub fn from_json_rows(
        name: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<Self, TableError> {
        let typed = rows
            .iter()
            .map(|row| row.iter().map(Cell::from_json).collect())
            .collect();
        Self::new(name, columns, typed)
    }

    /// Create (or replace) this table in the session database.
    pub fn load_into(&self, conn: &mut Connection) -> Result<(), TableError> {
        let column_list = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; self.columns.len()].join(", ");

        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {name}; CREATE TABLE {name} ({columns});",
            name = quote_ident(&self.name),
            columns = column_list
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(&self.name),
                placeholders
            ))?;
            for row in &self.rows {
                stmt.execute(rusqlite::params_from_iter(row.iter()))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// One-line schema description for prompts.
    pub fn describe(&self) -> String {
        format!(
            "{}({}) with {} rows",
            self.name,
            self.columns.join(", "),
            self.rows.len()
        )
    }
}

fn selector(s: &str) -> Result<Selector, TableError> {
    Selector::parse(s).map_err(|e| TableError::Selector(e.to_string()))
}

/// Nearest enclosing `<table>` of a row, so nested tables don't leak rows.
fn owning_table(row: ElementRef<'_>) -> Option<ElementRef<'_>> {
    row.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "table")
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_parse() {
        assert_eq!(Cell::parse("  "), Cell::Null);
        assert_eq!(Cell::parse("42"), Cell::Integer(42));
        assert_eq!(Cell::parse("$2,923,706,026"), Cell::Integer(2_923_706_026));
        assert_eq!(Cell::parse("1,234.5"), Cell::Real(1234.5));
        assert_eq!(Cell::parse("12.5%"), Cell::Real(12.5));
        assert_eq!(Cell::parse("1997[12]"), Cell::Integer(1997));
        assert_eq!(Cell::parse("-3"), Cell::Integer(-3));
        assert_eq!(Cell::parse("Titanic[a]"), Cell::Text("Titanic".into()));
        assert_eq!(Cell::parse("1,2,3"), Cell::Text("1,2,3".into()));
        assert_eq!(Cell::parse("inf"), Cell::Text("inf".into()));
        assert_eq!(Cell::parse("T2257"), Cell::Text("T2257".into()));
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Worldwide gross ($)"), "worldwide_gross");
        assert_eq!(sanitize_identifier("Peak[1]"), "peak");
        assert_eq!(sanitize_identifier("2019 Rank"), "c_2019_rank");
        assert_eq!(sanitize_identifier("---"), "");
    }

    #[test]
    fn test_columns_deduplicated_and_rows_padded() {
        let headers = vec!["Year".to_string(), "year".to_string(), "".to_string()];
        let table = Table::new(
            "t",
            &headers,
            vec![
                vec![Cell::Integer(1)],
                vec![Cell::Integer(1), Cell::Null, Cell::Null, Cell::Integer(9)],
            ],
        )
        .unwrap();
        assert_eq!(table.columns, vec!["year", "year_2", "col_3"]);
        assert!(table.rows.iter().all(|r| r.len() == 3));
    }

    #[test]
    fn test_from_html_picks_header_row() {
        let html = r#"
            <html><body>
            <table><tr><td>layout</td></tr></table>
            <table class="wikitable">
              <caption>Highest-grossing films</caption>
              <tr><th>Rank</th><th>Title</th><th>Worldwide gross</th><th>Year</th></tr>
              <tr><td>1</td><td>Avatar</td><td>$2,923,706,026</td><td>2009</td></tr>
              <tr><td>2</td><td>Avengers: Endgame</td><td>$2,797,501,328</td><td>2019</td></tr>
              <tr><td>3</td><td>Titanic<sup>[a]</sup></td><td>$2,264,743,305</td><td>1997</td></tr>
            </table>
            </body></html>"#;

        let table = Table::from_html("films", html, 1).unwrap();
        assert_eq!(table.columns, vec!["rank", "title", "worldwide_gross", "year"]);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[2][1], Cell::Text("Titanic".into()));
        assert_eq!(table.rows[0][2], Cell::Integer(2_923_706_026));

        assert!(matches!(
            Table::from_html("x", html, 5),
            Err(TableError::TableNotFound { index: 5, found: 2 })
        ));
    }

    #[test]
    fn test_from_csv_and_load() {
        let csv = b"name,score\nalice,10\nbob,12.5\n,\n";
        let table = Table::from_csv("scores", csv).unwrap();
        assert_eq!(table.rows.len(), 2);

        let mut conn = Connection::open_in_memory().unwrap();
        table.load_into(&mut conn).unwrap();
        let total: f64 = conn
            .query_row("SELECT SUM(score) FROM scores", [], |r| r.get(0))
            .unwrap();
        assert_eq!(total, 22.5);
    }

    #[test]
    fn test_from_json_rows() {
        let rows = vec![vec![json!(1), json!("x")], vec![json!(2.5), json!(null)]];
        let table =
            Table::from_json_rows("t", &["a".to_string(), "b".to_string()], &rows).unwrap();
        assert_eq!(table.rows[1], vec![Cell::Real(2.5), Cell::Null]);
        assert_eq!(table.describe(), "t(a, b) with 2 rows");
    }
}
