//! Analysis plans returned by the LLM.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::llm::extract_json_value;

/// Chart kind for plot steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlotKind {
    #[default]
    Scatter,
    Line,
    Bar,
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Load an HTML table from a web page.
    ScrapeTable {
        url: String,
        name: String,
        #[serde(default)]
        index: usize,
    },
    /// Load a CSV file from a URL.
    FetchCsv { url: String, name: String },
    /// Load literal rows.
    Data {
        name: String,
        columns: Vec<String>,
        #[serde(default)]
        rows: Vec<Vec<Value>>,
    },
    /// Run a SQL statement.
    Sql {
        query: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// Render a chart from a query.
    Plot {
        query: String,
        x: String,
        y: String,
        #[serde(default)]
        kind: PlotKind,
        #[serde(default)]
        regression: bool,
        #[serde(default)]
        title: Option<String>,
        name: String,
    },
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::ScrapeTable { .. } => "scrape_table",
            Step::FetchCsv { .. } => "fetch_csv",
            Step::Data { .. } => "data",
            Step::Sql { .. } => "sql",
            Step::Plot { .. } => "plot",
        }
    }

    /// Name this step binds, if any.
    pub fn binding(&self) -> Option<&str> {
        match self {
            Step::ScrapeTable { name, .. }
            | Step::FetchCsv { name, .. }
            | Step::Data { name, .. }
            | Step::Plot { name, .. } => Some(name),
            Step::Sql { name, .. } => name.as_deref(),
        }
    }
}

/// Errors turning an LLM reply into a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("reply contains no JSON object")]
    NoJson,
    #[error("reply is not a valid plan: {0}")]
    Shape(#[from] serde_json::Error),
    #[error("plan has no steps and no result")]
    Empty,
    #[error("invalid binding name '{0}' (use letters, digits and '_', not starting with a digit)")]
    InvalidName(String),
    #[error("binding '{0}' is defined more than once")]
    DuplicateName(String),
}

/// A validated analysis plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Answer template; `"$name"` strings are replaced by bound values.
    #[serde(default)]
    pub result: Value,
}

impl Plan {
    /// Parse and validate a raw LLM reply.
    pub fn parse(reply: &str) -> Result<Self, PlanError> {
        let value = extract_json_value(reply).ok_or(PlanError::NoJson)?;
        let plan: Plan = serde_json::from_value(value)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        if self.steps.is_empty() && self.result.is_null() {
            return Err(PlanError::Empty);
        }

        let mut seen = HashSet::new();
        for name in self.steps.iter().filter_map(Step::binding) {
            if !is_valid_name(name) {
                return Err(PlanError::InvalidName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(PlanError::DuplicateName(name.to_string()));
            }
        }
        Ok(())
    }

    /// Compact JSON form, stored with interactions.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Binding names double as SQL table names, so keep them to plain identifiers.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_fenced_plan() {
        let reply = r#"```json
{
  "steps": [
    {"op": "scrape_table", "url": "https://example.com/films", "name": "films"},
    {"op": "sql", "query": "SELECT COUNT(*) FROM films WHERE year < 2000", "name": "before_2000"},
    {"op": "plot", "query": "SELECT rank, peak FROM films", "x": "rank", "y": "peak", "regression": true, "name": "chart"}
  ],
  "result": ["$before_2000", "$chart"]
}
```"#;
        let plan = Plan::parse(reply).unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(
            plan.steps[0],
            Step::ScrapeTable {
                url: "https://example.com/films".into(),
                name: "films".into(),
                index: 0
            }
        );
        match &plan.steps[2] {
            Step::Plot {
                kind, regression, ..
            } => {
                assert_eq!(*kind, PlotKind::Scatter);
                assert!(*regression);
            }
            other => panic!("expected plot, got {other:?}"),
        }
        assert_eq!(plan.result, json!(["$before_2000", "$chart"]));
    }

    #[test]
    fn test_unnamed_sql_allowed() {
        let plan = Plan::parse(
            r#"{"steps": [{"op": "sql", "query": "CREATE TABLE t AS SELECT 1 AS x"}], "result": null}"#,
        )
        .unwrap();
        assert_eq!(plan.steps[0].binding(), None);
    }

    #[test]
    fn test_rejects_bad_plans() {
        assert!(matches!(Plan::parse("no plan here"), Err(PlanError::NoJson)));
        assert!(matches!(Plan::parse("{}"), Err(PlanError::Empty)));
        assert!(matches!(
            Plan::parse(r#"{"steps": [{"op": "shell", "cmd": "ls"}]}"#),
            Err(PlanError::Shape(_))
        ));
        assert!(matches!(
            Plan::parse(
                r#"{"steps": [
                    {"op": "sql", "query": "SELECT 1", "name": "a"},
                    {"op": "sql", "query": "SELECT 2", "name": "a"}
                ]}"#
            ),
            Err(PlanError::DuplicateName(n)) if n == "a"
        ));
        assert!(matches!(
            Plan::parse(r#"{"steps": [{"op": "data", "name": "1st", "columns": ["a"]}]}"#),
            Err(PlanError::InvalidName(_))
        ));
    }

    #[test]
    fn test_result_only_plan() {
        let plan = Plan::parse(r#"{"result": {"answer": 42}}"#).unwrap();
        assert!(plan.steps.is_empty());
    }
}
