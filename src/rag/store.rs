//! SQLite persistence for knowledge-base entries and interactions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};

use super::RagError;
use crate::models::{ContextEntry, Interaction, InteractionSummary};

type Result<T> = std::result::Result<T, RagError>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const INTERACTION_COLUMNS: &str = "id, timestamp, user_query, generated_plan, execution_result, \
     user_feedback, success_score, context_used";

/// SQLite-backed store. Opens a connection per operation.
pub struct KnowledgeStore {
    db_path: PathBuf,
}

impl KnowledgeStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contexts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS interactions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                user_query TEXT NOT NULL,
                generated_plan TEXT NOT NULL,
                execution_result TEXT,
                user_feedback TEXT,
                success_score REAL,
                context_used TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_score
                ON interactions(success_score);
        "#,
        )?;
        Ok(())
    }

    pub fn insert_contexts(&self, entries: &[ContextEntry]) -> Result<()> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO contexts (id, content, metadata, created_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.id,
                    entry.content,
                    serde_json::to_string(&entry.metadata)?,
                    entry.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All entries in insertion order.
    pub fn contexts(&self) -> Result<Vec<ContextEntry>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT id, content, metadata, created_at FROM contexts ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>("id")?,
                row.get::<_, String>("content")?,
                row.get::<_, String>("metadata")?,
                row.get::<_, String>("created_at")?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, content, metadata, created_at) = row?;
            entries.push(ContextEntry {
                id,
                content,
                metadata: serde_json::from_str::<Map<String, Value>>(&metadata)?,
                created_at: parse_datetime(&created_at),
            });
        }
        Ok(entries)
    }

    pub fn context_count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM contexts", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn insert_interaction(&self, interaction: &Interaction) -> Result<()> {
        let conn = self.connect()?;
        let result = interaction
            .execution_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            &format!(
                "INSERT INTO interactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                INTERACTION_COLUMNS
            ),
            params![
                interaction.id,
                interaction.timestamp.to_rfc3339(),
                interaction.user_query,
                interaction.generated_plan,
                result,
                interaction.user_feedback,
                interaction.success_score,
                serde_json::to_string(&interaction.context_used)?,
            ],
        )?;
        Ok(())
    }

    /// Query, plan and score of every interaction in insertion order.
    /// Results and context lists stay on disk.
    pub fn interaction_summaries(&self) -> Result<Vec<InteractionSummary>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_query, generated_plan, success_score FROM interactions ORDER BY seq",
        )?;
        let summaries = stmt
            .query_map([], |row| {
                Ok(InteractionSummary {
                    id: row.get(0)?,
                    user_query: row.get(1)?,
                    generated_plan: row.get(2)?,
                    success_score: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    pub fn get_interaction(&self, id: &str) -> Result<Option<Interaction>> {
        let conn = self.connect()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM interactions WHERE id = ?1", INTERACTION_COLUMNS),
                params![id],
                raw_interaction,
            )
            .optional()?;
        raw.map(RawInteraction::into_interaction).transpose()
    }

    /// Record feedback and the new score. Returns false for unknown ids.
    pub fn update_feedback(&self, id: &str, feedback: &str, score: f64) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE interactions SET user_feedback = ?2, success_score = ?3 WHERE id = ?1",
            params![id, feedback, score],
        )?;
        Ok(changed > 0)
    }

    /// Every interaction's score (null for unscored ones).
    pub fn scores(&self) -> Result<Vec<Option<f64>>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT success_score FROM interactions")?;
        let scores = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(scores)
    }
}

/// Column values before JSON decoding, so decode errors surface as `RagError`.
struct RawInteraction {
    id: String,
    timestamp: String,
    user_query: String,
    generated_plan: String,
    execution_result: Option<String>,
    user_feedback: Option<String>,
    success_score: Option<f64>,
    context_used: String,
}

fn raw_interaction(row: &Row<'_>) -> rusqlite::Result<RawInteraction> {
    Ok(RawInteraction {
        id: row.get("id")?,
        timestamp: row.get("timestamp")?,
        user_query: row.get("user_query")?,
        generated_plan: row.get("generated_plan")?,
        execution_result: row.get("execution_result")?,
        user_feedback: row.get("user_feedback")?,
        success_score: row.get("success_score")?,
        context_used: row.get("context_used")?,
    })
}

impl RawInteraction {
    fn into_interaction(self) -> Result<Interaction> {
        Ok(Interaction {
            id: self.id,
            timestamp: parse_datetime(&self.timestamp),
            user_query: self.user_query,
            generated_plan: self.generated_plan,
            execution_result: self
                .execution_result
                .as_deref()
                .map(|raw| serde_json::from_str(raw))
                .transpose()?,
            user_feedback: self.user_feedback,
            success_score: self.success_score,
            context_used: serde_json::from_str(&self.context_used)?,
        })
    }
}

/// Parse a stored timestamp, defaulting to the Unix epoch.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_interaction_roundtrip_and_feedback() {
        let dir = tempdir().unwrap();
        let store = KnowledgeStore::open(&dir.path().join("kb.db")).unwrap();

        let mut interaction = Interaction::new("count rows", r#"{"steps":[]}"#);
        interaction.execution_result = Some(json!([1, 2]));
        interaction.success_score = Some(1.0);
        interaction.context_used = vec!["ctx".into()];
        store.insert_interaction(&interaction).unwrap();

        let loaded = store.get_interaction(&interaction.id).unwrap().unwrap();
        assert_eq!(loaded.user_query, "count rows");
        assert_eq!(loaded.execution_result, Some(json!([1, 2])));
        assert_eq!(loaded.context_used, vec!["ctx".to_string()]);

        assert!(store.update_feedback(&interaction.id, "bad", 0.2).unwrap());
        assert!(!store.update_feedback("nope", "bad", 0.2).unwrap());
        assert_eq!(store.scores().unwrap(), vec![Some(0.2)]);
        assert!(store.get_interaction("nope").unwrap().is_none());
    }

    #[test]
    fn test_interaction_summaries_skip_results() {
        let dir = tempdir().unwrap();
        let store = KnowledgeStore::open(&dir.path().join("kb.db")).unwrap();

        let mut first = Interaction::new("plot sales", "{\"steps\":[]}");
        first.execution_result = Some(json!(["data:image/png;base64,AAAA"]));
        first.success_score = Some(0.9);
        store.insert_interaction(&first).unwrap();
        store
            .insert_interaction(&Interaction::new("count rows", "plan"))
            .unwrap();

        let summaries = store.interaction_summaries().unwrap();
        assert_eq!(
            summaries,
            vec![
                InteractionSummary {
                    id: first.id.clone(),
                    user_query: "plot sales".into(),
                    generated_plan: "{\"steps\":[]}".into(),
                    success_score: Some(0.9),
                },
                InteractionSummary {
                    id: summaries[1].id.clone(),
                    user_query: "count rows".into(),
                    generated_plan: "plan".into(),
                    success_score: None,
                },
            ]
        );
    }

    #[test]
    fn test_contexts_keep_insertion_order() {
        let dir = tempdir().unwrap();
        let store = KnowledgeStore::open(&dir.path().join("kb.db")).unwrap();
        let entries: Vec<ContextEntry> = ["b", "a", "c"]
            .iter()
            .map(|c| ContextEntry::new(*c, Map::new()))
            .collect();
        store.insert_contexts(&entries).unwrap();

        let contents: Vec<String> = store.contexts().unwrap().into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["b", "a", "c"]);
        assert_eq!(store.context_count().unwrap(), 3);
    }
}
