//! Adaptive knowledge base: prompt enrichment and learning from outcomes.
//!
//! Context snippets and past interactions are persisted in SQLite under the
//! configured directory. Retrieval ranks them by lexical similarity to the
//! task; successful interactions are distilled into new context entries so
//! later prompts can reuse their plans.

mod scoring;
mod similarity;
mod store;

use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RagSettings;
use crate::llm::prompts;
use crate::models::{ContextEntry, Interaction, InteractionSummary};

pub use scoring::{feedback_adjustment, score_result};
pub use similarity::{rank, tokenize, TermVector};
pub use store::KnowledgeStore;

/// File name of the knowledge store inside the persist directory.
pub const STORE_FILE: &str = "knowledge.db";

/// Characters of a past plan shown in prompts.
const PATTERN_PREVIEW_CHARS: usize = 200;

const DEFAULT_CONTEXTS: &[(&str, &str, &str)] = &[
    (
        "Data scraping from web tables with the scrape_table step; pick the table index that holds the data",
        "data_source",
        "web_scraping",
    ),
    (
        "SQL queries over loaded tables with the sql step (SQLite dialect: CAST, strftime, window functions)",
        "data_analysis",
        "sql",
    ),
    (
        "Creating visualizations with the plot step, encoded as base64 PNG data URIs under 100000 bytes",
        "visualization",
        "plotting",
    ),
    (
        "Tabular data manipulation: filter, join and aggregate tables with SQL before answering",
        "data_analysis",
        "tabular",
    ),
    (
        "Statistical analysis: correlation and regression slope via SQL aggregates (AVG, SUM of products)",
        "data_analysis",
        "statistics",
    ),
];

/// Errors from the knowledge store.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("failed to create {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("knowledge store error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("corrupt knowledge store record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("interaction '{0}' not found")]
    NotFound(String),
    #[error("success score {score} is outside [{min}, {max}]")]
    InvalidScore { score: f64, min: f64, max: f64 },
    #[error("context content must not be empty")]
    EmptyContent,
}

/// Learning metrics reported by `/api/stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearningStats {
    pub total_interactions: usize,
    pub successful_interactions: usize,
    pub success_rate: f64,
    pub average_success_score: f64,
    pub context_count: usize,
}

/// A planning prompt and the knowledge-base snippets it includes.
#[derive(Debug, Clone)]
pub struct AdaptivePrompt {
    pub text: String,
    pub context_used: Vec<String>,
}

/// Knowledge base plus interaction history.
pub struct AdaptiveSystem {
    store: KnowledgeStore,
    settings: RagSettings,
}

impl AdaptiveSystem {
    /// Open (or create) the store under `settings.persist_directory`,
    /// seeding the default knowledge base when it is empty.
    pub fn open(settings: RagSettings) -> Result<Self, RagError> {
        let dir = &settings.persist_directory;
        std::fs::create_dir_all(dir).map_err(|source| RagError::Io {
            path: dir.clone(),
            source,
        })?;
        let store = KnowledgeStore::open(&dir.join(STORE_FILE))?;
        let system = Self { store, settings };

        if system.store.context_count()? == 0 {
            let defaults = DEFAULT_CONTEXTS
                .iter()
                .map(|(content, kind, category)| {
                    let mut metadata = Map::new();
                    metadata.insert("type".into(), Value::from(*kind));
                    metadata.insert("category".into(), Value::from(*category));
                    ContextEntry::new(*content, metadata)
                })
                .collect();
            system.add_contexts(defaults)?;
        }

        info!(
            path = %system.store.db_path().display(),
            contexts = system.store.context_count()?,
            "Knowledge base ready"
        );
        Ok(system)
    }

    pub fn add_contexts(&self, entries: Vec<ContextEntry>) -> Result<usize, RagError> {
        if entries.iter().any(|e| e.content.trim().is_empty()) {
            return Err(RagError::EmptyContent);
        }
        self.store.insert_contexts(&entries)?;
        info!(count = entries.len(), "Added contexts to knowledge base");
        Ok(entries.len())
    }

    pub fn add_context(
        &self,
        content: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), RagError> {
        self.add_contexts(vec![ContextEntry::new(content.trim(), metadata)])
            .map(|_| ())
    }

    pub fn context_count(&self) -> Result<usize, RagError> {
        self.store.context_count()
    }

    /// Contents of the `top_k` entries most similar to `query`.
    pub fn retrieve_relevant_context(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<String>, RagError> {
        let mut entries = self.store.contexts()?;
        let order = rank(query, &entries, |e| e.content.as_str(), top_k);
        Ok(order
            .into_iter()
            .map(|i| std::mem::take(&mut entries[i].content))
            .collect())
    }

    /// Past interactions whose queries are most similar to `query`.
    pub fn similar_interactions(
        &self,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<InteractionSummary>, RagError> {
        let summaries = self.store.interaction_summaries()?;
        let order = rank(query, &summaries, |s| s.user_query.as_str(), top_k);
        Ok(order.into_iter().map(|i| summaries[i].clone()).collect())
    }

    /// Build the planning prompt for a task.
    ///
    /// `attachments` are one-line descriptions of preloaded tables.
    pub fn adaptive_prompt(
        &self,
        task: &str,
        attachments: &[String],
    ) -> Result<AdaptivePrompt, RagError> {
        let context_used = self.retrieve_relevant_context(task, self.settings.context_top_k)?;
        let similar = self.similar_interactions(task, self.settings.similar_interactions_top_k)?;

        let mut parts = vec![prompts::PLANNER_PREAMBLE.to_string(), String::new()];
        parts.push("Relevant context for this type of task:".to_string());
        parts.extend(context_used.iter().map(|c| format!("- {}", c)));

        let successful: Vec<&InteractionSummary> = similar
            .iter()
            .filter(|i| self.is_success(i.success_score))
            .collect();
        if !successful.is_empty() {
            parts.push(String::new());
            parts.push("Similar successful patterns:".to_string());
            for interaction in successful {
                parts.push(format!("- Query: {}", interaction.user_query));
                parts.push(format!(
                    "- Successful plan: {}...",
                    preview(&interaction.generated_plan)
                ));
            }
        }

        if !attachments.is_empty() {
            parts.push(String::new());
            parts.push("Tables already loaded from the request:".to_string());
            parts.extend(attachments.iter().map(|a| format!("- {}", a)));
        }

        parts.push(String::new());
        parts.push(format!("Task: {}", task));
        parts.push(String::new());
        parts.push(prompts::PLANNER_CLOSING.to_string());

        debug!(
            contexts = context_used.len(),
            similar = similar.len(),
            "Built adaptive prompt"
        );
        Ok(AdaptivePrompt {
            text: parts.join("\n"),
            context_used,
        })
    }

    /// Persist an interaction and learn from it when it succeeded.
    pub fn add_interaction(&self, interaction: &Interaction) -> Result<(), RagError> {
        self.store.insert_interaction(interaction)?;
        debug!(id = %interaction.id, score = ?interaction.success_score, "Recorded interaction");
        if self.is_success(interaction.success_score) {
            self.learn_from(interaction)?;
        }
        Ok(())
    }

    /// Attach feedback to an interaction and return its new score.
    ///
    /// An explicit score replaces the stored one; otherwise the stored score
    /// is adjusted by the feedback wording.
    pub fn submit_feedback(
        &self,
        interaction_id: &str,
        feedback: &str,
        score: Option<f64>,
    ) -> Result<f64, RagError> {
        let (min, max) = (
            self.settings.min_success_score,
            self.settings.max_success_score,
        );
        if let Some(score) = score {
            if !(min..=max).contains(&score) {
                return Err(RagError::InvalidScore { score, min, max });
            }
        }

        let mut interaction = self
            .store
            .get_interaction(interaction_id)?
            .ok_or_else(|| RagError::NotFound(interaction_id.to_string()))?;

        let new_score = score.unwrap_or_else(|| {
            let current = interaction.success_score.unwrap_or(0.5);
            (current + feedback_adjustment(feedback)).clamp(min, max)
        });
        self.store
            .update_feedback(interaction_id, feedback, new_score)?;
        info!(id = interaction_id, score = new_score, "Feedback recorded");

        interaction.user_feedback = Some(feedback.to_string());
        interaction.success_score = Some(new_score);
        if self.is_success(interaction.success_score) {
            self.learn_from(&interaction)?;
        }
        Ok(new_score)
    }

    pub fn stats(&self) -> Result<LearningStats, RagError> {
        let scores = self.store.scores()?;
        let total = scores.len();
        let successful = scores.iter().filter(|s| self.is_success(**s)).count();
        let sum: f64 = scores.iter().flatten().sum();
        let denominator = total.max(1) as f64;

        Ok(LearningStats {
            total_interactions: total,
            successful_interactions: successful,
            success_rate: successful as f64 / denominator,
            average_success_score: sum / denominator,
            context_count: self.store.context_count()?,
        })
    }

    /// Score a result using the configured bounds.
    pub fn score_result(&self, result: &Value, feedback: Option<&str>) -> f64 {
        score_result(
            result,
            feedback,
            self.settings.min_success_score,
            self.settings.max_success_score,
        )
    }

    fn is_success(&self, score: Option<f64>) -> bool {
        score.is_some_and(|s| s > self.settings.success_threshold)
    }

    fn learn_from(&self, interaction: &Interaction) -> Result<(), RagError> {
        if interaction.generated_plan.trim().is_empty() {
            warn!(id = %interaction.id, "Skipping learning: interaction has no plan");
            return Ok(());
        }
        let mut metadata = Map::new();
        metadata.insert("type".into(), Value::from("learned_pattern"));
        metadata.insert(
            "success_score".into(),
            interaction.success_score.map(Value::from).unwrap_or(Value::Null),
        );
        metadata.insert(
            "original_query".into(),
            Value::from(interaction.user_query.as_str()),
        );
        let content = format!(
            "Successful plan for: {}\nPlan: {}",
            interaction.user_query, interaction.generated_plan
        );
        self.add_contexts(vec![ContextEntry::new(content, metadata)])?;
        info!(id = %interaction.id, "Learned new pattern from successful interaction");
        Ok(())
    }
}

fn preview(plan: &str) -> &str {
    match plan.char_indices().nth(PATTERN_PREVIEW_CHARS) {
        Some((end, _)) => &plan[..end],
        None => plan,
    }
}
