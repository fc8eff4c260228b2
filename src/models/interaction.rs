//! Knowledge-base entries and recorded interactions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A snippet of analysis know-how injected into planning prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl ContextEntry {
    pub fn new(content: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            id: format!("context_{}", Uuid::new_v4().simple()),
            content: content.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// One analysis request and what came of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_query: String,
    /// Plan JSON as returned by the LLM (after validation).
    pub generated_plan: String,
    pub execution_result: Option<Value>,
    pub user_feedback: Option<String>,
    pub success_score: Option<f64>,
    #[serde(default)]
    pub context_used: Vec<String>,
}

impl Interaction {
    pub fn new(user_query: impl Into<String>, generated_plan: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        Self {
            id: new_interaction_id(timestamp),
            timestamp,
            user_query: user_query.into(),
            generated_plan: generated_plan.into(),
            execution_result: None,
            user_feedback: None,
            success_score: None,
            context_used: Vec::new(),
        }
    }
}

/// The columns of a past interaction needed to rank and quote it.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionSummary {
    pub id: String,
    pub user_query: String,
    pub generated_plan: String,
    pub success_score: Option<f64>,
}

/// `interaction_{YYYYmmdd_HHMMSS}_{8 hex}`; the suffix keeps ids unique
/// within a second.
pub fn new_interaction_id(at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("interaction_{}_{}", at.format("%Y%m%d_%H%M%S"), &suffix[..8])
}
