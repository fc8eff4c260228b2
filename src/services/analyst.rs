//! Analysis orchestration: prompt, plan, execute, score, record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::analysis::{
    sanitize_identifier, ExecutionError, Plan, PlanExecutor, Table, TableError,
};
use crate::config::Settings;
use crate::llm::{LlmBackend, LlmClient, LlmError, LlmProvider};
use crate::models::Interaction;
use crate::rag::{AdaptiveSystem, RagError};

/// A tabular file sent along with the task.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

/// One analysis request.
#[derive(Debug, Clone, Default)]
pub struct AnalysisRequest {
    pub task: String,
    pub attachments: Vec<Attachment>,
}

impl AnalysisRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, filename: impl Into<String>, data: Vec<u8>) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            data,
        });
        self
    }
}

/// Successful analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub result: Value,
    pub interaction_id: String,
    /// The executed plan as JSON text.
    pub plan: String,
    pub context_used: Vec<String>,
    pub success_score: f64,
}

#[derive(Debug, Error)]
pub enum AnalystError {
    #[error("task is empty")]
    EmptyTask,
    #[error("attachment '{filename}' could not be loaded: {source}")]
    Attachment {
        filename: String,
        source: TableError,
    },
    #[error("LLM request failed: {0}")]
    Llm(#[from] LlmError),
    /// The plan could not be parsed or executed. The interaction was still
    /// recorded with a zero score.
    #[error("plan execution failed: {details}")]
    Failed {
        interaction_id: String,
        plan: String,
        details: String,
        timed_out: bool,
    },
    #[error(transparent)]
    Rag(#[from] RagError),
}

/// Runs analyses end to end.
pub struct Analyst {
    llm: Arc<dyn LlmBackend>,
    rag: Arc<AdaptiveSystem>,
    http: Client,
    execution_timeout: Duration,
}

impl Analyst {
    pub fn new(
        llm: Arc<dyn LlmBackend>,
        rag: Arc<AdaptiveSystem>,
        http: Client,
        execution_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            rag,
            http,
            execution_timeout,
        }
    }

    /// Build the analyst with the configured LLM provider and knowledge store.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let llm = LlmClient::new(settings.llm.clone())?;
        let rag = AdaptiveSystem::open(settings.rag.clone())?;
        Ok(Self::new(
            Arc::new(llm),
            Arc::new(rag),
            http_client()?,
            settings.execution_timeout(),
        ))
    }

    pub fn provider(&self) -> LlmProvider {
        self.llm.provider()
    }

    pub fn rag(&self) -> &AdaptiveSystem {
        &self.rag
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisOutcome, AnalystError> {
        let task = request.task.trim();
        if task.is_empty() {
            return Err(AnalystError::EmptyTask);
        }

        let tables = attachment_tables(&request.attachments)?;
        let descriptions: Vec<String> = tables.iter().map(Table::describe).collect();
        let prompt = self.rag.adaptive_prompt(task, &descriptions)?;

        let reply = self.llm.complete(&prompt.text).await?;

        let mut interaction = Interaction::new(task, reply.trim());
        interaction.context_used = prompt.context_used;

        let plan = match Plan::parse(&reply) {
            Ok(plan) => plan,
            Err(e) => return Err(self.record_failure(interaction, e.to_string(), false)),
        };
        interaction.generated_plan = plan.to_json_string();
        info!(id = %interaction.id, steps = plan.steps.len(), "Executing plan");

        // The deadline stops SQL left running on the blocking pool once the
        // timeout drops the execution future.
        let deadline = Instant::now() + self.execution_timeout;
        let execution = async {
            let mut executor = PlanExecutor::with_deadline(self.http.clone(), deadline)?;
            for table in tables {
                executor.load_table(table).await?;
            }
            executor.run(&plan).await
        };
        let result = match tokio::time::timeout(self.execution_timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(ExecutionError::TimedOut)) | Err(_) => {
                let details = format!(
                    "plan execution timed out after {:?}",
                    self.execution_timeout
                );
                return Err(self.record_failure(interaction, details, true));
            }
            Ok(Err(e)) => return Err(self.record_failure(interaction, e.to_string(), false)),
        };

        let success_score = self.rag.score_result(&result, None);
        interaction.execution_result = Some(result.clone());
        interaction.success_score = Some(success_score);
        self.rag.add_interaction(&interaction)?;
        info!(id = %interaction.id, score = success_score, "Analysis completed");

        Ok(AnalysisOutcome {
            result,
            interaction_id: interaction.id,
            plan: interaction.generated_plan,
            context_used: interaction.context_used,
            success_score,
        })
    }

    fn record_failure(
        &self,
        mut interaction: Interaction,
        details: String,
        timed_out: bool,
    ) -> AnalystError {
        warn!(id = %interaction.id, details = %details, "Analysis failed");
        interaction.success_score = Some(0.0);
        if let Err(e) = self.rag.add_interaction(&interaction) {
            warn!(id = %interaction.id, "Failed to record interaction: {}", e);
        }
        AnalystError::Failed {
            interaction_id: interaction.id,
            plan: interaction.generated_plan,
            details,
            timed_out,
        }
    }
}

/// HTTP client used by plan steps that fetch data.
pub fn http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("analyst-agent/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(60))
        .build()
}

/// Parse CSV attachments into tables named after their file stems.
fn attachment_tables(attachments: &[Attachment]) -> Result<Vec<Table>, AnalystError> {
    let mut tables: Vec<Table> = Vec::with_capacity(attachments.len());
    for (i, attachment) in attachments.iter().enumerate() {
        let stem = attachment
            .filename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default();
        let stem = stem.rsplit_once('.').map_or(stem, |(s, _)| s);
        let mut name = sanitize_identifier(stem);
        if name.is_empty() {
            name = format!("attachment_{}", i + 1);
        }
        let base = name.clone();
        let mut n = 2;
        while tables.iter().any(|t| t.name == name) {
            name = format!("{}_{}", base, n);
            n += 1;
        }

        let table =
            Table::from_csv(&name, &attachment.data).map_err(|source| AnalystError::Attachment {
                filename: attachment.filename.clone(),
                source,
            })?;
        tables.push(table);
    }
    Ok(tables)
}
