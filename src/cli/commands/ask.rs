//! One-shot local analysis.

use std::path::{Path, PathBuf};

use console::style;

use super::check::ensure_valid;
use crate::cli::icons::{arrow, error};
use crate::config::Settings;
use crate::services::{AnalysisRequest, Analyst, AnalystError};

/// Run a task file through the analyst and print the outcome as JSON.
pub async fn cmd_ask(settings: &Settings, file: &Path, attach: &[PathBuf]) -> anyhow::Result<()> {
    ensure_valid(settings)?;

    let task = std::fs::read_to_string(file)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", file.display(), e))?;
    let mut request = AnalysisRequest::new(task);
    for path in attach {
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
        request = request.with_attachment(path.display().to_string(), data);
    }

    let analyst = Analyst::from_settings(settings)?;
    eprintln!(
        "{} Planning with {} ({})",
        arrow(),
        settings.llm.provider,
        settings.llm.model()
    );

    match analyst.analyze(request).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(AnalystError::Failed {
            interaction_id,
            plan,
            details,
            ..
        }) => {
            eprintln!("{} Plan execution failed: {}", error(), details);
            eprintln!("  {} {}", style("interaction:").dim(), interaction_id);
            eprintln!("  {} {}", style("plan:").dim(), plan);
            anyhow::bail!("analysis failed")
        }
        Err(e) => Err(e.into()),
    }
}
