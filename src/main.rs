//! analyst - LLM-planned data analysis service.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    analyst::cli::run().await
}
