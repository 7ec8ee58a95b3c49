//! Knowledge Base Ingestion
//!
//! Embeds knowledge articles and stores them for retrieval. Articles come from
//! a JSON file (an array of `{title, content, category?, tags?, source_url?}`)
//! or, without `--file`, a small built-in sample set. A failed article is
//! counted and reported; it never aborts the batch.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use clap::Parser;
use sqlx::PgPool;
use std::path::PathBuf;
use tracing::{error, info};
use voicedesk_api::{config::Config, db::Db};
use voicedesk_core::{
    model::NewKnowledgeArticle,
    retrieval::{EmbeddingProvider, OpenAIEmbeddingProvider},
};

#[derive(Parser)]
#[command(name = "populate_kb")]
#[command(about = "Embed and store knowledge articles for the support agent", long_about = None)]
struct Cli {
    /// JSON file holding an array of articles. Uses the built-in samples when omitted.
    #[arg(short, long)]
    file: Option<PathBuf>,
}

fn sample_articles() -> Vec<NewKnowledgeArticle> {
    let article = |title: &str, category: &str, content: &str| NewKnowledgeArticle {
        title: title.to_string(),
        content: content.to_string(),
        category: Some(category.to_string()),
        tags: Vec::new(),
        source_url: None,
    };
    vec![
        article(
            "How to Reset Your Password",
            "account",
            "Forgot your password? Open the login page and choose 'Forgot Password'. \
             An email with reset instructions follows within a few minutes; check the \
             spam folder if it does not arrive.",
        ),
        article(
            "Understanding Your Subscription Tiers",
            "billing",
            "There are three subscription tiers. Basic is free and covers the core \
             features. Premium adds advanced analytics and priority support. Enterprise \
             adds custom solutions and a dedicated account manager. The pricing page \
             compares the tiers in detail.",
        ),
        article(
            "Integrating with Third-Party Services",
            "integrations",
            "Third-party services connect through the public API or a dedicated \
             connector. Open 'Integrations' in account settings and supply the API key \
             issued by the other service. The help center has a guide per integration.",
        ),
        article(
            "Troubleshooting Common Login Issues",
            "account",
            "If login fails, confirm the email and password, watch for typos and Caps \
             Lock, and use the new password after a reset. Clearing browser cache and \
             cookies resolves many problems. If it persists, contact support with the \
             exact error message.",
        ),
    ]
}

fn load_articles(path: Option<&PathBuf>) -> anyhow::Result<Vec<NewKnowledgeArticle>> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("{} is not an array of articles", path.display()))
        }
        None => Ok(sample_articles()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let articles = load_articles(cli.file.as_ref())?;
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Db::new(pool);
    db.run_migrations().await?;

    let embedder = OpenAIEmbeddingProvider::new(
        OpenAIConfig::new()
            .with_api_key(config.provider_api_key())
            .with_api_base(config.provider_api_base()),
        config.embedding_model.clone(),
    );

    info!(count = articles.len(), "Populating knowledge base...");
    let mut stored = 0usize;
    let mut failed = 0usize;
    for (i, article) in articles.iter().enumerate() {
        info!(title = %article.title, "Processing article {}/{}", i + 1, articles.len());
        let result = async {
            let embedding = embedder
                .embed(&format!("{}\n\n{}", article.title, article.content))
                .await?;
            db.insert_knowledge_article(article, &embedding).await
        }
        .await;
        match result {
            Ok(id) => {
                info!(%id, title = %article.title, "Stored article");
                stored += 1;
            }
            Err(e) => {
                error!(error = ?e, title = %article.title, "Failed to store article");
                failed += 1;
            }
        }
    }

    let total = db.count_knowledge_articles().await?;
    info!(stored, failed, total, "Knowledge base population complete.");
    Ok(())
}
