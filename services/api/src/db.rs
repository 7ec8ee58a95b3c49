//! Data Access Layer
//!
//! All interaction with PostgreSQL. `Db` implements the core's storage traits
//! so that the session runtime and tool dispatcher never see `sqlx` types.
//! Vectors are exchanged with pgvector in its text form (`[x,y,...]`).

use anyhow::{Result, ensure};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;
use voicedesk_core::{
    model::{
        EMBEDDING_DIMENSIONS, InteractionSummary, NewInteractionSummary, NewKnowledgeArticle,
        ProfileUpdate, ScoredEntry, UserProfile,
    },
    retrieval::KnowledgeStore,
    tools::{ProfileStore, SummaryStore},
};

use crate::models::{KnowledgeMatchRow, Profile, SummaryRow};

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

/// Formats an embedding as a pgvector literal.
pub(crate) fn vector_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

impl Db {
    /// Creates a new `Db` instance.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Stores a knowledge article with its embedding. Re-ingestion inserts a
    /// new row; existing embeddings are never rewritten.
    pub async fn insert_knowledge_article(
        &self,
        article: &NewKnowledgeArticle,
        embedding: &[f32],
    ) -> Result<Uuid> {
        ensure!(
            embedding.len() == EMBEDDING_DIMENSIONS,
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            EMBEDDING_DIMENSIONS
        );
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO knowledge_articles (title, content, embedding, category, tags, source_url)
            VALUES ($1, $2, CAST($3 AS vector), $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&article.title)
        .bind(&article.content)
        .bind(vector_literal(embedding))
        .bind(&article.category)
        .bind(&article.tags)
        .bind(&article.source_url)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn count_knowledge_articles(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ProfileStore for Db {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"
            SELECT user_id, email, full_name, subscription_tier, created_at, updated_at
            FROM user_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(profile.map(UserProfile::from))
    }

    async fn upsert_profile(&self, update: ProfileUpdate) -> Result<UserProfile> {
        let profile = sqlx::query_as::<_, Profile>(
            r#"
            INSERT INTO user_profiles (user_id, email, full_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET email = EXCLUDED.email, full_name = EXCLUDED.full_name
            RETURNING user_id, email, full_name, subscription_tier, created_at, updated_at
            "#,
        )
        .bind(&update.user_id)
        .bind(&update.email)
        .bind(&update.full_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(profile.into())
    }
}

/// A retried write for a session that already has a summary returns the
/// stored row unchanged.
const SAVE_SUMMARY: &str = r#"
    INSERT INTO interaction_summaries (user_id, session_id, summary)
    VALUES ($1, $2, $3)
    ON CONFLICT (session_id) WHERE session_id IS NOT NULL
    DO UPDATE SET summary = interaction_summaries.summary
    RETURNING id, user_id, session_id, summary, created_at
"#;

#[async_trait]
impl SummaryStore for Db {
    async fn save_summary(&self, summary: NewInteractionSummary) -> Result<InteractionSummary> {
        let row = sqlx::query_as::<_, SummaryRow>(SAVE_SUMMARY)
        .bind(&summary.user_id)
        .bind(&summary.session_id)
        .bind(&summary.summary)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn latest_summary(&self, user_id: &str) -> Result<Option<InteractionSummary>> {
        let row = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT id, user_id, session_id, summary, created_at
            FROM interaction_summaries
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(InteractionSummary::from))
    }
}

#[async_trait]
impl KnowledgeStore for Db {
    async fn match_knowledge(
        &self,
        query_embedding: &[f32],
        threshold: f32,
        match_count: usize,
    ) -> Result<Vec<ScoredEntry>> {
        let rows = sqlx::query_as::<_, KnowledgeMatchRow>(
            r#"
            SELECT id, title, content, category, tags, source_url, similarity
            FROM match_knowledge(CAST($1 AS vector), $2, $3)
            "#,
        )
        .bind(vector_literal(query_embedding))
        .bind(f64::from(threshold))
        .bind(i32::try_from(match_count).unwrap_or(i32::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ScoredEntry::from).collect())
    }
}
