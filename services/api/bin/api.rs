//! Main Entrypoint for the VoiceDesk API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Wiring the credential issuer, retrieval engine, tool dispatcher and
//!    response generator into the shared session services.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use voicedesk_api::{
    config::{Config, IdentityVerification},
    db::Db,
    router::create_router,
    state::AppState,
};
use voicedesk_core::{
    credential::{CredentialIssuer, IdentityVerifier, JwtIdentityVerifier, LiveKitKeys},
    llm_client::OpenAIResponseGenerator,
    registry::SessionRegistry,
    retrieval::{OpenAIEmbeddingProvider, RetrievalEngine},
    runtime::{SessionServices, SessionSettings},
    tools::{ToolDispatcher, ToolSettings},
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        return;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(config = ?config, "Configuration loaded. Initializing application state...");

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize Shared Services ---
    let prompts = load_prompts(&config.prompts_path)?;
    info!(provider = ?config.provider, "Using OpenAI-compatible provider.");
    let openai_config = OpenAIConfig::new()
        .with_api_key(config.provider_api_key())
        .with_api_base(config.provider_api_base());

    let verifier: Arc<dyn IdentityVerifier> = match &config.identity_verification {
        IdentityVerification::Jwks { url } => Arc::new(JwtIdentityVerifier::with_jwks(
            url.clone(),
            &config.identity_audience,
            &config.identity_issuer,
        )),
        IdentityVerification::SharedSecret(secret) => {
            Arc::new(JwtIdentityVerifier::with_shared_secret(
                secret.as_bytes(),
                &config.identity_audience,
                &config.identity_issuer,
            ))
        }
    };
    let issuer = Arc::new(CredentialIssuer::new(
        verifier,
        LiveKitKeys {
            api_key: config.livekit_api_key.clone(),
            api_secret: config.livekit_api_secret.clone(),
        },
        config.credential_ttl,
    ));

    let retrieval = Arc::new(RetrievalEngine::new(
        Arc::new(OpenAIEmbeddingProvider::new(
            openai_config.clone(),
            config.embedding_model.clone(),
        )),
        db.clone(),
        config.tool_timeout,
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(
        db.clone(),
        db.clone(),
        retrieval,
        ToolSettings {
            similarity_threshold: config.similarity_threshold,
            default_top_k: config.retrieval_top_k,
            max_top_k: config.retrieval_max_top_k,
            timeout: config.tool_timeout,
        },
    ));
    let generator = Arc::new(
        OpenAIResponseGenerator::new(openai_config, config.chat_model.clone(), prompts)
            .context("Failed to initialize the response generator")?,
    );

    let registry = Arc::new(SessionRegistry::new());
    let session_settings = SessionSettings {
        idle_timeout: config.idle_timeout,
        response_timeout: config.response_timeout,
        ..SessionSettings::default()
    };

    let app_state = Arc::new(AppState {
        issuer,
        registry: registry.clone(),
        services: SessionServices {
            generator,
            dispatcher,
            summaries: db.clone(),
            registry,
        },
        session_settings,
        profiles: db,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
