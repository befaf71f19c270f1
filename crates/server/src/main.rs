//! Lagrum server entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use lagrum_agent::Orchestrator;
use lagrum_config::{load_settings, LlmApiFormat, Settings};
use lagrum_core::{Embedder, VectorSearch};
use lagrum_llm::{LlmClient, LlmClientConfig, WireFormat};
use lagrum_rag::{
    ChromaClient, ChromaConfig, HttpEmbedder, HttpEmbedderConfig, LexicalIndex, Retriever,
    RetrieverConfig,
};
use lagrum_server::{create_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Priority: env vars > config/{env}.yaml > config/default.yaml > defaults
    let env = std::env::var("LAGRUM_ENV").ok();
    let settings = match load_settings(env.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Tracing not yet initialized, use eprintln for early logging
            eprintln!("Warning: failed to load config: {e}. Using defaults.");
            Settings::default()
        }
    };

    init_tracing(&settings);
    tracing::info!("Starting Lagrum server v{}", env!("CARGO_PKG_VERSION"));

    // Embedder with fatal dimension check
    let embedder = Arc::new(HttpEmbedder::new(HttpEmbedderConfig {
        url: settings.embedding.url.clone(),
        model: settings.embedding.model.clone(),
        expected_dim: settings.embedding.expected_dim,
        timeout: Duration::from_secs(30),
    })?);

    if let Err(e) = embedder.verify_dimension().await {
        tracing::error!(error = %e, "Embedding dimension check failed, refusing to start");
        return Err(e.into());
    }

    // Vector store
    let store = Arc::new(ChromaClient::new(ChromaConfig {
        url: settings.vector_store.url.clone(),
        timeout: Duration::from_secs(30),
    })?);
    match store.list_collections().await {
        Ok(collections) => {
            tracing::info!(count = collections.len(), "Vector store reachable");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Vector store unreachable at startup (degraded)");
        }
    }

    // LLM client
    let llm = Arc::new(LlmClient::new(LlmClientConfig {
        base_url: settings.llm.base_url.clone(),
        format: match settings.llm.api_format {
            LlmApiFormat::OpenAi => WireFormat::OpenAi,
            LlmApiFormat::Ollama => WireFormat::Ollama,
        },
        primary_model: settings.llm.constitutional_model.clone(),
        fallback_model: settings.llm.constitutional_fallback.clone(),
        timeout: Duration::from_secs_f64(settings.llm.timeout_secs),
        connect_timeout: Duration::from_secs_f64(settings.llm.connect_timeout_secs),
    })?);

    // Retriever with optional lexical sidecar
    let retriever_config = RetrieverConfig {
        default_collections: settings.vector_store.default_collections.clone(),
        default_k: settings.retrieval.default_k,
        search_timeout: Duration::from_secs_f64(settings.retrieval.search_timeout_secs),
        similarity_threshold: settings.retrieval.similarity_threshold,
        rrf_k: settings.retrieval.rrf_k,
        max_concurrent_queries: settings.retrieval.max_concurrent_queries,
        max_escalation_steps: settings.retrieval.max_escalation_steps,
        fusion_gain_min: lagrum_config::constants::retrieval::FUSION_GAIN_MIN,
    };

    let mut retriever = Retriever::new(
        Arc::clone(&store) as Arc<dyn VectorSearch>,
        Arc::clone(&embedder) as Arc<dyn Embedder>,
        retriever_config,
    );

    if settings.lexical.enabled {
        match LexicalIndex::new(lagrum_rag::LexicalConfig {
            index_path: settings.lexical.index_path.clone(),
            ..Default::default()
        }) {
            Ok(index) => {
                retriever = retriever.with_lexical(Arc::new(index));
                tracing::info!("Lexical sidecar enabled");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Lexical index unavailable, dense-only retrieval");
            }
        }
    }

    let orchestrator = Arc::new(Orchestrator::new(
        settings.clone(),
        llm,
        Arc::new(retriever),
        store,
        embedder,
    ));

    let state = AppState::new(settings.clone(), orchestrator);
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    tracing::info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

fn init_tracing(settings: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("lagrum={},tower_http=info", settings.observability.log_level).into()
    });

    let fmt_layer = if settings.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
