use axum::{Extension, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use agentchat::agent::AgentFactory;
use agentchat::bi::cache::QueryCache;
use agentchat::bi::documents::DocumentIndex;
use agentchat::bi::vector_store::{LocalVectorStore, QdrantVectorStore, VectorStore};
use agentchat::bi::{BiError, BiSessions, TargetExtractor};
use agentchat::config::{AppConfig, BiConfig, ModelConfig};
use agentchat::embeddings::{default_dimensions, Embedder, HashingEmbedder, OpenAiEmbeddings};
use agentchat::llm_client::{ChatModel, OpenAiClient};
use agentchat::router::{Dispatcher, RouterConfig, SemanticRouter};
use agentchat::services::ChatService;
use agentchat::store::{ChatStore, MemoryChatStore, PgChatStore};
use agentchat::{db, handlers, middleware, AppState};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("❌ Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    log_configuration(&config);

    // Postgres when DATABASE_URL is set, otherwise a process-local store
    let (store, db_pool): (Arc<dyn ChatStore>, _) = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url)
                .await
                .expect("Failed to create database pool.");
            tracing::info!("✅ Connected to PostgreSQL");
            (Arc::new(PgChatStore::new(pool.clone())) as Arc<dyn ChatStore>, Some(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set. Sessions are kept in memory and lost on restart.");
            (Arc::new(MemoryChatStore::new()) as Arc<dyn ChatStore>, None)
        }
    };

    let model: Option<Arc<dyn ChatModel>> = config.model.as_ref().map(|model_config| {
        tracing::info!("Initializing chat model {} at {}", model_config.model, model_config.base_url);
        Arc::new(OpenAiClient::from_config(model_config)) as Arc<dyn ChatModel>
    });
    if model.is_none() {
        tracing::warn!("OPENAI_API_KEY not found. Chat and BI endpoints will answer with errors.");
    }

    let agents = model
        .clone()
        .map(|m| AgentFactory::new(m, Some(config.system_message.clone())));

    let bi = match (&model, &config.model) {
        (Some(model), Some(model_config)) => {
            let targets = match build_target_extractor(&config.bi, model_config, model.clone()).await {
                Ok(targets) => targets,
                Err(e) => {
                    tracing::error!("❌ Failed to set up target extraction: {}", e);
                    None
                }
            };
            Some(BiSessions::new(model.clone(), targets).with_limits(
                config.bi.max_conversations,
                Duration::from_secs(config.bi.conversation_ttl_secs),
            ))
        }
        _ => None,
    };

    let router_config = match &config.router_config {
        Some(path) => match RouterConfig::load(path).await {
            Ok(router_config) => {
                tracing::info!("✅ Loaded {} routes from {}", router_config.agents.len(), path.display());
                router_config
            }
            Err(e) => {
                tracing::error!("❌ Failed to load router config {}: {}. Using built-in routes.", path.display(), e);
                RouterConfig::default()
            }
        },
        None => RouterConfig::default(),
    };

    let shared_state = Arc::new(AppState {
        chat: ChatService::new(store, agents),
        bi,
        dispatcher: Dispatcher::with_builtin_handlers(SemanticRouter::new(router_config)),
        db_pool,
        model_name: config.model.as_ref().map(|m| m.model.clone()),
    });

    let app = Router::new()
        .merge(handlers::api_routes())
        .layer(axum::middleware::from_fn(middleware::request_logging_middleware))
        .layer(CorsLayer::permissive())
        .layer(Extension(shared_state));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind listener");
    tracing::info!("🚀 Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Server error");
}

/// Metric-name normalisation needs a document directory; without one the
/// orchestrator keeps the metric name as the intent classifier found it.
async fn build_target_extractor(
    bi: &BiConfig,
    model_config: &ModelConfig,
    model: Arc<dyn ChatModel>,
) -> Result<Option<Arc<TargetExtractor>>, BiError> {
    let Some(docs_dir) = &bi.docs_dir else {
        tracing::info!("BI_DOCS_DIR not set. Metric names are used as extracted.");
        return Ok(None);
    };

    let embedder: Arc<dyn Embedder> = match &bi.embedding_model {
        Some(embedding_model) => {
            tracing::info!("Using embedding model {}", embedding_model);
            Arc::new(OpenAiEmbeddings::new(
                model_config.api_key.clone(),
                model_config.base_url.clone(),
                embedding_model.clone(),
                default_dimensions(embedding_model),
            ))
        }
        None => {
            tracing::warn!("EMBEDDING_MODEL not set. Using local hashing embeddings.");
            Arc::new(HashingEmbedder::default())
        }
    };

    let store: Arc<dyn VectorStore> = match &bi.qdrant_url {
        Some(url) => {
            let qdrant = QdrantVectorStore::new(url, bi.qdrant_api_key.clone())?;
            qdrant.ensure_collection(embedder.dimensions()).await?;
            tracing::info!("✅ Qdrant vector store ready at {}", url);
            Arc::new(qdrant)
        }
        None => Arc::new(LocalVectorStore::open(&bi.db_path).await?),
    };

    let index = DocumentIndex::open(docs_dir, &bi.db_path).await?;
    let cache = QueryCache::new(bi.cache_size, Duration::from_secs(bi.cache_ttl_secs));
    let extractor = TargetExtractor::new(model, embedder, store, cache, bi.top_k).with_documents(index);

    match extractor.refresh_documents().await {
        Ok(report) => tracing::info!(
            "✅ Documents indexed from {}: {} added, {} updated, {} removed, {} chunks written",
            docs_dir.display(),
            report.added.len(),
            report.updated.len(),
            report.removed.len(),
            report.chunks_written
        ),
        Err(e) => tracing::error!("❌ Document indexing failed: {}", e),
    }

    Ok(Some(Arc::new(extractor)))
}

fn log_configuration(config: &AppConfig) {
    let mark = |flag: bool| if flag { "✅" } else { "❌" };
    tracing::info!(
        "Configuration - Database: {}, LLM: {}, Embeddings: {}, Qdrant: {}, Documents: {}",
        mark(config.database_url.is_some()),
        mark(config.model.is_some()),
        mark(config.bi.embedding_model.is_some()),
        mark(config.bi.qdrant_url.is_some()),
        mark(config.bi.docs_dir.is_some())
    );
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,agentchat=trace,sqlx=info,reqwest=info,hyper=info,tower=info".to_string()
        } else {
            "info,agentchat=info,sqlx=warn,reqwest=warn,hyper=warn,tower=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("💬 AgentChat starting up...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Build mode: {}", if cfg!(debug_assertions) { "development" } else { "production" });
    tracing::info!("Log level: {}", log_level);

    Ok(())
}
