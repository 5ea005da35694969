//! Service entry point: HTTP server plus the background indexer.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use labeler::ai::OpenAiProvider;
use labeler::config::{Config, GitHubCredentials};
use labeler::github::AppAuth;
use labeler::indexer::Indexer;
use labeler::infer::Labeler;
use labeler::search::SearchService;
use labeler::server::{router, AppState};
use labeler::store::{IssueIndex, MemoryIndex};
use labeler::tokens::TokenCounter;

#[cfg(feature = "postgres")]
async fn build_index(url: &str) -> Result<Arc<dyn IssueIndex>> {
    Ok(Arc::new(labeler::store::PostgresIndex::connect(url).await?))
}

#[cfg(not(feature = "postgres"))]
async fn build_index(_url: &str) -> Result<Arc<dyn IssueIndex>> {
    anyhow::bail!("DATABASE_URL is set but this build has no postgres support")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let auth = Arc::new(match &config.github {
        GitHubCredentials::App {
            app_id,
            private_key_pem,
        } => AppAuth::new_app(app_id.clone(), private_key_pem)?,
        GitHubCredentials::Token(token) => AppAuth::new_token(token.clone())?,
    });
    let provider = Arc::new(OpenAiProvider::new(config.openai_api_key.clone()));
    let counter = Arc::new(TokenCounter::new()?);

    let index: Arc<dyn IssueIndex> = match &config.database_url {
        Some(url) => build_index(url).await?,
        None => {
            info!("no DATABASE_URL; using in-memory issue index");
            Arc::new(MemoryIndex::new())
        }
    };

    let labeler = Arc::new(Labeler::new(
        Arc::clone(&auth),
        Arc::clone(&provider) as _,
        Arc::clone(&counter),
        config.model.clone(),
    ));
    let search = Arc::new(SearchService::new(
        Arc::clone(&auth),
        Arc::clone(&provider) as _,
        Arc::clone(&index),
        Arc::clone(&counter),
    ));

    let indexer = Indexer::new(
        Arc::clone(&auth),
        Arc::clone(&provider) as _,
        index,
        counter,
        config.index_interval,
    );
    tokio::spawn(indexer.run());

    let state = AppState {
        labeler,
        search,
        auth,
        webhook_secret: config.webhook_secret.clone(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, model = %config.model, "labeler listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    Ok(())
}
