//! Inference quality evaluation.
//!
//! Replays a repository's recently labeled issues through inference
//! with their labels stripped, then scores the predictions against the
//! labels humans actually applied.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use labeler::ai::OpenAiProvider;
use labeler::config::{Config, GitHubCredentials};
use labeler::github::AppAuth;
use labeler::infer::{InferRequest, Labeler};
use labeler::tokens::TokenCounter;

#[derive(Parser)]
#[command(name = "labeler-eval", about = "Score label inference against human labels")]
struct Args {
    /// Repository to evaluate, as owner/name
    #[arg(long)]
    repo: String,

    /// Number of labeled issues to replay
    #[arg(long, default_value_t = 20)]
    count: usize,

    /// Concurrent inference calls
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Completion model
    #[arg(long, env = "OPENAI_MODEL", default_value = "gpt-4o")]
    model: String,
}

#[derive(Default)]
struct Score {
    exact: usize,
    true_positives: usize,
    false_positives: usize,
    false_negatives: usize,
    tokens_used: u64,
    failures: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let Some((owner, repo)) = args.repo.split_once('/') else {
        bail!("--repo must be owner/name");
    };
    let (owner, repo) = (owner.to_string(), repo.to_string());

    let config = Config::from_env()?;
    let auth = Arc::new(match &config.github {
        GitHubCredentials::App {
            app_id,
            private_key_pem,
        } => AppAuth::new_app(app_id.clone(), private_key_pem)?,
        GitHubCredentials::Token(token) => AppAuth::new_token(token.clone())?,
    });

    // Static tokens cannot look up installations; any ID resolves the
    // same client in that mode.
    let install_id = match auth.install_id_for_repo(&owner, &repo).await {
        Ok(id) => id,
        Err(err) => {
            warn!(error = %err, "installation lookup failed; assuming static token");
            0
        }
    };

    let client = auth.installation_client(install_id).await?;
    let issues = client
        .list_issues(&owner, &repo, args.count * 3)
        .await
        .context("list issues")?;
    let sample: Vec<_> = issues
        .into_iter()
        .filter(|i| !i.labels.is_empty())
        .take(args.count)
        .collect();
    if sample.is_empty() {
        bail!("no labeled issues found in {owner}/{repo}");
    }
    info!(sample = sample.len(), "replaying labeled issues");

    let provider = Arc::new(OpenAiProvider::new(config.openai_api_key.clone()));
    let counter = Arc::new(TokenCounter::new()?);
    let labeler = Arc::new(Labeler::new(
        Arc::clone(&auth),
        provider,
        counter,
        args.model.clone(),
    ));

    let semaphore = Arc::new(Semaphore::new(args.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for issue in sample {
        let labeler = Arc::clone(&labeler);
        let semaphore = Arc::clone(&semaphore);
        let (owner, repo) = (owner.clone(), repo.clone());
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let req = InferRequest {
                install_id,
                owner,
                repo,
                issue: issue.number,
                test_mode: true,
            };
            let actual: Vec<String> = issue.labels.iter().map(|l| l.name.clone()).collect();
            (issue.number, actual, labeler.infer(&req).await)
        });
    }

    let mut score = Score::default();
    let mut scored = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let (number, actual, result) = joined.context("join inference task")?;
        match result {
            Ok(response) => {
                scored += 1;
                score.tokens_used += u64::from(response.tokens_used);
                let predicted = &response.set_labels;
                let tp = predicted.iter().filter(|l| actual.contains(l)).count();
                score.true_positives += tp;
                score.false_positives += predicted.len() - tp;
                score.false_negatives += actual.len() - tp;
                let exact = tp == actual.len() && predicted.len() == actual.len();
                if exact {
                    score.exact += 1;
                }
                info!(
                    issue = number,
                    predicted = ?predicted,
                    actual = ?actual,
                    exact,
                    "scored"
                );
            }
            Err(err) => {
                score.failures += 1;
                warn!(issue = number, error = %err, "inference failed");
            }
        }
    }

    let precision = ratio(
        score.true_positives,
        score.true_positives + score.false_positives,
    );
    let recall = ratio(
        score.true_positives,
        score.true_positives + score.false_negatives,
    );
    println!("issues scored:   {scored} ({} failed)", score.failures);
    println!("exact matches:   {} ({:.0}%)", score.exact, ratio(score.exact, scored) * 100.0);
    println!("precision:       {precision:.2}");
    println!("recall:          {recall:.2}");
    println!("tokens used:     {}", score.tokens_used);
    Ok(())
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}
