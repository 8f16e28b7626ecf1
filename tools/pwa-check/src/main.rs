//! Precache and replay harness for the offline worker.
//!
//! Provides commands for:
//! - Installing the worker against a live origin and saving the caches
//! - Replaying a request through the worker, optionally with the network cut
//!
//! ## Usage
//!
//! ```bash
//! # Precache from a running site
//! pwa-check install --origin http://localhost:8000/ --snapshot caches.json
//!
//! # What does a page load look like with no network?
//! pwa-check fetch http://localhost:8000/portal/ --navigate --offline --snapshot caches.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::{BoxFuture, FutureExt};
use pwa_common::{try_init_logging, LogConfig, LogFormat, OfflineConfig};
use pwa_net::{Fetcher, HttpFetcher, LoaderConfig, NetError, Request, RequestMode, Response};
use pwa_sw::{CacheStorage, OfflineWorker, RegistrationOptions, ServiceWorkerContainer};
use serde_json::json;
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "pwa-check")]
#[command(about = "Precache and replay harness for the offline worker")]
struct Cli {
    /// Worker configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured origin
    #[arg(long, global = true)]
    origin: Option<Url>,

    /// Cache snapshot file
    #[arg(short, long, global = true, default_value = "pwa-caches.json")]
    snapshot: PathBuf,

    /// Log format: pretty, compact or json [default: $PWA_LOG_FORMAT or pretty]
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the worker against the origin and save its caches
    Install,

    /// Send one request through the restored worker
    Fetch {
        /// Request URL (absolute, or relative to the origin)
        url: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Fail every network request
        #[arg(long)]
        offline: bool,
    },
}

/// Network that is never reachable.
struct Disconnected;

impl Fetcher for Disconnected {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
        let url = request.url.to_string();
        async move { Err(NetError::ConnectionFailed(format!("{} (offline mode)", url))) }.boxed()
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<OfflineConfig> {
    let mut config = match cli.config {
        Some(ref path) => OfflineConfig::from_path(path)?,
        None => OfflineConfig::default(),
    };
    if let Some(ref origin) = cli.origin {
        config.origin = origin.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn install(cli: &Cli, config: &OfflineConfig) -> anyhow::Result<()> {
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(LoaderConfig::default())?);
    let caches = CacheStorage::load_or_default(&cli.snapshot)?;
    let (container, _events) = ServiceWorkerContainer::with_caches(fetcher, caches);

    let worker = Arc::new(OfflineWorker::new(config)?);
    let script = config.script_url()?;
    let id = container
        .register(script.as_str(), RegistrationOptions::default(), worker)
        .await
        .context("installing offline worker")?;

    let caches = container.scope().caches();
    let caches = caches.read().await;
    caches.save_to(&cli.snapshot)?;
    info!(snapshot = %cli.snapshot.display(), "Saved cache snapshot");

    let buckets: Vec<_> = caches
        .keys()
        .into_iter()
        .filter_map(|name| caches.get(name))
        .map(|cache| {
            let mut urls = cache.keys();
            urls.sort_unstable();
            json!({ "name": cache.name, "entries": urls })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "worker": id.to_string(),
            "script": script.as_str(),
            "caches": buckets,
        }))?
    );
    Ok(())
}

async fn fetch(
    cli: &Cli,
    config: &OfflineConfig,
    url: &str,
    navigate: bool,
    offline: bool,
) -> anyhow::Result<bool> {
    let fetcher: Arc<dyn Fetcher> = if offline {
        Arc::new(Disconnected)
    } else {
        Arc::new(HttpFetcher::new(LoaderConfig::default())?)
    };
    let caches = CacheStorage::load_from(&cli.snapshot)
        .with_context(|| format!("loading {}", cli.snapshot.display()))?;
    let (container, _events) = ServiceWorkerContainer::with_caches(fetcher, caches);

    let worker = Arc::new(OfflineWorker::new(config)?);
    container
        .restore(config.script_url()?.as_str(), RegistrationOptions::default(), worker)
        .await?;

    let mode = if navigate {
        RequestMode::Navigate
    } else {
        RequestMode::NoCors
    };
    let request = Request::get(config.resolve(url)?).mode(mode);

    let report = match container.handle_fetch(request).await {
        Ok(response) => json!({
            "ok": true,
            "status": response.status.as_u16(),
            "from_cache": response.is_from_cache(),
            "content_type": response.content_type().map(|m| m.to_string()),
            "bytes": response.body.len(),
        }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(report["ok"].as_bool().unwrap_or(false))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = match cli.log_format {
        Some(format) => LogConfig::default().with_format(format),
        None => LogConfig::from_env(),
    };
    try_init_logging(log_config)?;

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Install => install(&cli, &config).await,
        Commands::Fetch {
            ref url,
            navigate,
            offline,
        } => {
            if !fetch(&cli, &config, url, navigate, offline).await? {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
