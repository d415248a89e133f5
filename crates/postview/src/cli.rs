//! Exposes the command line application.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use suspend_cache::caching::ResourceCache;
use suspend_cache::config::Config;
use suspend_cache::hydration::DehydratedState;
use suspend_cache::{logging, metrics};
use tracing::level_filters::LevelFilter;

use postview::client::{DEFAULT_BASE_URL, PostClient};
use postview::output::{self, OutputFormat};
use postview::page::{PRELOAD_IDS, PostPage, PostView};
use postview::post::{Post, post_key};

/// Postview commands.
#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Shows posts one after another, like a reader navigating between them.
    Show {
        /// The ids of the posts to show.
        #[arg(required = true)]
        ids: Vec<i64>,

        /// Server state to inject before the first render, as written by `dehydrate`.
        #[arg(long, value_name = "FILE")]
        ssr: Option<PathBuf>,

        /// Warm the cache for the posts around the first one.
        #[arg(long)]
        preload: bool,

        /// Drop every post from the cache before showing it.
        #[arg(long)]
        refetch: bool,

        /// Retry a post once if it failed to load.
        #[arg(long)]
        reload: bool,
    },

    /// Loads posts and prints them as server state.
    Dehydrate {
        /// The ids of the posts to load.
        #[arg(required = true)]
        ids: Vec<i64>,
    },
}

/// Shows posts from a post API, loading each post at most once.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The severity level of logging output, overriding the configuration file.
    ///
    /// Possible values:
    /// off, error, warn, info, debug, trace
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,

    /// The base URL of the post API.
    #[arg(long, global = true, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// How long to wait for a single post, e.g. `10s` or `500ms`.
    #[arg(long, global = true, default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// The output format.
    #[arg(long, global = true, value_enum, default_value = "pretty")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is started below, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("postview")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    let client = PostClient::new(&cli.base_url, cli.timeout)?;
    let cache = ResourceCache::with_runtime(config.cache.clone(), runtime.handle().clone());

    runtime.block_on(async move {
        match cli.command {
            Command::Show {
                ids,
                ssr,
                preload,
                refetch,
                reload,
            } => {
                let mut page = PostPage::new(cache, client);
                if let Some(path) = ssr {
                    page = page.with_server_state(read_server_state(&path)?);
                }
                if preload {
                    page.preload(PRELOAD_IDS);
                }

                for id in ids {
                    let mut view = if refetch {
                        page.refetch(id).await?
                    } else {
                        page.render(id).await?
                    };
                    if reload && matches!(view, PostView::Failed { .. }) {
                        if let Some(reloaded) = page.reload().await? {
                            view = reloaded;
                        }
                    }
                    output::print(&view, cli.format)?;
                }
                Ok(())
            }
            Command::Dehydrate { ids } => {
                let state = dehydrate(&cache, &client, &ids).await?;
                println!("{}", serde_json::to_string_pretty(&state)?);
                Ok(())
            }
        }
    })
}

fn read_server_state(path: &Path) -> Result<DehydratedState> {
    let file = File::open(path)
        .with_context(|| format!("failed to open server state at {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file)).context("failed to parse server state")
}

/// Loads the given posts concurrently and dehydrates the ones that loaded.
async fn dehydrate(
    cache: &ResourceCache,
    client: &PostClient,
    ids: &[i64],
) -> Result<DehydratedState> {
    for &id in ids {
        cache.preload(&post_key(id), || client.fetch(id));
    }

    let mut keys = Vec::with_capacity(ids.len());
    for &id in ids {
        let key = post_key(id);
        match cache.load(&key, || client.fetch(id)).await {
            Ok(post) => {
                tracing::debug!(id, title = %post.title, "loaded post");
                keys.push(key);
            }
            Err(error) => {
                tracing::warn!(
                    id,
                    error = &error as &dyn std::error::Error,
                    "skipping post that failed to load"
                );
            }
        }
    }

    Ok(DehydratedState::from_cache::<Post, _>(cache, &keys)?)
}
