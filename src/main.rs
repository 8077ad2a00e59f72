//! Command line interface for the job listing index. Collects job listings
//! from Nostr relays into memory and serves them to agents over MCP, or
//! answers one-off searches from the terminal.

mod config;
mod error;
mod event;
mod filter;
mod index;
mod ingest;
mod link;
mod listing;
mod logging;
mod mcp;
mod parser;
mod pool;
mod query;
mod shared;
mod snapshot;
mod stats;
#[cfg(test)]
mod testutil;

use std::{fs, future::Future, path::Path, time::Duration};

use anyhow::bail;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use config::Settings;
use index::JobIndex;
use ingest::Ingestor;
use link::{LinkSettings, RelayLink};
use mcp::McpState;
use parser::ListingParser;
use pool::RelayPool;
use query::{QueryService, SearchParams};

/// Relays written to a fresh `.env`.
const DEFAULT_RELAYS: [&str; 5] = [
    "wss://relay.damus.io",
    "wss://relay.nostr.band",
    "wss://nos.lol",
    "wss://nostr-pub.wellorder.net",
    "wss://nostr.wine",
];

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "jobstr",
    author,
    version,
    about = "Nostr job listing index with an MCP tool server"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create a default `.env` file if none exists and validate it.
    Init,
    /// Collect listings and serve the MCP tool surface until interrupted.
    Serve,
    /// Collect listings once, then print those requiring a skill.
    Search {
        skill: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        employment_type: Option<String>,
        #[arg(long, default_value_t = query::DEFAULT_LIMIT)]
        limit: usize,
        /// Seconds to wait for relays to replay stored listings.
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Collect listings once, then print statistics.
    Stats {
        #[arg(long)]
        skill: Option<String>,
        #[arg(long, default_value_t = 10)]
        wait_secs: u64,
    },
    /// Manage the configured relays.
    Relays {
        #[command(subcommand)]
        action: RelayAction,
    },
}

/// Operations available under `jobstr relays`.
#[derive(Subcommand)]
enum RelayAction {
    /// Print the configured relays.
    List,
    /// Add a relay after validating its URL.
    Add { url: String },
    /// Remove a relay from the configuration.
    Remove { url: String },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    logging::init_tracing(logging::DEFAULT_FILTER, cfg.log_json);
    match cli.command {
        Commands::Init => {
            info!(env = %cli.env, relays = cfg.relays.len(), "configuration ready");
        }
        Commands::Serve => serve(cfg, shutdown_signal()).await?,
        Commands::Search {
            skill,
            company,
            employment_type,
            limit,
            wait_secs,
        } => {
            let params = SearchParams {
                skill,
                company,
                employment_type,
                limit: Some(limit),
            };
            let query = collect(&cfg, Duration::from_secs(wait_secs)).await?;
            print_json(&query.search_jobs(&params)?)?;
        }
        Commands::Stats { skill, wait_secs } => {
            let query = collect(&cfg, Duration::from_secs(wait_secs)).await?;
            print_json(&query.get_stats(skill.as_deref())?)?;
        }
        Commands::Relays { action } => handle_relays(action, &cli.env, &cfg)?,
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// Run ingestion and the tool server until `shutdown` resolves.
async fn serve(cfg: Settings, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let (writer, reader) = shared::shared(JobIndex::new(cfg.max_tombstones));
    let ingestor = Ingestor::new(ListingParser::new(cfg.job_kind), writer, cfg.ingest_settings());
    if let Err(e) = ingestor.restore_snapshot() {
        warn!(error = %e, "ignoring unreadable snapshot");
    }
    let mut pool = RelayPool::new(&cfg.relays, &cfg.link_settings(), cfg.dedup_window);
    let stream = pool.subscribe(cfg.subscription());
    let (ready_tx, ready) = watch::channel(false);
    let state = McpState {
        query: QueryService::new(reader),
        relays: pool.statuses(),
        ingest: ingestor.stats(),
        ready,
    };
    let ingest = tokio::spawn(ingestor.run(stream, ready_tx));
    info!(relays = pool.len(), job_kind = cfg.job_kind, "collecting job listings");

    let served = mcp::serve_mcp(cfg.bind_mcp, state, shutdown).await;
    pool.close().await;
    ingest.await?;
    served
}

/// Fill a fresh index from the relays, waiting up to `wait` for them to catch up.
async fn collect(cfg: &Settings, wait: Duration) -> anyhow::Result<QueryService> {
    let (writer, reader) = shared::shared(JobIndex::new(cfg.max_tombstones));
    let ingestor = Ingestor::new(ListingParser::new(cfg.job_kind), writer, cfg.ingest_settings());
    ingestor.restore_snapshot()?;
    let mut pool = RelayPool::new(&cfg.relays, &cfg.link_settings(), cfg.dedup_window);
    let stream = pool.subscribe(cfg.subscription());
    let (ready_tx, mut ready) = watch::channel(false);
    let ingest = tokio::spawn(ingestor.run(stream, ready_tx));

    let caught_up = tokio::time::timeout(wait, ready.wait_for(|r| *r))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
    if !caught_up {
        warn!(?wait, "relays did not catch up in time, answering from a partial index");
    }
    pool.close().await;
    ingest.await?;
    Ok(QueryService::new(reader))
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut content = String::new();
    content.push_str(&format!("RELAYS={}\n", DEFAULT_RELAYS.join(",")));
    content.push_str("BIND_MCP=127.0.0.1:8000\n");
    content.push_str("VERIFY_SIG=0\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str(&format!("JOB_KIND={}\n", parser::DEFAULT_JOB_KIND));
    content.push_str("FILTER_AUTHORS=\n");
    content.push_str("FILTER_SINCE=\n");
    content.push_str("LISTING_TTL_SECS=0\n");
    content.push_str("SNAPSHOT_PATH=\n");
    content.push_str("LOG_JSON=0\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn handle_relays(action: RelayAction, env_path: &str, cfg: &Settings) -> anyhow::Result<()> {
    let mut relays = cfg.relays.clone();
    match action {
        RelayAction::List => {
            for relay in &relays {
                println!("{relay}");
            }
            return Ok(());
        }
        RelayAction::Add { url } => {
            if relays.iter().any(|existing| existing == &url) {
                bail!("relay already configured: {url}");
            }
            RelayLink::connect(&url, LinkSettings::default())?;
            relays.push(url);
        }
        RelayAction::Remove { url } => {
            let before = relays.len();
            relays.retain(|existing| existing != &url);
            if relays.len() == before {
                bail!("relay not configured: {url}");
            }
        }
    }
    write_relays_to_env(env_path, &relays)
}

fn write_relays_to_env(env_path: &str, relays: &[String]) -> anyhow::Result<()> {
    let content = fs::read_to_string(env_path)?;
    let relays_joined = relays.join(",");
    let mut new_content = String::new();
    let mut replaced = false;
    for line in content.lines() {
        if line.starts_with("RELAYS=") {
            new_content.push_str(&format!("RELAYS={relays_joined}\n"));
            replaced = true;
        } else {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }
    if !replaced {
        new_content.push_str(&format!("RELAYS={relays_joined}\n"));
    }
    fs::write(env_path, new_content)?;
    std::env::set_var("RELAYS", relays_joined);
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{job_event, mock_relay, ENV_MUTEX};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, sync::oneshot, task};

    const VARS: [&str; 6] = [
        "RELAYS",
        "BIND_MCP",
        "VERIFY_SIG",
        "SNAPSHOT_PATH",
        "LISTING_TTL_SECS",
        "FILTER_AUTHORS",
    ];

    fn clear_env() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, content: &str) -> String {
        let env_path = dir.path().join(".env");
        fs::write(&env_path, content).unwrap();
        env_path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("conf/.env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        assert!(data.contains("BIND_MCP=127.0.0.1:8000"));
        assert!(data.contains("wss://relay.damus.io,wss://relay.nostr.band"));
        assert!(data.contains("JOB_KIND=9993"));
    }

    #[tokio::test]
    async fn relays_add_and_remove_update_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "BIND_MCP=127.0.0.1:0\nRELAYS=ws://one,ws://two\n");

        run(Cli {
            env: env_file.clone(),
            command: Commands::Relays {
                action: RelayAction::Remove {
                    url: "ws://one".into(),
                },
            },
        })
        .await
        .unwrap();
        let data = fs::read_to_string(&env_file).unwrap();
        assert!(data.contains("RELAYS=ws://two"));
        assert!(!data.contains("ws://one"));

        clear_env();
        run(Cli {
            env: env_file.clone(),
            command: Commands::Relays {
                action: RelayAction::Add {
                    url: "wss://three.example".into(),
                },
            },
        })
        .await
        .unwrap();
        let data = fs::read_to_string(&env_file).unwrap();
        assert!(data.contains("RELAYS=ws://two,wss://three.example"));

        clear_env();
        let bad = run(Cli {
            env: env_file.clone(),
            command: Commands::Relays {
                action: RelayAction::Add {
                    url: "http://nope".into(),
                },
            },
        })
        .await;
        assert!(bad.is_err());

        clear_env();
        let dup = run(Cli {
            env: env_file,
            command: Commands::Relays {
                action: RelayAction::Remove {
                    url: "ws://missing".into(),
                },
            },
        })
        .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn collect_waits_for_relays() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let relay = mock_relay(vec![
            job_event("a1", "k1", "s1", 1, &["Rust", "python"]),
            job_event("a2", "k1", "s1", 2, &["python"]),
            job_event("b1", "k2", "s1", 1, &["rust"]),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, &format!("BIND_MCP=127.0.0.1:0\nRELAYS={}\n", relay.url));
        let cfg = Settings::from_env(&env_file).unwrap();

        let query = collect(&cfg, Duration::from_secs(5)).await.unwrap();
        let found = query.search_jobs(&SearchParams::skill("rust")).unwrap();
        let ids: Vec<&str> = found.listings.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["b1"]);
        assert_eq!(query.listing_count(), 2);
    }

    #[tokio::test]
    async fn serve_answers_tool_calls_and_stops() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let relay = mock_relay(vec![job_event("a1", "k1", "s1", 1, &["rust"])]).await;
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let dir = TempDir::new().unwrap();
        let snapshot = dir.path().join("snapshot.json");
        let env_file = write_env(
            &dir,
            &format!(
                "BIND_MCP=127.0.0.1:{port}\nRELAYS={}\nSNAPSHOT_PATH={}\n",
                relay.url,
                snapshot.display()
            ),
        );
        let cfg = Settings::from_env(&env_file).unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = task::spawn(serve(cfg, async {
            let _ = stop_rx.await;
        }));

        let base = format!("http://127.0.0.1:{port}");
        let mut health = Value::Null;
        for _ in 0..50 {
            if let Ok(resp) = reqwest::get(format!("{base}/healthz")).await {
                health = resp.json().await.unwrap();
                if health["caughtUp"] == true {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(health["caughtUp"], true);
        assert_eq!(health["listings"], 1);

        let resp: Value = reqwest::Client::new()
            .post(format!("{base}/mcp"))
            .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                          "params": {"name": "search_jobs", "arguments": {"skill": "rust"}}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["result"]["structuredContent"]["listings"][0]["id"], "a1");

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(snapshot.exists());
    }
}
