//! Configuration loading from `.env` files.

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::{
    filter::Subscription,
    ingest::IngestSettings,
    link::{Backoff, LinkSettings},
    parser::DEFAULT_JOB_KIND,
};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Relays to collect listings from.
    pub relays: Vec<String>,
    /// Tool server bind address, e.g. `127.0.0.1:8000`.
    pub bind_mcp: SocketAddr,
    /// Enable Schnorr signature verification on ingest.
    pub verify_sig: bool,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Event kind carrying job listings.
    pub job_kind: u32,
    /// Only accept listings from these authors. Empty accepts everyone.
    pub filter_authors: Vec<String>,
    /// Ask relays for listings newer than this Unix timestamp.
    pub filter_since: Option<u64>,
    pub dedup_window: usize,
    pub channel_capacity: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub connect_timeout: Duration,
    /// Evict listings older than this. `None` disables eviction.
    pub listing_ttl: Option<Duration>,
    pub evict_interval: Duration,
    pub max_tombstones: usize,
    pub snapshot_path: Option<PathBuf>,
    pub snapshot_interval: Duration,
    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let bind_mcp = env::var("BIND_MCP")
            .context("BIND_MCP is required")?
            .parse::<SocketAddr>()
            .context("BIND_MCP must be host:port")?;
        let listing_ttl = Some(number::<u64>("LISTING_TTL_SECS", 0)?)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let filter_since = match optional("FILTER_SINCE") {
            Some(s) => Some(s.parse::<u64>().context("FILTER_SINCE must be a Unix timestamp")?),
            None => None,
        };
        Ok(Self {
            relays: csv_strings(env::var("RELAYS").unwrap_or_default()),
            bind_mcp,
            verify_sig: flag("VERIFY_SIG"),
            tor_socks: optional("TOR_SOCKS"),
            job_kind: number("JOB_KIND", DEFAULT_JOB_KIND)?,
            filter_authors: csv_strings(env::var("FILTER_AUTHORS").unwrap_or_default()),
            filter_since,
            dedup_window: number("DEDUP_WINDOW", 4096)?,
            channel_capacity: number("CHANNEL_CAPACITY", 1024)?,
            backoff_base: Duration::from_millis(number("BACKOFF_BASE_MS", 1000)?),
            backoff_cap: Duration::from_millis(number("BACKOFF_CAP_MS", 30_000)?),
            connect_timeout: Duration::from_secs(number("CONNECT_TIMEOUT_SECS", 10)?),
            listing_ttl,
            evict_interval: Duration::from_secs(number::<u64>("EVICT_INTERVAL_SECS", 60)?.max(1)),
            max_tombstones: number("MAX_TOMBSTONES", 10_000)?,
            snapshot_path: optional("SNAPSHOT_PATH").map(PathBuf::from),
            snapshot_interval: Duration::from_secs(
                number::<u64>("SNAPSHOT_INTERVAL_SECS", 300)?.max(1),
            ),
            log_json: flag("LOG_JSON"),
        })
    }

    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            verify_sig: self.verify_sig,
            tor_socks: self.tor_socks.clone(),
            backoff: Backoff {
                base: self.backoff_base,
                cap: self.backoff_cap.max(self.backoff_base),
            },
            connect_timeout: self.connect_timeout,
            channel_capacity: self.channel_capacity,
        }
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            ttl: self.listing_ttl,
            evict_interval: self.evict_interval,
            snapshot_path: self.snapshot_path.clone(),
            snapshot_interval: self.snapshot_interval,
        }
    }

    /// The subscription issued on every relay.
    pub fn subscription(&self) -> Subscription {
        Subscription::job_listings(self.job_kind, &self.filter_authors, self.filter_since)
    }
}

/// A non-empty variable, trimmed.
fn optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn flag(key: &str) -> bool {
    matches!(optional(key).as_deref(), Some("1" | "true" | "yes"))
}

/// Parse a numeric variable, falling back to `default` when unset or empty.
fn number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        None => Ok(default),
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ENV_MUTEX;
    use std::fs;
    use tempfile::tempdir;

    const VARS: [&str; 18] = [
        "RELAYS",
        "BIND_MCP",
        "VERIFY_SIG",
        "TOR_SOCKS",
        "JOB_KIND",
        "FILTER_AUTHORS",
        "FILTER_SINCE",
        "DEDUP_WINDOW",
        "CHANNEL_CAPACITY",
        "BACKOFF_BASE_MS",
        "BACKOFF_CAP_MS",
        "CONNECT_TIMEOUT_SECS",
        "LISTING_TTL_SECS",
        "EVICT_INTERVAL_SECS",
        "MAX_TOMBSTONES",
        "SNAPSHOT_PATH",
        "SNAPSHOT_INTERVAL_SECS",
        "LOG_JSON",
    ];

    fn load(contents: &str) -> Result<Settings> {
        for v in VARS {
            env::remove_var(v);
        }
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, contents).unwrap();
        Settings::from_env(env_path.to_str().unwrap())
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = load(concat!(
            "RELAYS=\"ws://r1, wss://r2\"\n",
            "BIND_MCP=127.0.0.1:8000\n",
            "VERIFY_SIG=1\n",
            "TOR_SOCKS=127.0.0.1:9050\n",
            "JOB_KIND=30402\n",
            "FILTER_AUTHORS=npub1\n",
            "FILTER_SINCE=1700000000\n",
            "DEDUP_WINDOW=10\n",
            "BACKOFF_BASE_MS=250\n",
            "BACKOFF_CAP_MS=5000\n",
            "LISTING_TTL_SECS=86400\n",
            "SNAPSHOT_PATH=/tmp/jobs.json\n",
            "LOG_JSON=true\n",
        ))
        .unwrap();
        assert_eq!(cfg.relays, vec!["ws://r1", "wss://r2"]);
        assert_eq!(cfg.bind_mcp, "127.0.0.1:8000".parse().unwrap());
        assert!(cfg.verify_sig);
        assert_eq!(cfg.tor_socks.as_deref(), Some("127.0.0.1:9050"));
        assert_eq!(cfg.job_kind, 30402);
        assert_eq!(cfg.filter_authors, vec!["npub1"]);
        assert_eq!(cfg.filter_since, Some(1700000000));
        assert_eq!(cfg.dedup_window, 10);
        assert_eq!(cfg.listing_ttl, Some(Duration::from_secs(86400)));
        assert_eq!(cfg.snapshot_path, Some(PathBuf::from("/tmp/jobs.json")));
        assert!(cfg.log_json);

        let link = cfg.link_settings();
        assert_eq!(link.backoff.base, Duration::from_millis(250));
        assert_eq!(link.backoff.cap, Duration::from_millis(5000));
        assert!(link.verify_sig);

        let req = cfg.subscription().to_req("s");
        assert_eq!(req[2]["kinds"], serde_json::json!([30402]));
        assert_eq!(req[3]["#k"], serde_json::json!(["30402"]));
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = load("BIND_MCP=127.0.0.1:8000\nTOR_SOCKS=\nFILTER_AUTHORS=\n").unwrap();
        assert!(cfg.relays.is_empty());
        assert!(!cfg.verify_sig);
        assert!(cfg.tor_socks.is_none());
        assert_eq!(cfg.job_kind, 9993);
        assert!(cfg.filter_authors.is_empty());
        assert!(cfg.filter_since.is_none());
        assert_eq!(cfg.dedup_window, 4096);
        assert_eq!(cfg.channel_capacity, 1024);
        assert_eq!(cfg.backoff_base, Duration::from_secs(1));
        assert_eq!(cfg.backoff_cap, Duration::from_secs(30));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert!(cfg.listing_ttl.is_none());
        assert_eq!(cfg.max_tombstones, 10_000);
        assert!(cfg.snapshot_path.is_none());
        assert_eq!(cfg.snapshot_interval, Duration::from_secs(300));
        assert!(!cfg.log_json);

        let ingest = cfg.ingest_settings();
        assert!(ingest.ttl.is_none());
        assert_eq!(ingest.evict_interval, Duration::from_secs(60));
    }

    #[test]
    fn missing_bind_is_an_error() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        assert!(load("RELAYS=ws://r1\n").is_err());
        assert!(load("BIND_MCP=not-an-addr\n").is_err());
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        let err = load("BIND_MCP=127.0.0.1:8000\nDEDUP_WINDOW=lots\n").unwrap_err();
        assert!(err.to_string().contains("DEDUP_WINDOW"));
        assert!(load("BIND_MCP=127.0.0.1:8000\nFILTER_SINCE=yesterday\n").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        assert!(Settings::from_env("/nonexistent/.env").is_err());
    }

    #[test]
    fn csv_helper() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert_eq!(csv_strings(" ws://r1 ,wss://r2"), vec!["ws://r1", "wss://r2"]);
        assert!(csv_strings("").is_empty());
    }
}
