//! Environment configuration, store and extractor wiring, and the channel registry file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;
use tubecrawl_adapters::{DataApiExtractor, ExtractionPort, ExtractorKind, FixtureExtractor, YtDlpExtractor};
use tubecrawl_storage::{CrawlStore, HttpFetcher, HttpFetcherConfig, MemoryStore, PgStore};

use crate::jitter::JitterPolicy;
use crate::orchestrator::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_ITEMS};
use crate::queue::GroupEntry;

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub extractor: ExtractorKind,
    pub fixtures_dir: PathBuf,
    pub ytdlp_path: PathBuf,
    pub proxy_url: Option<String>,
    pub youtube_api_key: Option<String>,
    pub user_agent: String,
    pub call_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub max_items: usize,
    pub batch_size: usize,
    pub jitter_enabled: bool,
    pub registry_path: PathBuf,
}

/// Data API requests are spaced at least this far apart.
const DATA_API_MIN_INTERVAL: Duration = Duration::from_millis(100);

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Unset or blank selects the fixture extractor; anything else must name a
/// known extractor.
fn parse_extractor(raw: Option<&str>) -> Result<ExtractorKind> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(ExtractorKind::Fixture),
        Some(value) => value
            .parse()
            .map_err(|err: String| anyhow::anyhow!("TUBECRAWL_EXTRACTOR: {err}")),
    }
}

impl CrawlConfig {
    pub fn from_env() -> Result<Self> {
        let extractor = parse_extractor(std::env::var("TUBECRAWL_EXTRACTOR").ok().as_deref())?;
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            db_max_connections: env_parse("TUBECRAWL_DB_MAX_CONNECTIONS", 10),
            extractor,
            fixtures_dir: std::env::var("TUBECRAWL_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures")),
            ytdlp_path: std::env::var("YTDLP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("yt-dlp")),
            proxy_url: std::env::var("TUBECRAWL_PROXY_URL").ok().filter(|v| !v.is_empty()),
            youtube_api_key: std::env::var("YOUTUBE_API_KEY").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("TUBECRAWL_USER_AGENT")
                .unwrap_or_else(|_| "tubecrawl/0.1".to_string()),
            call_timeout_secs: env_parse("TUBECRAWL_CALL_TIMEOUT_SECS", 30),
            http_timeout_secs: env_parse("TUBECRAWL_HTTP_TIMEOUT_SECS", 20),
            max_items: env_parse("TUBECRAWL_MAX_ITEMS", DEFAULT_MAX_ITEMS),
            batch_size: env_parse("TUBECRAWL_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            jitter_enabled: std::env::var("TUBECRAWL_JITTER")
                .map(|v| !matches!(v.as_str(), "0" | "off" | "false" | "OFF" | "False"))
                .unwrap_or(true),
            registry_path: std::env::var("TUBECRAWL_CHANNELS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("channels.yaml")),
        })
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn jitter(&self) -> JitterPolicy {
        if self.jitter_enabled {
            JitterPolicy::default()
        } else {
            JitterPolicy::none()
        }
    }
}

/// Postgres when `DATABASE_URL` is set (migrations applied), otherwise an
/// in-memory store scoped to this process.
pub async fn build_store(config: &CrawlConfig) -> Result<Arc<dyn CrawlStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.db_max_connections).await?;
            store.migrate().await?;
            info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub fn build_extractor(config: &CrawlConfig) -> Result<Arc<dyn ExtractionPort>> {
    let port: Arc<dyn ExtractionPort> = match config.extractor {
        ExtractorKind::Fixture => Arc::new(FixtureExtractor::from_dir(&config.fixtures_dir)?),
        ExtractorKind::YtDlp => Arc::new(
            YtDlpExtractor::new(&config.ytdlp_path, config.call_timeout())
                .with_proxy(config.proxy_url.clone()),
        ),
        ExtractorKind::DataApi => {
            let Some(api_key) = config.youtube_api_key.clone() else {
                bail!("YOUTUBE_API_KEY must be set for the data-api extractor");
            };
            let http = HttpFetcher::new(HttpFetcherConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                min_interval: Some(DATA_API_MIN_INTERVAL),
                ..HttpFetcherConfig::default()
            })?;
            Arc::new(DataApiExtractor::new(Arc::new(http), api_key))
        }
    };
    info!(extractor = port.name(), "extractor configured");
    Ok(port)
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRegistry {
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub url: String,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ChannelRegistry {
    /// Enabled entries only, with missing caps filled from `default_max_items`.
    pub fn group_entries(&self, default_max_items: usize) -> Vec<GroupEntry> {
        self.channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| GroupEntry {
                source_url: c.url.clone(),
                max_items: c.max_items.unwrap_or(default_max_items),
            })
            .collect()
    }
}

pub fn load_channel_registry(path: impl AsRef<Path>) -> Result<ChannelRegistry> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[test]
    fn checked_in_registry_parses() {
        let registry = load_channel_registry(workspace_root().join("channels.yaml")).unwrap();
        assert!(!registry.channels.is_empty());
        let entries = registry.group_entries(DEFAULT_MAX_ITEMS);
        assert!(entries.iter().all(|e| e.max_items > 0));
        assert!(entries.len() < registry.channels.len());
    }

    #[test]
    fn registry_defaults_enabled_and_cap() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "channels:\n  - url: https://www.youtube.com/@a\n  - url: https://www.youtube.com/@b\n    max_items: 3\n    enabled: false\n"
        )
        .unwrap();
        let registry = load_channel_registry(file.path()).unwrap();
        assert_eq!(
            registry.group_entries(7),
            vec![GroupEntry {
                source_url: "https://www.youtube.com/@a".into(),
                max_items: 7,
            }]
        );
    }

    #[test]
    fn data_api_requires_a_key() {
        let mut config = CrawlConfig::from_env().unwrap();
        config.extractor = ExtractorKind::DataApi;
        config.youtube_api_key = None;
        assert!(build_extractor(&config).is_err());
    }

    #[test]
    fn fixture_extractor_loads_from_checked_in_fixtures() {
        let mut config = CrawlConfig::from_env().unwrap();
        config.extractor = ExtractorKind::Fixture;
        config.fixtures_dir = workspace_root().join("fixtures");
        let port = build_extractor(&config).unwrap();
        assert_eq!(port.name(), "fixture");
    }

    #[test]
    fn misspelled_extractor_is_rejected() {
        assert_eq!(parse_extractor(None).unwrap(), ExtractorKind::Fixture);
        assert_eq!(parse_extractor(Some("  ")).unwrap(), ExtractorKind::Fixture);
        assert_eq!(parse_extractor(Some("yt-dlp")).unwrap(), ExtractorKind::YtDlp);
        assert_eq!(parse_extractor(Some("data-api")).unwrap(), ExtractorKind::DataApi);
        let err = parse_extractor(Some("yt_dlp")).unwrap_err();
        assert!(err.to_string().contains("TUBECRAWL_EXTRACTOR"), "{err}");
    }

    #[test]
    fn jitter_can_be_disabled() {
        let mut config = CrawlConfig::from_env().unwrap();
        config.jitter_enabled = false;
        assert_eq!(config.jitter(), JitterPolicy::none());
    }
}
