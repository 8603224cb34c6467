//! Environment settings plus the YAML source registry and digest customisation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use oppbot_adapters::{SourceKind, DEFAULT_MAX_RESULTS, DEFAULT_RAPIDAPI_HOST};
use oppbot_core::{BlockList, Category};
use oppbot_storage::DEFAULT_UNPROCESSED_LIMIT;
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

pub const DEFAULT_TABLE: &str = "opportunities";
pub const DEFAULT_SCHEDULE_CRON: &str = "0 0 14 * * *";
pub const DEFAULT_MESSAGE_TEMPLATE: &str = "[**{employer}**]({url}): {title} `@{location}`!";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Reads one variable; tests pass a closure over a map instead of the process environment.
pub trait EnvLookup {
    fn get(&self, name: &str) -> Option<String>;
}

impl<F> EnvLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        self(name).filter(|v| !v.trim().is_empty())
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn required(env: &impl EnvLookup, name: &'static str) -> Result<String, ConfigError> {
    env.get(name).ok_or(ConfigError::MissingEnv(name))
}

fn parsed<T: std::str::FromStr>(
    env: &impl EnvLookup,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match env.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value: raw }),
        None => Ok(default),
    }
}

pub fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub database_url: String,
    pub table: String,
}

impl StoreSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: required(env, "DATABASE_URL")?,
            table: env
                .get("OPPBOT_TABLE")
                .unwrap_or_else(|| DEFAULT_TABLE.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` only in dry-run mode.
    pub store: Option<StoreSettings>,
    pub webhook_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub rapid_api_key: Option<String>,
    pub sources_path: PathBuf,
    pub digest_path: PathBuf,
    pub filter_enabled: bool,
    pub filter_max_attempts: usize,
    pub filter_retry_delay: Duration,
    pub digest_limit: usize,
    pub max_per_source: usize,
    pub openai_base_url: String,
    pub llm_model: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub artifacts_dir: Option<PathBuf>,
    pub schedule_crons: Vec<String>,
    pub dry_run: bool,
}

impl SyncConfig {
    pub fn from_env(dry_run: bool) -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env, dry_run)
    }

    /// Validates required variables before anything touches the network.
    pub fn from_lookup(env: &impl EnvLookup, dry_run: bool) -> Result<Self, ConfigError> {
        let store = if dry_run {
            None
        } else {
            Some(StoreSettings::from_lookup(env)?)
        };
        let webhook_url = if dry_run {
            env.get("DISCORD_WEBHOOK_URL")
        } else {
            Some(required(env, "DISCORD_WEBHOOK_URL")?)
        };
        let filter_enabled = env
            .get("OPPBOT_FILTER_ENABLED")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);
        let openai_api_key = if filter_enabled {
            Some(required(env, "OPENAI_API_KEY")?)
        } else {
            env.get("OPENAI_API_KEY")
        };

        let filter_max_attempts: usize = parsed(env, "OPPBOT_FILTER_MAX_ATTEMPTS", 5)?;
        if filter_max_attempts == 0 {
            return Err(ConfigError::InvalidEnv {
                name: "OPPBOT_FILTER_MAX_ATTEMPTS",
                value: "0".into(),
            });
        }
        let retry_delay_ms: u64 = parsed(env, "OPPBOT_FILTER_RETRY_DELAY_MS", 500)?;

        let schedule_crons = env
            .get("OPPBOT_SCHEDULE_CRON")
            .unwrap_or_else(|| DEFAULT_SCHEDULE_CRON.to_string())
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();

        Ok(Self {
            store,
            webhook_url,
            openai_api_key,
            rapid_api_key: env.get("RAPID_API_KEY"),
            sources_path: env
                .get("OPPBOT_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            digest_path: env
                .get("OPPBOT_DIGEST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("digest.yaml")),
            filter_enabled,
            filter_max_attempts,
            filter_retry_delay: Duration::from_millis(retry_delay_ms),
            digest_limit: parsed(env, "OPPBOT_DIGEST_LIMIT", DEFAULT_UNPROCESSED_LIMIT)?,
            max_per_source: parsed(env, "OPPBOT_MAX_PER_SOURCE", DEFAULT_MAX_RESULTS)?,
            openai_base_url: env
                .get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            llm_model: env
                .get("OPPBOT_LLM_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            user_agent: env
                .get("OPPBOT_USER_AGENT")
                .unwrap_or_else(|| "oppbot/0.1".to_string()),
            http_timeout_secs: parsed(env, "OPPBOT_HTTP_TIMEOUT_SECS", 20)?,
            artifacts_dir: env.get("ARTIFACTS_DIR").map(PathBuf::from),
            schedule_crons,
            dry_run,
        })
    }

    /// RapidAPI key is only needed once the registry enables such a source.
    pub fn check_registry(&self, registry: &SourceRegistry) -> Result<(), ConfigError> {
        if registry.needs_rapidapi() && self.rapid_api_key.is_none() {
            return Err(ConfigError::MissingEnv("RAPID_API_KEY"));
        }
        Ok(())
    }
}

// ----------------- SOURCE REGISTRY -----------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub blocklist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub kind: SourceKind,
    pub category: Category,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub rapidapi_host: Option<String>,
}

impl SourceConfig {
    pub fn rapidapi_host(&self) -> &str {
        self.rapidapi_host.as_deref().unwrap_or(DEFAULT_RAPIDAPI_HOST)
    }
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }

    /// Categories with at least one enabled source, in registry order.
    pub fn categories(&self) -> Vec<Category> {
        let mut out = Vec::new();
        for source in self.enabled() {
            if !out.contains(&source.category) {
                out.push(source.category);
            }
        }
        out
    }

    pub fn needs_rapidapi(&self) -> bool {
        self.enabled().any(|s| s.kind == SourceKind::RapidapiIndeed)
    }

    pub fn blocklist(&self) -> BlockList {
        BlockList::with_extra(self.blocklist.iter().cloned())
    }
}

// ----------------- DIGEST SETTINGS -----------------

const FULL_TIME_PROMPT: &str = "Your role is to assess job opportunities for college students in the tech industry, particularly those pursuing Computer Science majors and seeking entry-level positions. To aid in this decision-making process, please respond with a minified single JSON list of booleans (True/False) only, indicating whether each job aligns with our goal of offering entry-level tech-related positions to college students. The list should contain only the booleans (True/False) without any additional comments.";

const INTERNSHIP_PROMPT: &str = "Your role is to assess internship opportunities for college students in the tech industry, particularly those pursuing Computer Science majors. To aid in this decision-making process, please respond with a minified single JSON list of booleans (True/False) only, indicating whether each job aligns with our goal of offering entry-level tech-related positions to college students. The list should contain only the booleans (True/False) without any additional comments.";

const CONFERENCE_PROMPT: &str = "Your role is to assess conference opportunities for college students in the tech industry, particularly those pursuing Computer Science majors. To aid in this decision-making process, please respond with a minified single JSON list of booleans (True/False) only, indicating whether each conference is relevant and accessible to college students. The list should contain only the booleans (True/False) without any additional comments.";

const SCHOLARSHIP_PROMPT: &str = "Your role is to assess scholarship opportunities for college students pursuing Computer Science or related majors. To aid in this decision-making process, please respond with a minified single JSON list of booleans (True/False) only, indicating whether each scholarship is open to college students in tech. The list should contain only the booleans (True/False) without any additional comments.";

pub fn default_prompt(category: Category) -> &'static str {
    match category {
        Category::FullTime => FULL_TIME_PROMPT,
        Category::Internship => INTERNSHIP_PROMPT,
        Category::Conference => CONFERENCE_PROMPT,
        Category::Scholarship => SCHOLARSHIP_PROMPT,
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DigestSettings {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub prompts: BTreeMap<Category, String>,
}

impl DigestSettings {
    /// A missing file yields the built-in defaults.
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn message_template(&self) -> &str {
        self.message.as_deref().unwrap_or(DEFAULT_MESSAGE_TEMPLATE)
    }

    pub fn prompt_for(&self, category: Category) -> &str {
        self.prompts
            .get(&category)
            .map(String::as_str)
            .unwrap_or_else(|| default_prompt(category))
    }
}
