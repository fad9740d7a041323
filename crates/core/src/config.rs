use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fmt, fs, net::SocketAddr, path::Path, time::Duration};
use url::Url;

use crate::error::{AvionError, Result};

const API_KEY_VARS: [&str; 2] = ["AVION_GROQ_API_KEY", "GROQ_API_KEY"];

fn default_vendor_url() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_string()
}

fn default_proxy_url() -> String {
    "http://127.0.0.1:8787/api/groq-proxy".to_string()
}

fn default_model() -> String {
    "llama-3.1-8b-instant".to_string()
}

fn default_fallback_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_proxy_model() -> String {
    "llama3-8b-8192".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8787))
}

fn default_allowed_origin() -> String {
    "*".to_string()
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_proxy_temperature() -> f64 {
    0.7
}

const fn default_proxy_max_tokens() -> u32 {
    1000
}

const fn default_overall_readiness() -> f64 {
    65.0
}

const fn default_days_to_placement() -> i64 {
    120
}

/// Credential read from the environment. Never serialized or printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First non-empty key among `AVION_GROQ_API_KEY` and `GROQ_API_KEY`.
    pub fn from_env() -> Option<Self> {
        API_KEY_VARS
            .iter()
            .filter_map(|var| env::var(var).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .map(Self)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Where decision requests go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Call the vendor directly with a bearer credential.
    Direct,
    /// Call the proxy endpoint, which injects the credential itself.
    #[default]
    Proxy,
}

impl std::str::FromStr for UpstreamMode {
    type Err = AvionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "local" => Ok(UpstreamMode::Direct),
            "proxy" => Ok(UpstreamMode::Proxy),
            other => Err(AvionError::Config(format!(
                "unknown upstream mode '{other}' (expected direct|proxy)"
            ))),
        }
    }
}

/// Static inputs for the placement readiness explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementProfile {
    #[serde(default = "default_overall_readiness")]
    pub overall_readiness: f64,
    #[serde(default = "default_academic_breakdown")]
    pub academic_breakdown: BTreeMap<String, f64>,
    #[serde(default = "default_skill_breakdown")]
    pub skill_breakdown: BTreeMap<String, f64>,
    #[serde(default = "default_recent_trend")]
    pub recent_trend: String,
    #[serde(default = "default_weak_areas")]
    pub weak_areas: Vec<String>,
    #[serde(default = "default_strong_areas")]
    pub strong_areas: Vec<String>,
    /// Start of placement season. Without it a fixed 120-day horizon is assumed.
    #[serde(default)]
    pub placement_season: Option<NaiveDate>,
}

fn default_academic_breakdown() -> BTreeMap<String, f64> {
    [("DAA", 70.0), ("Java", 60.0), ("OS", 65.0)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn default_skill_breakdown() -> BTreeMap<String, f64> {
    [("Bash", 50.0), ("Python", 70.0), ("Security", 40.0)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn default_recent_trend() -> String {
    "improving".to_string()
}

fn default_weak_areas() -> Vec<String> {
    vec!["AI Security".into(), "Advanced Algorithms".into()]
}

fn default_strong_areas() -> Vec<String> {
    vec!["Python".into(), "Basic Java".into()]
}

impl Default for PlacementProfile {
    fn default() -> Self {
        Self {
            overall_readiness: default_overall_readiness(),
            academic_breakdown: default_academic_breakdown(),
            skill_breakdown: default_skill_breakdown(),
            recent_trend: default_recent_trend(),
            weak_areas: default_weak_areas(),
            strong_areas: default_strong_areas(),
            placement_season: None,
        }
    }
}

impl PlacementProfile {
    pub fn days_to_placement(&self, today: NaiveDate) -> i64 {
        self.placement_season
            .map(|season| (season - today).num_days().max(0))
            .unwrap_or_else(default_days_to_placement)
    }
}

/// Settings of the decision layer client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionConfig {
    #[serde(default)]
    pub mode: UpstreamMode,
    #[serde(default = "default_vendor_url")]
    pub vendor_url: String,
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub placement: PlacementProfile,
    #[serde(skip)]
    pub api_key: Option<ApiKey>,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            mode: UpstreamMode::default(),
            vendor_url: default_vendor_url(),
            proxy_url: default_proxy_url(),
            model: default_model(),
            fallback_model: default_fallback_model(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            placement: PlacementProfile::default(),
            api_key: None,
        }
    }
}

impl DecisionConfig {
    /// URL for the configured mode, validated.
    pub fn endpoint(&self) -> Result<Url> {
        let raw = match self.mode {
            UpstreamMode::Direct => &self.vendor_url,
            UpstreamMode::Proxy => &self.proxy_url,
        };
        parse_http_url(raw)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Settings of the credential-injecting proxy service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_vendor_url")]
    pub vendor_url: String,
    #[serde(default = "default_proxy_model")]
    pub default_model: String,
    #[serde(default = "default_proxy_temperature")]
    pub default_temperature: f64,
    #[serde(default = "default_proxy_max_tokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_allowed_origin")]
    pub allowed_origin: String,
    #[serde(skip)]
    pub api_key: Option<ApiKey>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            vendor_url: default_vendor_url(),
            default_model: default_proxy_model(),
            default_temperature: default_proxy_temperature(),
            default_max_tokens: default_proxy_max_tokens(),
            allowed_origin: default_allowed_origin(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl AppConfig {
    /// Layer environment overrides and credentials on top of the file values.
    ///
    ///   AVION_LLM_MODE  (direct|proxy)
    ///   AVION_LLM_URL   endpoint for the selected mode
    ///   AVION_GROQ_API_KEY / GROQ_API_KEY
    pub fn with_env(mut self) -> Self {
        if let Ok(mode) = env::var("AVION_LLM_MODE") {
            match mode.parse() {
                Ok(mode) => self.decision.mode = mode,
                Err(err) => tracing::warn!(error = %err, "ignoring AVION_LLM_MODE"),
            }
        }
        if let Ok(url) = env::var("AVION_LLM_URL").map(|u| u.trim().to_string()) {
            if !url.is_empty() {
                match self.decision.mode {
                    UpstreamMode::Direct => self.decision.vendor_url = url,
                    UpstreamMode::Proxy => self.decision.proxy_url = url,
                }
            }
        }
        let key = ApiKey::from_env();
        self.decision.api_key = key.clone();
        self.proxy.api_key = key;
        self
    }
}

pub fn parse_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| AvionError::Config(format!("invalid URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AvionError::Config(format!(
            "unsupported URL scheme '{other}' in '{raw}'"
        ))),
    }
}

/// Reads the YAML config; a missing or broken file falls back to defaults.
pub fn load_config<P: AsRef<Path>>(path: P) -> AppConfig {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to parse config YAML, falling back to defaults"
                );
                AppConfig::default()
            }
        },
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read config YAML, falling back to defaults"
            );
            AppConfig::default()
        }
    }
}

/// Reads an unsigned integer from the environment, warning on garbage.
pub fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {key}='{}' – falling back to {default}", v);
            default
        }),
        Err(_) => default,
    }
}
