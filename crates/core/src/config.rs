use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `CADENCE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub send_time: SendTimeConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// What the executor does when the message gateway rejects a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailureMode {
    /// Count the failure and move on to the next step anyway.
    Advance,
    /// Keep the enrollment on the step and retry on the next invocation.
    Retry,
}

// ─── Executor Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    #[serde(default = "default_send_failure_mode")]
    pub on_send_failure: SendFailureMode,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_paused_sequence_recheck_secs")]
    pub paused_sequence_recheck_secs: u64,
}

fn default_batch_limit() -> usize { 50 }
fn default_claim_lease_secs() -> u64 { 300 }
fn default_send_failure_mode() -> SendFailureMode { SendFailureMode::Retry }
fn default_max_send_attempts() -> u32 { 3 }
fn default_paused_sequence_recheck_secs() -> u64 { 3600 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            claim_lease_secs: default_claim_lease_secs(),
            on_send_failure: default_send_failure_mode(),
            max_send_attempts: default_max_send_attempts(),
            paused_sequence_recheck_secs: default_paused_sequence_recheck_secs(),
        }
    }
}

// ─── Safety Config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u32,
}

fn default_cooldown_hours() -> u32 { 7 * 24 }

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: default_cooldown_hours(),
        }
    }
}

// ─── Send-Time Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SendTimeConfig {
    /// Business local time offset from UTC, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_anchor_offset_minutes")]
    pub anchor_offset_minutes: u32,
    #[serde(default = "default_window_start_hour")]
    pub window_start_hour: u32,
    #[serde(default = "default_window_end_hour")]
    pub window_end_hour: u32,
    #[serde(default = "default_preferred_start_hour")]
    pub preferred_start_hour: u32,
    #[serde(default = "default_preferred_end_hour")]
    pub preferred_end_hour: u32,
}

fn default_anchor_offset_minutes() -> u32 { 120 }
fn default_window_start_hour() -> u32 { 6 }
fn default_window_end_hour() -> u32 { 22 }
fn default_preferred_start_hour() -> u32 { 10 }
fn default_preferred_end_hour() -> u32 { 13 }

impl Default for SendTimeConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            anchor_offset_minutes: default_anchor_offset_minutes(),
            window_start_hour: default_window_start_hour(),
            window_end_hour: default_window_end_hour(),
            preferred_start_hour: default_preferred_start_hour(),
            preferred_end_hour: default_preferred_end_hour(),
        }
    }
}

// ─── Channels Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_from_number")]
    pub from_number: String,
}

fn default_from_email() -> String { "no-reply@cadence.local".to_string() }
fn default_from_name() -> String { "Cadence".to_string() }
fn default_from_number() -> String { "+15550000000".to_string() }

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            from_email: default_from_email(),
            from_name: default_from_name(),
            from_number: default_from_number(),
        }
    }
}

// Default functions
fn default_node_id() -> String {
    "cadence-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            executor: ExecutorConfig::default(),
            safety: SafetyConfig::default(),
            send_time: SendTimeConfig::default(),
            channels: ChannelsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, overlaid with
    /// environment variables (`CADENCE__EXECUTOR__BATCH_LIMIT=100`).
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        tracing::debug!(path = ?path, "loading configuration");
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CADENCE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
