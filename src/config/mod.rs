//! Configuration structures and loading

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main backplane configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfiguration,

    /// System paths and settings
    #[serde(default)]
    pub system: SystemConfiguration,

    /// Docker runtime configuration
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Resource tier table
    #[serde(default)]
    pub tiers: TierTable,

    /// Timeouts for long-running operations
    #[serde(default)]
    pub timeouts: TimeoutConfiguration,

    /// Per-provider agent CLI configuration
    #[serde(default)]
    pub providers: ProviderTable,

    /// Upstream AI provider credentials forwarded into containers.
    /// Populated from the host environment, never from the config file.
    #[serde(skip)]
    pub upstream: UpstreamEnv,
}

impl Configuration {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        config.apply_env_overrides();

        std::fs::create_dir_all(&config.system.data_directory)?;
        if let Some(parent) = config.system.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        Ok(config)
    }

    /// Deployment overrides come from the process environment
    fn apply_env_overrides(&mut self) {
        if let Ok(image) = std::env::var("AGENT_RUNTIME_IMAGE") {
            self.docker.image = image;
        }
        if let Ok(network) = std::env::var("AGENT_RUNTIME_NETWORK") {
            self.docker.network = network;
        }
        if let Ok(dir) = std::env::var("AGENT_DATA_DIR") {
            self.system.data_directory = PathBuf::from(dir);
        }

        self.upstream = UpstreamEnv::from_env();
    }

    /// A configuration suitable for unit tests (no file IO)
    pub fn for_tests() -> Self {
        let mut config = Configuration {
            debug: true,
            api: ApiConfiguration::default(),
            system: SystemConfiguration::default(),
            docker: DockerConfiguration::default(),
            tiers: TierTable::default(),
            timeouts: TimeoutConfiguration::default(),
            providers: ProviderTable::default(),
            upstream: UpstreamEnv::default(),
        };
        config.system.data_directory = std::env::temp_dir().join("agent-backplane-tests");
        config
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfiguration {
    /// Host to bind to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".into()
}

fn default_api_port() -> u16 {
    8080
}

/// System paths and in-container locations
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfiguration {
    /// Host directory holding one data directory per user
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// SQLite database path for the container registry
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// In-container root for container-native projects
    #[serde(default = "default_projects_root")]
    pub projects_root: String,

    /// In-container workspace mount point
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            data_directory: default_data_directory(),
            database_path: default_database_path(),
            projects_root: default_projects_root(),
            workspace_root: default_workspace_root(),
        }
    }
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("/var/lib/agent-backplane/users")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("/var/lib/agent-backplane/registry.db")
}

fn default_projects_root() -> String {
    "/home/node/.claude/projects".into()
}

fn default_workspace_root() -> String {
    "/workspace".into()
}

/// Docker runtime configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfiguration {
    /// Image used for user containers
    #[serde(default = "default_image")]
    pub image: String,

    /// Docker network attached to user containers
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            image: default_image(),
            network: default_network(),
        }
    }
}

fn default_image() -> String {
    "agent-backplane/runtime:latest".into()
}

fn default_network() -> String {
    "bridge".into()
}

/// Resource tier selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTier {
    Free,
    Pro,
    Enterprise,
}

impl ResourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceTier::Free => "free",
            ResourceTier::Pro => "pro",
            ResourceTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(ResourceTier::Free),
            "pro" => Some(ResourceTier::Pro),
            "enterprise" => Some(ResourceTier::Enterprise),
            _ => None,
        }
    }
}

impl Default for ResourceTier {
    fn default() -> Self {
        ResourceTier::Free
    }
}

impl std::fmt::Display for ResourceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource caps applied to a container at creation
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierLimits {
    /// Memory limit in bytes
    pub memory_bytes: i64,
    /// CPU quota in microseconds per period
    pub cpu_quota: i64,
    /// CPU period in microseconds
    pub cpu_period: i64,
}

/// Tier -> limits table
#[derive(Debug, Clone, Deserialize)]
pub struct TierTable {
    #[serde(default = "default_free_limits")]
    pub free: TierLimits,
    #[serde(default = "default_pro_limits")]
    pub pro: TierLimits,
    #[serde(default = "default_enterprise_limits")]
    pub enterprise: TierLimits,
}

impl TierTable {
    /// Look up the limits for a tier
    pub fn limits(&self, tier: ResourceTier) -> TierLimits {
        match tier {
            ResourceTier::Free => self.free,
            ResourceTier::Pro => self.pro,
            ResourceTier::Enterprise => self.enterprise,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            free: default_free_limits(),
            pro: default_pro_limits(),
            enterprise: default_enterprise_limits(),
        }
    }
}

fn default_free_limits() -> TierLimits {
    TierLimits {
        memory_bytes: 2 * 1024 * 1024 * 1024,
        cpu_quota: 100_000,
        cpu_period: 100_000,
    }
}

fn default_pro_limits() -> TierLimits {
    TierLimits {
        memory_bytes: 4 * 1024 * 1024 * 1024,
        cpu_quota: 200_000,
        cpu_period: 100_000,
    }
}

fn default_enterprise_limits() -> TierLimits {
    TierLimits {
        memory_bytes: 8 * 1024 * 1024 * 1024,
        cpu_quota: 400_000,
        cpu_period: 100_000,
    }
}

/// Timeouts for long-running operations, all configurable
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeoutConfiguration {
    /// Hard wall-clock deadline for an agent query, in seconds
    #[serde(default = "default_query_secs")]
    pub query_secs: u64,

    /// Container readiness deadline, in seconds
    #[serde(default = "default_readiness_secs")]
    pub readiness_secs: u64,

    /// PTY idle window after client disconnect, in seconds
    #[serde(default = "default_pty_idle_secs")]
    pub pty_idle_secs: u64,

    /// Container idle threshold before the reaper destroys it, in seconds
    #[serde(default = "default_container_idle_secs")]
    pub container_idle_secs: u64,

    /// Reaper scan interval, in seconds
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Optimistic in-container file write timeout, in seconds
    #[serde(default = "default_file_write_secs")]
    pub file_write_secs: u64,
}

impl Default for TimeoutConfiguration {
    fn default() -> Self {
        Self {
            query_secs: default_query_secs(),
            readiness_secs: default_readiness_secs(),
            pty_idle_secs: default_pty_idle_secs(),
            container_idle_secs: default_container_idle_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            file_write_secs: default_file_write_secs(),
        }
    }
}

fn default_query_secs() -> u64 {
    300
}

fn default_readiness_secs() -> u64 {
    60
}

fn default_pty_idle_secs() -> u64 {
    30 * 60
}

fn default_container_idle_secs() -> u64 {
    2 * 60 * 60
}

fn default_reaper_interval_secs() -> u64 {
    30 * 60
}

fn default_file_write_secs() -> u64 {
    3
}

/// One agent provider's in-container entrypoints
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Shell invocation of the SDK runner for streamed queries
    pub runner: String,

    /// Interactive CLI name for PTY sessions
    pub shell_cli: String,
}

/// Provider name -> CLI configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTable {
    #[serde(default = "default_claude_provider")]
    pub claude: ProviderConfig,
    #[serde(default = "default_cursor_provider")]
    pub cursor: ProviderConfig,
    #[serde(default = "default_codex_provider")]
    pub codex: ProviderConfig,
}

impl Default for ProviderTable {
    fn default() -> Self {
        Self {
            claude: default_claude_provider(),
            cursor: default_cursor_provider(),
            codex: default_codex_provider(),
        }
    }
}

fn default_claude_provider() -> ProviderConfig {
    ProviderConfig {
        runner: "node /app/sdk/claude-runner.mjs".into(),
        shell_cli: "claude".into(),
    }
}

fn default_cursor_provider() -> ProviderConfig {
    ProviderConfig {
        runner: "node /app/sdk/cursor-runner.mjs".into(),
        shell_cli: "cursor-agent".into(),
    }
}

fn default_codex_provider() -> ProviderConfig {
    ProviderConfig {
        runner: "node /app/sdk/codex-runner.mjs".into(),
        shell_cli: "codex".into(),
    }
}

/// Upstream AI provider environment forwarded into containers
#[derive(Debug, Clone, Default)]
pub struct UpstreamEnv {
    pub base_url: Option<String>,
    pub auth_token: Option<String>,
    pub model: Option<String>,
}

impl UpstreamEnv {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("ANTHROPIC_BASE_URL").ok(),
            auth_token: std::env::var("ANTHROPIC_AUTH_TOKEN").ok(),
            model: std::env::var("ANTHROPIC_MODEL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.timeouts.query_secs, 300);
        assert_eq!(config.system.workspace_root, "/workspace");
        assert_eq!(config.system.projects_root, "/home/node/.claude/projects");
    }

    #[test]
    fn test_tier_table_lookup() {
        let tiers = TierTable::default();
        assert_eq!(
            tiers.limits(ResourceTier::Free).memory_bytes,
            2 * 1024 * 1024 * 1024
        );
        assert_eq!(tiers.limits(ResourceTier::Pro).cpu_quota, 200_000);
        assert_eq!(tiers.limits(ResourceTier::Enterprise).cpu_period, 100_000);
    }

    #[test]
    fn test_tier_parse_round_trip() {
        for tier in [
            ResourceTier::Free,
            ResourceTier::Pro,
            ResourceTier::Enterprise,
        ] {
            assert_eq!(ResourceTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(ResourceTier::parse("platinum"), None);
    }

    #[test]
    fn test_partial_toml_override() {
        let config: Configuration = toml::from_str(
            r#"
            [api]
            port = 9000

            [tiers.free]
            memory_bytes = 1024
            cpu_quota = 50000
            cpu_period = 100000
            "#,
        )
        .unwrap();

        assert_eq!(config.api.port, 9000);
        assert_eq!(config.tiers.limits(ResourceTier::Free).memory_bytes, 1024);
        // Untouched tiers keep their defaults
        assert_eq!(config.tiers.limits(ResourceTier::Pro).cpu_quota, 200_000);
    }
}
