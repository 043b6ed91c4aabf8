use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::models::Account;
use crate::passthrough::PassthroughRuleConfig;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    pub accounts: Vec<Account>,
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub passthrough: Vec<PassthroughRuleConfig>,
    pub observability: ObservabilityConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_max_account_switches")]
    pub max_account_switches: u32,
    #[serde(default = "default_slot_wait_timeout_ms")]
    pub slot_wait_timeout_ms: u64,
    #[serde(default = "default_sticky_ttl_secs")]
    pub sticky_ttl_secs: u64,
    #[serde(default = "default_waiting_multiplier")]
    pub waiting_multiplier: u32,
    #[serde(default = "default_session_header")]
    pub session_header: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_account_switches: default_max_account_switches(),
            slot_wait_timeout_ms: default_slot_wait_timeout_ms(),
            sticky_ttl_secs: default_sticky_ttl_secs(),
            waiting_multiplier: default_waiting_multiplier(),
            session_header: default_session_header(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

/// Client key record; stands in for the external key store.
#[derive(Clone, Debug, Deserialize)]
pub struct TenantConfig {
    pub api_key: String,
    pub key_id: i64,
    #[serde(default)]
    pub name: String,
    pub user_id: i64,
    pub group_id: i64,
    pub concurrency: u32,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otlp_grpc: OtlpGrpcConfig,
    #[serde(default)]
    pub exporters: ExportersConfig,
    #[serde(default)]
    pub audit_log: AuditLogConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpGrpcConfig {
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OtlpGrpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_otlp_endpoint(),
            timeout_ms: default_otlp_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ExportersConfig {
    #[serde(default = "default_exporter_kind")]
    pub tracing: String,
    #[serde(default = "default_exporter_kind")]
    pub metrics: String,
}

impl Default for ExportersConfig {
    fn default() -> Self {
        Self {
            tracing: default_exporter_kind(),
            metrics: default_exporter_kind(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            stdout: default_log_stdout(),
            file: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AuditLogConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_audit_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let path = std::env::var("CONFIG_PATH")
            .map_err(|_| "CONFIG_PATH is required (strict YAML)".to_string())?;
        let content = fs::read_to_string(&path)
            .map_err(|e| format!("CONFIG_PATH read error: {}", e))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .map_err(|e| format!("CONFIG_PATH invalid yaml: {}", e))?;
        config.normalize()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.server.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.server.read_timeout_ms)
    }

    pub fn slot_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.slot_wait_timeout_ms)
    }

    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.gateway.sticky_ttl_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.concurrency.ping_interval_secs)
    }

    /// Waiting-queue bound as a function of a concurrency budget.
    pub fn max_wait_for(&self, concurrency: u32) -> u32 {
        concurrency.saturating_mul(self.gateway.waiting_multiplier)
    }

    fn normalize(&mut self) -> Result<(), String> {
        if self.accounts.is_empty() {
            return Err("accounts is required".to_string());
        }
        for account in &self.accounts {
            if account.concurrency == 0 {
                return Err(format!("account {} concurrency must be positive", account.id));
            }
            if account.credentials.api_key.trim().is_empty() {
                return Err(format!("account {} api_key is required", account.id));
            }
            if account.credentials.base_url.trim().is_empty() {
                return Err(format!("account {} base_url is required", account.id));
            }
        }
        if self.tenants.is_empty() {
            return Err("tenants is required".to_string());
        }
        for tenant in &self.tenants {
            if tenant.api_key.trim().is_empty() {
                return Err(format!("tenant {} api_key is required", tenant.key_id));
            }
            if tenant.concurrency == 0 {
                return Err(format!("tenant {} concurrency must be positive", tenant.key_id));
            }
        }
        if self.gateway.max_account_switches == 0 {
            return Err("gateway.max_account_switches must be positive".to_string());
        }
        self.observability.logging.format = self.observability.logging.format.to_lowercase();
        self.observability.logging.level = self.observability.logging.level.to_lowercase();
        match self.observability.logging.format.as_str() {
            "text" | "json" => {}
            other => return Err(format!("logging.format invalid: {}", other)),
        }
        match self.observability.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("logging.level invalid: {}", other)),
        }
        Ok(())
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    120_000
}

fn default_pool_max_idle_per_host() -> usize {
    64
}

fn default_max_account_switches() -> u32 {
    3
}

fn default_slot_wait_timeout_ms() -> u64 {
    30_000
}

fn default_sticky_ttl_secs() -> u64 {
    1800
}

fn default_waiting_multiplier() -> u32 {
    3
}

fn default_session_header() -> String {
    "x-session-id".to_string()
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_service_name() -> String {
    "poolgate".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otlp_timeout_ms() -> u64 {
    3000
}

fn default_exporter_kind() -> String {
    "otlp_grpc".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_audit_max_file_bytes() -> u64 {
    64 * 1024 * 1024
}
