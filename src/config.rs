use crate::lifecycle::{LifecyclePolicy, ShutdownAction};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix of every environment variable read by [`Config::apply_env`]
pub const ENV_PREFIX: &str = "IDLEGATE_";

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// UDP relay settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Idle lifecycle settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Managed backend containers
    #[serde(default)]
    pub backend: BackendConfig,

    /// HTTP control surface
    #[serde(default)]
    pub admin: AdminConfig,

    /// Default tracing directive, used when RUST_LOG is not set
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// UDP port clients connect to (required)
    #[serde(default)]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Backend address as host:port (required)
    pub target_address: Option<String>,

    /// Largest datagram relayed in either direction (default: 1500)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Milliseconds without traffic before a client is forgotten (default: 5000)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    /// Period of the idle sweep in milliseconds (default: 5000)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind: default_bind_address(),
            target_address: None,
            buffer_size: default_buffer_size(),
            connection_timeout_ms: default_connection_timeout(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl ProxyConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Address the inbound socket binds to
    pub fn listen_address(&self) -> String {
        if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleConfig {
    /// Milliseconds of global silence before the backend is paused or stopped (default: 60000)
    #[serde(default = "default_shutdown_delay")]
    pub shutdown_delay_ms: u64,

    /// Pause the backend instead of stopping it (default: false)
    #[serde(default)]
    pub pause: bool,

    /// Milliseconds a paused backend waits before it is stopped, 0 disables (default: 0)
    #[serde(default)]
    pub pause_duration_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_delay_ms: default_shutdown_delay(),
            pause: false,
            pause_duration_ms: 0,
        }
    }
}

impl LifecycleConfig {
    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    pub fn pause_duration(&self) -> Duration {
        Duration::from_millis(self.pause_duration_ms)
    }

    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            shutdown_delay: self.shutdown_delay(),
            action: if self.pause {
                ShutdownAction::Pause
            } else {
                ShutdownAction::Stop
            },
            pause_duration: self.pause_duration(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Name of a single container to manage
    pub container: Option<String>,

    /// Group name; selects containers labelled `idlegate.group.<group>`
    pub group: Option<String>,

    /// Docker host URL (default: DOCKER_HOST or the local socket)
    pub docker_host: Option<String>,

    /// Grace period in seconds given to `docker stop` (default: 10)
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            container: None,
            group: None,
            docker_host: None,
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl BackendConfig {
    /// Whether a container or group is configured
    pub fn enabled(&self) -> bool {
        self.container.is_some() || self.group.is_some()
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    /// Serve the control surface (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_admin_bind")]
    pub bind: String,

    /// Port (default: 9999)
    #[serde(default = "default_admin_port")]
    pub port: u16,

    /// Bearer token; generated and logged at startup when unset
    pub token: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_admin_bind(),
            port: default_admin_port(),
            token: None,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_buffer_size() -> usize {
    1500 // Ethernet MTU
}

fn default_connection_timeout() -> u64 {
    5000
}

fn default_sweep_interval() -> u64 {
    5000
}

fn default_shutdown_delay() -> u64 {
    60_000
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

/// Largest payload a UDP datagram can carry
const MAX_DATAGRAM: usize = 65_507;

/// Parse a duration such as `500ms`, `5s`, `1m`, `2h`, or a bare number of seconds
pub fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    let value = value.trim().to_lowercase();
    let (num_str, unit_ms) = if let Some(num) = value.strip_suffix("ms") {
        (num, 1u64)
    } else if let Some(num) = value.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = value.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = value.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        (value.as_str(), 1_000)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid duration: '{}'", value))?;
    if !num.is_finite() || num < 0.0 {
        anyhow::bail!("Invalid duration: '{}'", value);
    }

    Ok(Duration::from_millis((num * unit_ms as f64).round() as u64))
}

fn invalid(name: &str, e: impl std::fmt::Display) -> anyhow::Error {
    anyhow::anyhow!("{}{}: {}", ENV_PREFIX, name, e)
}

/// Parse a boolean the way environment variables usually spell them
pub fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("Invalid boolean: '{}'", other),
    }
}

impl Config {
    /// Parse a configuration file without validating it
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load the file (if any), apply process environment overrides, validate
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `IDLEGATE_*` variables found through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };

        if let Some(v) = get("PORT") {
            self.proxy.port = v.trim().parse().map_err(|e| invalid("PORT", e))?;
        }
        if let Some(v) = get("BIND") {
            self.proxy.bind = v;
        }
        if let Some(v) = get("TARGET_ADDRESS") {
            self.proxy.target_address = Some(v);
        }
        if let Some(v) = get("BUFFER_SIZE") {
            self.proxy.buffer_size = v.trim().parse().map_err(|e| invalid("BUFFER_SIZE", e))?;
        }
        if let Some(v) = get("CONNECTION_TIMEOUT") {
            let d = parse_duration(&v).map_err(|e| invalid("CONNECTION_TIMEOUT", e))?;
            self.proxy.connection_timeout_ms = d.as_millis() as u64;
        }
        if let Some(v) = get("SWEEP_INTERVAL") {
            let d = parse_duration(&v).map_err(|e| invalid("SWEEP_INTERVAL", e))?;
            self.proxy.sweep_interval_ms = d.as_millis() as u64;
        }
        if let Some(v) = get("SHUTDOWN_DELAY") {
            let d = parse_duration(&v).map_err(|e| invalid("SHUTDOWN_DELAY", e))?;
            self.lifecycle.shutdown_delay_ms = d.as_millis() as u64;
        }
        if let Some(v) = get("PAUSE") {
            self.lifecycle.pause = parse_bool(&v).map_err(|e| invalid("PAUSE", e))?;
        }
        if let Some(v) = get("PAUSE_DURATION") {
            let d = parse_duration(&v).map_err(|e| invalid("PAUSE_DURATION", e))?;
            self.lifecycle.pause_duration_ms = d.as_millis() as u64;
        }
        if let Some(v) = get("CONTAINER_NAME") {
            self.backend.container = Some(v);
        }
        if let Some(v) = get("CONTAINER_GROUP") {
            self.backend.group = Some(v);
        }
        if let Some(v) = get("DOCKER_HOST") {
            self.backend.docker_host = Some(v);
        }
        if let Some(v) = get("STOP_TIMEOUT") {
            let d = parse_duration(&v).map_err(|e| invalid("STOP_TIMEOUT", e))?;
            // Docker takes the stop grace period in whole seconds
            if d.subsec_millis() != 0 {
                return Err(invalid("STOP_TIMEOUT", "must be a whole number of seconds"));
            }
            self.backend.stop_timeout_secs = d.as_secs();
        }
        if let Some(v) = get("ADMIN_ENABLED") {
            self.admin.enabled = parse_bool(&v).map_err(|e| invalid("ADMIN_ENABLED", e))?;
        }
        if let Some(v) = get("ADMIN_BIND") {
            self.admin.bind = v;
        }
        if let Some(v) = get("ADMIN_PORT") {
            self.admin.port = v.trim().parse().map_err(|e| invalid("ADMIN_PORT", e))?;
        }
        if let Some(v) = get("ADMIN_TOKEN") {
            self.admin.token = Some(v);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = Some(v);
        }

        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.proxy.port == 0 {
            errors.push(format!(
                "proxy.port must be greater than 0 (or set {}PORT)",
                ENV_PREFIX
            ));
        }
        match self.proxy.target_address.as_deref() {
            None => errors.push(format!(
                "proxy.target_address is required (or set {}TARGET_ADDRESS)",
                ENV_PREFIX
            )),
            Some(target) if !target.contains(':') => errors.push(format!(
                "proxy.target_address '{}' must be in host:port form",
                target
            )),
            Some(_) => {}
        }
        if self.proxy.buffer_size == 0 || self.proxy.buffer_size > MAX_DATAGRAM {
            errors.push(format!(
                "proxy.buffer_size must be between 1 and {}",
                MAX_DATAGRAM
            ));
        }
        if self.proxy.sweep_interval_ms == 0 {
            errors.push("proxy.sweep_interval_ms must be greater than 0".to_string());
        }
        if self.proxy.connection_timeout_ms == 0 {
            errors.push("proxy.connection_timeout_ms must be greater than 0".to_string());
        }
        if self.backend.container.is_some() && self.backend.group.is_some() {
            errors.push("backend.container and backend.group are mutually exclusive".to_string());
        }
        if self.admin.enabled && self.admin.port == 0 {
            errors.push("admin.port must be greater than 0 when admin is enabled".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Notable fallbacks worth a warning at startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.backend.enabled() {
            warnings.push(
                "No backend container or group configured, lifecycle control disabled".to_string(),
            );
        }
        if self.lifecycle.pause && self.lifecycle.pause_duration_ms == 0 {
            warnings.push("pause_duration not set, paused backends will never be stopped".to_string());
        }
        if !self.lifecycle.pause && self.lifecycle.pause_duration_ms > 0 {
            warnings.push("pause_duration is ignored because pausing is disabled".to_string());
        }
        if self.proxy.buffer_size < 1280 {
            warnings.push(format!(
                "buffer_size {} is below the IPv6 minimum MTU, larger datagrams will be truncated",
                self.proxy.buffer_size
            ));
        }

        warnings
    }
}
