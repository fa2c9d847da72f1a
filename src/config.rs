use hyper::Uri;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listener and forwarding settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend origin every request is forwarded to
    pub target: TargetConfig,

    /// Where captured records are written
    #[serde(default)]
    pub output: OutputConfig,

    /// Capture strategy and buffering knobs
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the proxy listens on (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Max time to wait for the backend to respond (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections kept to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Listen address from `bind` and `port`; `bind` may be IPv4 or IPv6
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", self.bind, e))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    /// Backend origin, e.g. `http://127.0.0.1:3000`
    pub url: String,
}

impl TargetConfig {
    /// Parse and check the target origin.
    ///
    /// Only plain `http` origins are supported. A base path and query are
    /// allowed and get merged into every forwarded request.
    pub fn origin(&self) -> anyhow::Result<Uri> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid target URL '{}': {}", self.url, e))?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => anyhow::bail!(
                "Unsupported target URL scheme '{}' in '{}' (only http is supported)",
                other,
                self.url
            ),
            None => anyhow::bail!("Target URL '{}' must include a scheme", self.url),
        }

        if uri.host().map_or(true, str::is_empty) {
            anyhow::bail!("Target URL '{}' must include a host", self.url);
        }

        Ok(uri)
    }
}

/// Serialization format of the record store
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    #[serde(alias = "JSON")]
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    /// Path of the record store (default: profile.json)
    #[serde(default = "default_output_file")]
    pub file: PathBuf,

    /// Store format; only JSON is supported
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            file: default_output_file(),
            format: OutputFormat::default(),
        }
    }
}

/// How captured records reach the store
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStrategy {
    /// Write every record inline before forwarding; a failed write rejects the request
    Immediate,
    /// Queue records for a background writer; failures are only logged
    #[default]
    Buffered,
}

impl CaptureStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStrategy::Immediate => "immediate",
            CaptureStrategy::Buffered => "buffered",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Capture strategy (default: buffered)
    #[serde(default)]
    pub strategy: CaptureStrategy,

    /// Bounded queue capacity for buffered capture (default: 100)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Batch size that triggers a flush (default: 100)
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Max age of the oldest unflushed record in milliseconds (default: 1000)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Upper bound on a single store write in milliseconds (default: 5000)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

impl CaptureConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            strategy: CaptureStrategy::default(),
            queue_capacity: default_queue_capacity(),
            flush_threshold: default_flush_threshold(),
            flush_interval_ms: default_flush_interval(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds max for backend to respond
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_output_file() -> PathBuf {
    PathBuf::from("profile.json")
}

fn default_queue_capacity() -> usize {
    100
}

fn default_flush_threshold() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    1000 // 1 second
}

fn default_write_timeout() -> u64 {
    5000 // 5 seconds
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.target.origin() {
            errors.push(e.to_string());
        }

        if let Err(e) = self.server.listen_addr() {
            errors.push(e.to_string());
        }

        if self.output.file.as_os_str().is_empty() {
            errors.push("output.file must not be empty".to_string());
        }

        if self.capture.queue_capacity == 0 {
            errors.push("capture.queue_capacity must be greater than zero".to_string());
        }

        if self.capture.flush_threshold == 0 {
            errors.push("capture.flush_threshold must be greater than zero".to_string());
        }

        if self.capture.flush_interval_ms == 0 {
            errors.push("capture.flush_interval_ms must be greater than zero".to_string());
        }

        if self.capture.write_timeout_ms == 0 {
            errors.push("capture.write_timeout_ms must be greater than zero".to_string());
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than zero".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
