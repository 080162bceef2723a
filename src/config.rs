use crate::logging::{LogCategories, LogLevel, LogTimeFormat};
use serde::Deserialize;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A slot is evicted once this many liveliness intervals pass without a report
pub const LIVELINESS_TIMEOUT_FACTOR: u32 = 3;

/// Global configuration for the spawn server
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener and addressing
    #[serde(default)]
    pub server: ServerConfig,

    /// TLS enablement per surface
    #[serde(default)]
    pub tls: TlsConfig,

    /// Worker pool settings
    #[serde(default)]
    pub spawn: SpawnConfig,

    /// Session respawn shim
    #[serde(default)]
    pub respawn: RespawnConfig,

    /// Orchestrator and worker logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// License passed through to workers
    #[serde(default)]
    pub license: LicenseConfig,
}

/// Whether workers and the gateway may use IPv6
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IpVersion {
    /// Mix of IPv4 and IPv6, resolved through "localhost"
    #[default]
    Auto,
    /// Everything over IPv4 loopback
    #[serde(alias = "ipv4")]
    ForceIpv4,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port for REST calls, worker liveliness reports and proxied viewer connections
    #[serde(default = "default_spawn_server_port")]
    pub spawn_server_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Hostname placed in endpoints handed to viewers
    pub public_hostname: Option<String>,

    #[serde(default)]
    pub ip_version: IpVersion,

    /// Hand out proxied endpoints instead of direct worker ports (default: true)
    #[serde(default = "default_true")]
    pub proxy_viewer_connections: bool,

    /// How long the gateway keeps retrying to reach a starting worker
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Shut down when Enter is pressed on the console (default: true)
    #[serde(default = "default_true")]
    pub console_enter_shutdown: bool,
}

impl ServerConfig {
    /// Host used in endpoints returned to viewers
    pub fn public_host(&self) -> String {
        if let Some(ref host) = self.public_hostname {
            return host.clone();
        }
        match self.bind.as_str() {
            "0.0.0.0" | "::" | "[::]" => "localhost".to_string(),
            bind => bind.to_string(),
        }
    }

    /// Host the orchestrator and workers use to reach each other
    pub fn loopback_host(&self) -> &'static str {
        match self.ip_version {
            IpVersion::Auto => "localhost",
            IpVersion::ForceIpv4 => "127.0.0.1",
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Socket address the gateway listens on
    pub fn bind_addr(&self) -> Result<SocketAddr, AddrParseError> {
        let host = self.bind.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = host.parse()?;
        Ok(SocketAddr::new(ip, self.spawn_server_port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            spawn_server_port: default_spawn_server_port(),
            bind: default_bind_address(),
            public_hostname: None,
            ip_version: IpVersion::default(),
            proxy_viewer_connections: true,
            connect_timeout_secs: default_connect_timeout(),
            pid_file: None,
            console_enter_shutdown: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// Full-chain certificate file (PEM format)
    pub certificate_file: Option<String>,

    /// Private key file (PEM format)
    pub private_key_file: Option<String>,

    /// Serve REST and proxied connections over TLS
    #[serde(default)]
    pub enable_spawn_server: bool,

    /// Have workers serve their websocket over TLS
    #[serde(default)]
    pub enable_sc_server: bool,
}

impl TlsConfig {
    pub fn has_files(&self) -> bool {
        self.certificate_file.is_some() && self.private_key_file.is_some()
    }

    pub fn any_enabled(&self) -> bool {
        self.enable_spawn_server || self.enable_sc_server
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SpawnConfig {
    /// Maximum number of simultaneous workers
    #[serde(default = "default_max_spawn_count")]
    pub max_spawn_count: u16,

    /// First worker websocket port; the range is
    /// `[websocket_ports_begin, websocket_ports_begin + max_spawn_count - 1]`
    #[serde(default = "default_ports_begin")]
    pub websocket_ports_begin: u16,

    /// How often each worker reports liveliness, in seconds
    #[serde(default = "default_liveliness_interval")]
    pub liveliness_report_interval_secs: u64,

    /// Seconds a worker may wait for its first viewer before it is reaped
    #[serde(default = "default_initial_use_duration")]
    pub initial_use_duration_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Allow client-side rendering requests
    #[serde(default = "default_true")]
    pub csr_enabled: bool,

    /// Allow server-side rendering requests
    #[serde(default = "default_true")]
    pub ssr_enabled: bool,

    /// Number of GPUs to balance SSR workers over; unset uses the default device
    pub ssr_gpu_count: Option<NonZeroU32>,

    /// Ask SSR workers to create their GL context through EGL
    #[serde(default)]
    pub ssr_use_egl: bool,

    /// Root that relative paths below are resolved against
    #[serde(default = "default_communicator_dir")]
    pub communicator_dir: String,

    /// Worker executable (default: bin/stream_cache_server under communicator_dir)
    pub stream_cache_exe: Option<String>,

    /// Extra arguments appended to every worker command line (shell syntax)
    pub extra_args: Option<String>,

    /// Directories containing models available to workers
    #[serde(default)]
    pub model_dirs: Vec<String>,

    /// Scratch directory for worker temporary files
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: String,
}

impl SpawnConfig {
    pub fn liveliness_interval(&self) -> Duration {
        Duration::from_secs(self.liveliness_report_interval_secs)
    }

    /// Silence after which a slot is evicted
    pub fn liveliness_timeout(&self) -> Duration {
        self.liveliness_interval() * LIVELINESS_TIMEOUT_FACTOR
    }

    pub fn initial_use_duration(&self) -> Duration {
        Duration::from_secs(self.initial_use_duration_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Ports workers may be assigned
    pub fn port_range(&self) -> RangeInclusive<u16> {
        let last = u32::from(self.websocket_ports_begin) + u32::from(self.max_spawn_count) - 1;
        self.websocket_ports_begin..=last.min(u32::from(u16::MAX)) as u16
    }

    pub fn communicator_path(&self) -> PathBuf {
        expand_home(&self.communicator_dir)
    }

    pub fn executable_path(&self) -> PathBuf {
        match self.stream_cache_exe {
            Some(ref exe) => resolve_path(&self.communicator_path(), exe),
            None => self.communicator_path().join("bin").join(default_exe_name()),
        }
    }

    pub fn model_paths(&self) -> Vec<PathBuf> {
        let base = self.communicator_path();
        self.model_dirs.iter().map(|d| resolve_path(&base, d)).collect()
    }

    pub fn workspace_path(&self) -> PathBuf {
        resolve_path(&self.communicator_path(), &self.workspace_dir)
    }

    pub fn extra_args(&self) -> Result<Vec<String>, shell_words::ParseError> {
        match self.extra_args {
            Some(ref args) => shell_words::split(args),
            None => Ok(Vec::new()),
        }
    }
}

impl Default for SpawnConfig {
    fn default() -> Self {
        Self {
            max_spawn_count: default_max_spawn_count(),
            websocket_ports_begin: default_ports_begin(),
            liveliness_report_interval_secs: default_liveliness_interval(),
            initial_use_duration_secs: default_initial_use_duration(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            csr_enabled: true,
            ssr_enabled: true,
            ssr_gpu_count: None,
            ssr_use_egl: false,
            communicator_dir: default_communicator_dir(),
            stream_cache_exe: None,
            extra_args: None,
            model_dirs: Vec::new(),
            workspace_dir: default_workspace_dir(),
        }
    }
}

/// Relaunching workers into the interactive session (Windows services only)
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RespawnConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Suffix for the primary process's log file and forwarded output
    pub log_suffix: Option<String>,
}

impl RespawnConfig {
    /// The suffix, with an empty string treated as unset
    pub fn suffix(&self) -> Option<&str> {
        self.log_suffix.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Directory for worker log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Categories workers write to their log file
    #[serde(default = "default_spawn_file_categories")]
    pub spawn_file_categories: LogCategories,

    /// Categories workers write to stdout
    #[serde(default)]
    pub spawn_stdout_categories: LogCategories,

    /// Worker log entries use seconds since start instead of absolute time
    #[serde(default)]
    pub spawn_use_delta_time: bool,

    #[serde(default)]
    pub console_level: LogLevel,

    #[serde(default)]
    pub console_time_format: LogTimeFormat,

    /// Level worker stdout lines are logged at ("off" drops them)
    #[serde(default = "default_output_level")]
    pub stdout_as_level: LogLevel,

    /// Level worker stderr lines are logged at ("off" drops them)
    #[serde(default = "default_output_level")]
    pub stderr_as_level: LogLevel,
}

impl LoggingConfig {
    pub fn log_path(&self, communicator_dir: &Path) -> PathBuf {
        resolve_path(communicator_dir, &self.log_dir)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            spawn_file_categories: default_spawn_file_categories(),
            spawn_stdout_categories: LogCategories::NONE,
            spawn_use_delta_time: false,
            console_level: LogLevel::default(),
            console_time_format: LogTimeFormat::default(),
            stdout_as_level: default_output_level(),
            stderr_as_level: default_output_level(),
        }
    }
}

/// Raw license settings; at most one may be set
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LicenseConfig {
    pub key: Option<String>,
    pub file: Option<String>,
}

/// Validated license source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum License {
    Key(String),
    File(PathBuf),
}

/// Every problem found while validating a configuration
#[derive(Debug, thiserror::Error)]
#[error("Configuration errors:\n  - {}", .0.join("\n  - "))]
pub struct ConfigError(pub Vec<String>);

// Default value functions
fn default_spawn_server_port() -> u16 {
    11182
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_spawn_count() -> u16 {
    32
}

fn default_ports_begin() -> u16 {
    11000
}

fn default_liveliness_interval() -> u64 {
    5
}

fn default_initial_use_duration() -> u64 {
    60
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_communicator_dir() -> String {
    "..".to_string()
}

fn default_workspace_dir() -> String {
    "~/stream_cache_workspace".to_string()
}

fn default_log_dir() -> String {
    "~/stream_cache_logs".to_string()
}

fn default_spawn_file_categories() -> LogCategories {
    LogCategories::INFO | LogCategories::WARN | LogCategories::ERROR
}

fn default_output_level() -> LogLevel {
    LogLevel::Debug
}

fn default_exe_name() -> &'static str {
    if cfg!(windows) {
        "stream_cache_server.exe"
    } else {
        "stream_cache_server"
    }
}

/// Expand a leading `~/` to the user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `~/` and resolve relative paths against `base`
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let spawn = &self.spawn;

        if spawn.max_spawn_count == 0 {
            errors.push("spawn.max_spawn_count must be greater than 0".to_string());
        }
        if spawn.websocket_ports_begin == 0 {
            errors.push("spawn.websocket_ports_begin must be greater than 0".to_string());
        }
        let last_port =
            u32::from(spawn.websocket_ports_begin) + u32::from(spawn.max_spawn_count.max(1)) - 1;
        if last_port > u32::from(u16::MAX) {
            errors.push(format!(
                "worker port range ends at {}, beyond 65535",
                last_port
            ));
        }
        if let Err(e) = self.server.bind_addr() {
            errors.push(format!(
                "server.bind \"{}\" is not an IP address: {}",
                self.server.bind, e
            ));
        }
        let server_port = u32::from(self.server.spawn_server_port);
        if server_port == 0 {
            errors.push("server.spawn_server_port must be greater than 0".to_string());
        } else if (u32::from(spawn.websocket_ports_begin)..=last_port).contains(&server_port)
        {
            errors.push(format!(
                "server.spawn_server_port {} overlaps the worker port range",
                server_port
            ));
        }
        if spawn.liveliness_report_interval_secs == 0 {
            errors.push("spawn.liveliness_report_interval_secs must be greater than 0".to_string());
        }
        if spawn.initial_use_duration_secs == 0 {
            errors.push("spawn.initial_use_duration_secs must be greater than 0".to_string());
        }
        if spawn.shutdown_grace_period_secs == 0 {
            errors.push("spawn.shutdown_grace_period_secs must be greater than 0".to_string());
        }
        if !spawn.csr_enabled && !spawn.ssr_enabled {
            errors.push("at least one of spawn.csr_enabled and spawn.ssr_enabled must be true".to_string());
        }
        if let Err(e) = spawn.extra_args() {
            errors.push(format!("spawn.extra_args cannot be parsed: {}", e));
        }
        if self.license.key.is_some() && self.license.file.is_some() {
            errors.push("only one of license.key and license.file may be set".to_string());
        }
        if self.tls.any_enabled() && !self.tls.has_files() {
            errors.push(
                "tls.certificate_file and tls.private_key_file are required when TLS is enabled"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError(errors))
        }
    }

    /// The license source, if any
    pub fn license(&self) -> Option<License> {
        match (&self.license.key, &self.license.file) {
            (Some(key), _) => Some(License::Key(key.clone())),
            (None, Some(file)) => Some(License::File(resolve_path(
                &self.spawn.communicator_path(),
                file,
            ))),
            (None, None) => None,
        }
    }
}
