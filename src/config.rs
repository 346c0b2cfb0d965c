//! Gateway configuration.
//!
//! Sources are layered with `figment`, later ones overriding earlier ones:
//!
//! 1. built-in defaults ([`GatewayConfig::default`]);
//! 2. a TOML file, `config/gateway.toml` unless another path is given;
//! 3. environment variables prefixed `FINS_GATEWAY_`, with `__` separating
//!    sections, e.g. `FINS_GATEWAY_PLC__HOST=10.0.0.5`.
//!
//! A missing file is not an error; the defaults and environment still apply.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::erp::ErpSettings;
use crate::handshake::RetryPolicy;
use crate::header::NodeAddress;
use crate::logging::LogSettings;
use crate::memory_map::MemoryMap;
use crate::orchestrator::{OrchestratorSettings, TaskKind};
use crate::transport::DEFAULT_FINS_PORT;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FINS_GATEWAY_";

/// PLC endpoint and FINS addressing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlcConfig {
    /// PLC IP address.
    pub host: IpAddr,
    /// FINS UDP port.
    pub port: u16,
    /// Network of this gateway.
    pub source_network: u8,
    /// Node of this gateway.
    pub source_node: u8,
    /// Network of the PLC.
    pub dest_network: u8,
    /// Node of the PLC.
    pub dest_node: u8,
    /// Reply timeout per exchange.
    pub timeout_ms: u64,
    /// Use the in-process simulated PLC instead of UDP.
    pub simulate: bool,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([192, 168, 1, 250]),
            port: DEFAULT_FINS_PORT,
            source_network: 0,
            source_node: 1,
            dest_network: 0,
            dest_node: 0,
            timeout_ms: 2000,
            simulate: false,
        }
    }
}

impl PlcConfig {
    /// Socket address of the PLC.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// FINS address of this gateway.
    pub fn source(&self) -> NodeAddress {
        NodeAddress::new(self.source_network, self.source_node, 0)
    }

    /// FINS address of the PLC CPU unit.
    pub fn destination(&self) -> NodeAddress {
        NodeAddress::new(self.dest_network, self.dest_node, 0)
    }

    /// Reply timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// ERP endpoint and intake tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpConfig {
    /// Base URL, e.g. `https://erp.example.com`.
    pub base_url: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Timeout for every HTTP request.
    pub timeout_secs: u64,
    /// Orders fetched per intake.
    pub page_size: u32,
    /// Equipment prefix marking liquid components.
    pub liquid_prefix: String,
}

impl Default for ErpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8069".to_string(),
            username: "gateway".to_string(),
            password: String::new(),
            timeout_secs: 30,
            page_size: 30,
            liquid_prefix: "LIQ".to_string(),
        }
    }
}

/// SQLite location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/gateway.db"),
        }
    }
}

/// Task intervals in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Intake interval.
    pub intake_secs: u64,
    /// Telemetry sync interval.
    pub telemetry_secs: u64,
    /// Settlement interval.
    pub settlement_secs: u64,
    /// Health check interval.
    pub health_secs: u64,
    /// Event retention interval.
    pub retention_secs: u64,
    /// Failure slot scan interval.
    pub fault_scan_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            intake_secs: 60,
            telemetry_secs: 10,
            settlement_secs: 30,
            health_secs: 300,
            retention_secs: 86_400,
            fault_scan_secs: 15,
        }
    }
}

impl ScheduleConfig {
    /// Interval of `task`.
    pub fn interval(&self, task: TaskKind) -> Duration {
        let secs = match task {
            TaskKind::Intake => self.intake_secs,
            TaskKind::Telemetry => self.telemetry_secs,
            TaskKind::Settlement => self.settlement_secs,
            TaskKind::Health => self.health_secs,
            TaskKind::Retention => self.retention_secs,
            TaskKind::FaultScan => self.fault_scan_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Handshake flag retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Attempts per flag access, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

/// Health monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Telemetry older than this is reported as stale.
    pub stale_after_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { stale_after_secs: 600 }
    }
}

/// Event log retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Maximum event age in days.
    pub days: u32,
    /// Newest rows always kept.
    pub keep_latest: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 30,
            keep_latest: 1000,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// PLC section.
    pub plc: PlcConfig,
    /// ERP section.
    pub erp: ErpConfig,
    /// Database section.
    pub database: DatabaseConfig,
    /// Schedule section.
    pub schedule: ScheduleConfig,
    /// Handshake section.
    pub handshake: HandshakeConfig,
    /// Health section.
    pub health: HealthConfig,
    /// Retention section.
    pub retention: RetentionConfig,
    /// Logging section.
    pub logging: LogSettings,
}

impl GatewayConfig {
    /// Loads and validates the configuration.
    ///
    /// `path` defaults to [`DEFAULT_CONFIG_PATH`].
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Self::figment(path)
            .extract::<Self>()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?
            .validated()
    }

    /// The layered provider chain.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Checks value ranges.
    pub fn validated(self) -> anyhow::Result<Self> {
        if self.plc.timeout_ms == 0 {
            bail!("plc.timeout_ms must be greater than zero");
        }
        if self.erp.timeout_secs == 0 {
            bail!("erp.timeout_secs must be greater than zero");
        }
        if self.erp.page_size == 0 {
            bail!("erp.page_size must be greater than zero");
        }
        let slots = MemoryMap::standard().write_slots;
        if self.erp.page_size > u32::from(slots) {
            bail!(
                "erp.page_size {} exceeds the {} write slots",
                self.erp.page_size,
                slots
            );
        }
        if self.handshake.attempts == 0 {
            bail!("handshake.attempts must be at least 1");
        }
        for task in TaskKind::ALL {
            if self.schedule.interval(task).is_zero() {
                bail!("schedule interval for {task} must be greater than zero");
            }
        }
        if self.health.stale_after_secs == 0 {
            bail!("health.stale_after_secs must be greater than zero");
        }
        Ok(self)
    }

    /// ERP client settings.
    pub fn erp_settings(&self) -> ErpSettings {
        ErpSettings {
            base_url: self.erp.base_url.clone(),
            username: self.erp.username.clone(),
            password: self.erp.password.clone(),
            timeout: Duration::from_secs(self.erp.timeout_secs),
        }
    }

    /// Handshake retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.handshake.attempts,
            backoff: Duration::from_millis(self.handshake.backoff_ms),
        }
    }

    /// Orchestrator tunables.
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            page_size: self.erp.page_size,
            liquid_prefix: self.erp.liquid_prefix.clone(),
            stale_after: Duration::from_secs(self.health.stale_after_secs),
            retention_days: self.retention.days,
            retention_keep_latest: self.retention.keep_latest,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default().validated().unwrap();
        assert_eq!(config.plc.port, 9600);
        assert_eq!(config.erp.page_size, 30);
        assert_eq!(config.schedule.interval(TaskKind::Telemetry), Duration::from_secs(10));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[plc]\nhost = \"10.0.0.5\"\nsimulate = true\n\n[erp]\npage_size = 12\n\n[schedule]\nintake_secs = 5"
        )
        .unwrap();

        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.plc.host, IpAddr::from([10, 0, 0, 5]));
        assert!(config.plc.simulate);
        assert_eq!(config.plc.port, 9600);
        assert_eq!(config.erp.page_size, 12);
        assert_eq!(config.schedule.intake_secs, 5);
        assert_eq!(config.schedule.telemetry_secs, 10);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.retention.keep_latest, 1000);
    }

    #[test]
    fn test_validation() {
        let mut config = GatewayConfig::default();
        config.erp.page_size = 31;
        assert!(config.validated().is_err());

        let mut config = GatewayConfig::default();
        config.schedule.settlement_secs = 0;
        let err = config.validated().unwrap_err();
        assert!(err.to_string().contains("settlement"), "{err}");

        let mut config = GatewayConfig::default();
        config.plc.timeout_ms = 0;
        assert!(config.validated().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = GatewayConfig::default();
        assert_eq!(config.plc.socket_addr().port(), 9600);
        assert_eq!(config.retry_policy().attempts, 3);
        assert_eq!(config.orchestrator_settings().stale_after, Duration::from_secs(600));
        assert_eq!(config.erp_settings().timeout, Duration::from_secs(30));
    }
}
