//! Deployment configuration, matching the recognized-options table in the
//! system's external interface contract.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_redis_db() -> i64 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_redis_db")]
    pub db: i64,
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        RedisSettings {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: default_redis_db(),
            key_prefix: None,
        }
    }
}

impl RedisSettings {
    pub fn from_env() -> Self {
        let mut settings = RedisSettings::default();
        if let Ok(host) = std::env::var("AUTOWEAVE_REDIS_HOST") {
            settings.host = host;
        }
        if let Ok(port) = std::env::var("AUTOWEAVE_REDIS_PORT") {
            if let Ok(port) = port.parse() {
                settings.port = port;
            }
        }
        if let Ok(password) = std::env::var("AUTOWEAVE_REDIS_PASSWORD") {
            settings.password = Some(password);
        }
        if let Ok(db) = std::env::var("AUTOWEAVE_REDIS_DB") {
            if let Ok(db) = db.parse() {
                settings.db = db;
            }
        }
        if let Ok(prefix) = std::env::var("AUTOWEAVE_REDIS_PREFIX") {
            settings.key_prefix = Some(prefix);
        }
        settings
    }

    pub fn to_database_config(&self) -> autoweave_database::RedisConfig {
        autoweave_database::RedisConfig {
            host: Some(self.host.clone()),
            port: Some(self.port),
            password: self.password.clone(),
            db: Some(self.db),
        }
    }
}

fn default_min_workers() -> u32 {
    1
}

fn default_max_workers() -> u32 {
    4
}

/// Defaults a worker's in-flight job concurrency to the host's CPU count.
fn default_concurrency() -> u32 {
    num_cpus::get().max(1) as u32
}

fn default_scale_threshold() -> u32 {
    10
}

fn default_cooldown_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolSettings {
    #[serde(default = "default_min_workers")]
    pub min_workers: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default)]
    pub autoscale: bool,
    #[serde(default = "default_scale_threshold")]
    pub scale_up_threshold: u32,
    #[serde(default = "default_scale_threshold")]
    pub scale_down_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub scale_up_cooldown_ms: u64,
    #[serde(default = "default_cooldown_ms")]
    pub scale_down_cooldown_ms: u64,
    #[serde(default = "default_stalled_threshold_ms")]
    pub stalled_threshold_ms: u64,
    #[serde(default)]
    pub dead_letter: bool,
}

fn default_stalled_threshold_ms() -> u64 {
    30_000
}

impl Default for WorkerPoolSettings {
    fn default() -> Self {
        WorkerPoolSettings {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            concurrency: default_concurrency(),
            autoscale: false,
            scale_up_threshold: default_scale_threshold(),
            scale_down_threshold: default_scale_threshold(),
            scale_up_cooldown_ms: default_cooldown_ms(),
            scale_down_cooldown_ms: default_cooldown_ms(),
            stalled_threshold_ms: default_stalled_threshold_ms(),
            dead_letter: false,
        }
    }
}

impl WorkerPoolSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_threshold_ms / 3).max(Duration::from_millis(1))
    }

    pub fn stalled_threshold(&self) -> Duration {
        Duration::from_millis(self.stalled_threshold_ms)
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_up_cooldown_ms)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_millis(self.scale_down_cooldown_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    #[serde(default)]
    pub workers: Option<WorkerPoolSettings>,
}

fn default_metrics_interval_ms() -> u64 {
    10_000
}

fn default_retention_days() -> u32 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_interval_ms")]
    pub metrics_interval_ms: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub alert_backlog_threshold: Option<u64>,
    #[serde(default)]
    pub alert_failure_rate_threshold: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        MonitoringSettings {
            enabled: true,
            metrics_interval_ms: default_metrics_interval_ms(),
            retention_days: default_retention_days(),
            alert_backlog_threshold: None,
            alert_failure_rate_threshold: None,
        }
    }
}

fn default_health_check_interval_ms() -> u64 {
    15_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_health_retries() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        HealthSettings {
            check_interval_ms: default_health_check_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            retries: default_health_retries(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_processing_timeout_ms() -> u64 {
    5_000
}

fn default_stream_name() -> String {
    "aw:hotplug".to_string()
}

fn default_consumer_group() -> String {
    "job-queue".to_string()
}

fn default_consumer_name() -> String {
    "bridge-1".to_string()
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_rate_limit_per_sec() -> u32 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbBridgeSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default)]
    pub plugin_filtering: Option<Vec<String>>,
    #[serde(default)]
    pub target_queue: Option<String>,
}

impl Default for UsbBridgeSettings {
    fn default() -> Self {
        UsbBridgeSettings {
            enabled: false,
            stream_name: default_stream_name(),
            consumer_group: default_consumer_group(),
            consumer_name: default_consumer_name(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            processing_timeout_ms: default_processing_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            plugin_filtering: None,
            target_queue: None,
        }
    }
}

impl UsbBridgeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Sandbox/trust settings. This crate only records and exposes them;
/// enforcement belongs to the plugin loader collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySettings {
    #[serde(default)]
    pub default_sandbox: Option<String>,
    #[serde(default)]
    pub trusted_plugins: Vec<String>,
    #[serde(default)]
    pub resource_limits: HashMap<String, serde_json::Value>,
}

fn default_max_concurrent_jobs() -> u32 {
    4
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Scheduler-wide limits. Not part of the published configuration table
/// (the table only names per-queue and per-bridge knobs) but every
/// scheduled firing needs somewhere to read `maxConcurrentJobs` from, so
/// this gets the same `#[serde(default)]`-per-field treatment as the rest
/// of [`Config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    #[serde(default = "default_true")]
    pub retry_failed_jobs: bool,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            retry_failed_jobs: true,
            retry_delay_ms: default_retry_delay_ms(),
            timezone: default_timezone(),
        }
    }
}

impl SchedulerSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
    #[serde(default)]
    pub default_worker_pool: WorkerPoolSettings,
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub usb_bridge: UsbBridgeSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            redis: RedisSettings::default(),
            queues: Vec::new(),
            default_worker_pool: WorkerPoolSettings::default(),
            monitoring: MonitoringSettings::default(),
            health: HealthSettings::default(),
            security: SecuritySettings::default(),
            usb_bridge: UsbBridgeSettings::default(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl Config {
    /// Builds a configuration from environment variables alone, for the
    /// common case of a small deployment that doesn't ship a config file.
    pub fn from_env() -> Self {
        Config {
            redis: RedisSettings::from_env(),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_queues() {
        let config = Config::default();
        assert!(config.queues.is_empty());
        assert_eq!(config.redis.port, 6379);
    }

    #[test]
    fn deserializes_from_partial_json() {
        let json = serde_json::json!({
            "redis": { "host": "redis.internal" },
            "queues": [{ "name": "usb-events" }]
        });
        let config: Config = serde_json::from_value(json).unwrap();
        assert_eq!(config.redis.host, "redis.internal");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.queues.len(), 1);
        assert_eq!(config.queues[0].name, "usb-events");
    }

    #[test]
    fn heartbeat_interval_is_a_third_of_stalled_threshold() {
        let settings = WorkerPoolSettings { stalled_threshold_ms: 30_000, ..WorkerPoolSettings::default() };
        assert_eq!(settings.heartbeat_interval(), Duration::from_millis(10_000));
    }
}
