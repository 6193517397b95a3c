use crate::retention::{DurationSetting, RetentionConfig};
use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "ppmp-connector.json";
const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_ERROR_LOG_PATH: &str = "logs/ppmp-connector.log";

fn setup_config_path() -> PathBuf {
    if let Ok(path) = env::var("PPMP_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

/// Optional JSON setup file. Keys mirror the connector's historical TOML layout.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SetupConfig {
    #[serde(default)]
    mqtt: MqttSection,
    #[serde(default)]
    influxdb: InfluxSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MqttSection {
    #[serde(default)]
    network_name: Option<String>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    tls_cert: Option<String>,
    #[serde(default)]
    keepalive_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InfluxSection {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    ssl: Option<bool>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    db: Option<String>,
    #[serde(default)]
    filter: Option<Vec<String>>,
    #[serde(default)]
    caching_period: Option<f64>,
    #[serde(default)]
    batch_size: Option<usize>,
    #[serde(default, rename = "influxDuration")]
    duration: Option<String>,
    #[serde(default, rename = "shardGroupDuration")]
    shard_group_duration: Option<String>,
}

pub fn load_setup_config(path: &Path) -> Option<SetupConfig> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub network_name: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls_cert: Option<PathBuf>,
    pub client_id: String,
    pub keepalive_secs: u64,
}

impl MqttSettings {
    pub fn topic_filter(&self) -> String {
        format!("{}/+/ppmp", self.network_name)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Clone, Debug)]
pub struct InfluxSettings {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    pub request_timeout_ms: u64,
}

impl InfluxSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Builds settings from `http[s]://[user:pass@]host[:port][/db]`.
    #[cfg(test)]
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = reqwest::Url::parse(raw.trim()).with_context(|| format!("invalid InfluxDB URL {raw}"))?;
        let host = url
            .host_str()
            .context("InfluxDB URL missing host")?
            .to_string();
        let ssl = url.scheme() == "https";
        let username = Some(url.username())
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let database = url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("ppmp")
            .to_string();
        Ok(Self {
            host,
            port: url.port().unwrap_or(8086),
            ssl,
            username,
            password: url.password().map(str::to_string),
            database,
            request_timeout_ms: 10_000,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt: MqttSettings,
    pub influx: InfluxSettings,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub measurement_filters: Vec<String>,
    pub retention: RetentionConfig,
    pub otlp_endpoint: Option<String>,
    pub error_log_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        let setup = load_setup_config(&setup_config_path());
        Self::from_sources(|key| env::var(key).ok(), setup.as_ref())
    }

    /// Resolves every setting from `lookup` (environment), then `setup`, then
    /// defaults.
    pub fn from_sources<F>(lookup: F, setup: Option<&SetupConfig>) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let default_setup = SetupConfig::default();
        let setup = setup.unwrap_or(&default_setup);
        let mqtt_file = &setup.mqtt;
        let influx_file = &setup.influxdb;

        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let file_text = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let network_name = text("PPMP_MQTT_NETWORK_NAME")
            .or_else(|| file_text(&mqtt_file.network_name))
            .unwrap_or_else(|| "mh".to_string());
        let mqtt_host = text("PPMP_MQTT_HOST")
            .or_else(|| file_text(&mqtt_file.host))
            .unwrap_or_else(|| "localhost".to_string());
        let mqtt_port = parse_env::<u16>(&lookup, "PPMP_MQTT_PORT")?
            .or(mqtt_file.port.filter(|v| *v != 0))
            .unwrap_or(1883);
        let mqtt_username =
            text("PPMP_MQTT_USERNAME").or_else(|| file_text(&mqtt_file.username));
        let mqtt_password =
            text("PPMP_MQTT_PASSWORD").or_else(|| file_text(&mqtt_file.password));
        let tls_cert = text("PPMP_MQTT_TLS_CERT")
            .or_else(|| file_text(&mqtt_file.tls_cert))
            .map(PathBuf::from);
        let client_id = text("PPMP_MQTT_CLIENT_ID")
            .unwrap_or_else(|| format!("ppmp-connector-{}", std::process::id()));
        let keepalive_secs = parse_env::<u64>(&lookup, "PPMP_MQTT_KEEPALIVE_SECS")?
            .or(mqtt_file.keepalive_secs.filter(|v| *v != 0))
            .unwrap_or(30);

        let influx_host = text("PPMP_INFLUXDB_HOST")
            .or_else(|| file_text(&influx_file.host))
            .unwrap_or_else(|| "localhost".to_string());
        let influx_port = parse_env::<u16>(&lookup, "PPMP_INFLUXDB_PORT")?
            .or(influx_file.port.filter(|v| *v != 0))
            .unwrap_or(8086);
        let influx_ssl = text("PPMP_INFLUXDB_SSL")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(influx_file.ssl)
            .unwrap_or(false);
        let influx_username = text("PPMP_INFLUXDB_USERNAME")
            .or_else(|| file_text(&influx_file.username))
            .or_else(|| Some("admin".to_string()));
        let influx_password =
            text("PPMP_INFLUXDB_PASSWORD").or_else(|| file_text(&influx_file.password));
        let database = text("PPMP_INFLUXDB_DB")
            .or_else(|| file_text(&influx_file.db))
            .unwrap_or_else(|| "ppmp".to_string());
        let request_timeout_ms = parse_env::<u64>(&lookup, "PPMP_INFLUXDB_TIMEOUT_MS")?
            .filter(|v| *v != 0)
            .unwrap_or(10_000);

        let measurement_filters = match text("PPMP_INFLUXDB_FILTER") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
            None => influx_file.filter.clone().unwrap_or_default(),
        };

        let batch_size = parse_env::<usize>(&lookup, "PPMP_BATCH_SIZE")?
            .or(influx_file.batch_size)
            .filter(|v| *v != 0)
            .unwrap_or(DEFAULT_BATCH_SIZE);
        let flush_interval_ms = match parse_env::<u64>(&lookup, "PPMP_FLUSH_INTERVAL_MS")? {
            Some(ms) => ms,
            None => influx_file
                .caching_period
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(|secs| (secs * 1000.0) as u64)
                .unwrap_or(1000),
        };

        // An empty value is meaningful here, so presence alone decides.
        let duration = lookup("PPMP_INFLUXDB_DURATION").or_else(|| influx_file.duration.clone());
        let shard_group_duration = lookup("PPMP_INFLUXDB_SHARD_GROUP_DURATION")
            .or_else(|| influx_file.shard_group_duration.clone());
        let retention = RetentionConfig {
            duration: DurationSetting::from_raw(duration.as_deref()),
            shard_group_duration: DurationSetting::from_raw(shard_group_duration.as_deref()),
        };

        let otlp_endpoint = text("OTEL_EXPORTER_OTLP_ENDPOINT");
        // Set but empty turns the error log file off.
        let error_log_path = match lookup("PPMP_ERROR_LOG_PATH") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(PathBuf::from(raw.trim())),
            None => Some(PathBuf::from(DEFAULT_ERROR_LOG_PATH)),
        };

        Ok(Self {
            mqtt: MqttSettings {
                network_name,
                host: mqtt_host,
                port: mqtt_port,
                username: mqtt_username,
                password: mqtt_password,
                tls_cert,
                client_id,
                keepalive_secs,
            },
            influx: InfluxSettings {
                host: influx_host,
                port: influx_port,
                ssl: influx_ssl,
                username: influx_username,
                password: influx_password,
                database,
                request_timeout_ms,
            },
            batch_size,
            flush_interval_ms,
            measurement_filters,
            retention,
            otlp_endpoint,
            error_log_path,
        })
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key).map(|value| value.trim().to_string()) {
        Some(value) if !value.is_empty() => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid {key}")),
        _ => Ok(None),
    }
}
