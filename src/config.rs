use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::error::ProxyError;

/// Dial timeout used when the configured one is absent or not positive.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Listen endpoint (`host:port`).
    pub from: String,
    /// Destination endpoint (`host:port`).
    pub to: String,
    pub policies: Policies,
    pub monitor: Monitor,
    pub log: LogConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policies {
    pub allow_all: bool,
    pub deny_all: bool,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
    /// Dial timeout. Integers are nanoseconds, like Go's `time.Duration`
    /// (`1000000000` is one second); strings carry a unit.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Option<Duration>,
    /// Idle timeout applied to every read of a relay direction.
    #[serde(deserialize_with = "deserialize_duration")]
    pub copy_timeout: Option<Duration>,
    /// Keep Nagle's algorithm on. When false the relay sets `TCP_NODELAY`.
    pub nagle: bool,
    pub keep_alive: bool,
}

/// Which relay directions report byte counts.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Monitor {
    /// inbound peer -> destination
    pub from: bool,
    /// destination -> inbound peer
    pub to: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub stdout: bool,
    pub stderr: bool,
    pub file: bool,
    pub path: Option<PathBuf>,
    pub level: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    #[default]
    Direct,
    Pool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub mode: DispatchKind,
    pub workers: Option<usize>,
    pub queue: Option<usize>,
}

impl Config {
    /// Default configuration for a `from -> to` relay: no policies, no
    /// monitoring, direct dispatch.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        validate_endpoint("listen", &self.from)?;
        validate_endpoint("destination", &self.to)?;
        Ok(())
    }
}

impl Policies {
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        match self.timeout {
            Some(timeout) if !timeout.is_zero() => timeout,
            _ => DEFAULT_DIAL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn copy_timeout(&self) -> Option<Duration> {
        self.copy_timeout.filter(|timeout| !timeout.is_zero())
    }
}

/// Checks that an endpoint looks like `host:port`. Name resolution is left to
/// bind/dial time.
pub fn validate_endpoint(role: &'static str, endpoint: &str) -> Result<(), ProxyError> {
    let invalid = || ProxyError::InvalidEndpoint {
        role,
        endpoint: endpoint.to_string(),
    };

    let (_, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
    if port.is_empty() {
        return Err(invalid());
    }
    Ok(())
}

/// Parses `"250ms"`, `"2s"`, `"1.5m"` and friends. A unit is required unless
/// the value is not positive. Negative values collapse to zero.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    let nanos_per_unit: f64 = match unit.trim() {
        "ns" => 1.0,
        "us" | "µs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        "" if value <= 0.0 => return Ok(Duration::ZERO),
        "" => return Err(format!("missing unit in duration {input:?}")),
        other => return Err(format!("unknown duration unit {other:?} in {input:?}")),
    };

    if value <= 0.0 {
        return Ok(Duration::ZERO);
    }
    Ok(Duration::from_nanos((value * nanos_per_unit).round() as u64))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Nanos(i64),
        Text(String),
    }

    match Option::<RawDuration>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawDuration::Nanos(nanos)) => Ok(Some(Duration::from_nanos(nanos.max(0) as u64))),
        Some(RawDuration::Text(text)) => parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Loads a configuration file. Files ending in `.toml` are read as TOML,
/// everything else as JSON.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse {} as valid TOML", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {} as valid JSON", path.display()))
    }
}
