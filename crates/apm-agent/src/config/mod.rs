// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Sources are applied in order, later sources overriding earlier ones:
//!
//! 1. **Defaults** - [`Config::default`]
//! 2. **YAML file** - `apm.yml` in the configuration directory
//! 3. **Environment variables** - `APM_*` (highest priority)
//!
//! A source that fails to parse is logged and skipped. After all sources are
//! applied the configuration is normalized:
//!
//! - the endpoint loses any trailing `/` and gains `https://` when it has no scheme
//! - `HTTPS_PROXY`, then `HTTP_PROXY`, are used when no proxy is configured
//! - `debug: true` forces the `Debug` log level

pub mod env;
pub mod flush_strategy;
pub mod log_level;
pub mod yaml;

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fmt;

use serde::{Deserialize, Deserializer};
use serde_aux::prelude::deserialize_bool_from_anything;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::{
    env::EnvConfigSource, flush_strategy::FlushStrategy, log_level::LogLevel,
    yaml::YamlConfigSource,
};

pub const DEFAULT_ENDPOINT: &str = "https://push.example-apm.com/1";
pub const CONFIG_FILE_NAME: &str = "apm.yml";

/// Copies `Some` values of a partial source onto the config.
#[macro_export]
macro_rules! merge_option_to_value {
    ($config:expr, $config_field:ident, $source:expr, $source_field:ident) => {
        if let Some(value) = &$source.$source_field {
            $config.$config_field = value.clone();
        }
    };
    ($config:expr, $source:expr, $field:ident) => {
        if let Some(value) = &$source.$field {
            $config.$field = value.clone();
        }
    };
}

/// Copies `Some` values of a partial source onto an `Option` config field.
#[macro_export]
macro_rules! merge_option {
    ($config:expr, $source:expr, $field:ident) => {
        if $source.$field.is_some() {
            $config.$field.clone_from(&$source.$field);
        }
    };
}

#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Config {
    /// Master switch; an inactive agent captures and sends nothing.
    pub active: bool,
    /// Deployment environment reported with every payload.
    pub env: String,
    /// Application name reported with every payload.
    pub name: String,
    pub push_api_key: String,
    pub endpoint: String,
    /// Primary event duration at or above which a request counts as slow.
    pub slow_request_threshold: Duration,
    pub ignore_actions: Vec<String>,
    pub ignore_exceptions: Vec<String>,
    pub send_params: bool,
    pub skip_session_data: bool,
    /// Parameter keys whose values are replaced with `[FILTERED]`.
    pub filter_parameters: Vec<String>,
    pub http_proxy: Option<String>,
    /// PEM bundle used to verify the endpoint; bundled roots otherwise.
    pub ca_file_path: Option<PathBuf>,
    /// Application root, stripped from view paths and used for the IPC socket.
    pub root_path: PathBuf,
    pub log_level: LogLevel,
    pub debug: bool,
    pub transmit_timeout: Duration,
    pub enable_view_sanitizer: bool,
    pub enable_orm_sanitizer: bool,
    pub flush_strategy: FlushStrategy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            active: false,
            env: "development".to_string(),
            name: String::new(),
            push_api_key: String::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            slow_request_threshold: Duration::from_millis(200),
            ignore_actions: vec![],
            ignore_exceptions: vec![],
            send_params: true,
            skip_session_data: false,
            filter_parameters: vec![],
            http_proxy: None,
            ca_file_path: None,
            root_path: PathBuf::from("."),
            log_level: LogLevel::default(),
            debug: false,
            transmit_timeout: Duration::from_secs(30),
            enable_view_sanitizer: false,
            enable_orm_sanitizer: false,
            flush_strategy: FlushStrategy::default(),
        }
    }
}

/// Fields shared by the YAML and environment sources. Every field is
/// optional so that a source only overrides what it actually sets.
#[derive(Debug, PartialEq, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PartialConfig {
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub active: Option<bool>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub env: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub name: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    pub push_api_key: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_millis")]
    pub slow_request_threshold: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_list")]
    pub ignore_actions: Option<Vec<String>>,
    #[serde(deserialize_with = "deserialize_optional_list")]
    pub ignore_exceptions: Option<Vec<String>>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub send_params: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub skip_session_data: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_list")]
    pub filter_parameters: Option<Vec<String>>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub http_proxy: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub ca_file_path: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_string")]
    pub root_path: Option<String>,
    pub log_level: Option<LogLevel>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub debug: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_duration_from_seconds")]
    pub transmit_timeout: Option<Duration>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enable_view_sanitizer: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_bool_from_anything")]
    pub enable_orm_sanitizer: Option<bool>,
    #[serde(deserialize_with = "deserialize_option_lossless")]
    pub flush_strategy: Option<FlushStrategy>,
}

pub(crate) fn merge_config(config: &mut Config, source: &PartialConfig) {
    merge_option_to_value!(config, source, active);
    merge_option_to_value!(config, source, env);
    merge_option_to_value!(config, source, name);
    merge_option_to_value!(config, source, push_api_key);
    merge_option_to_value!(config, source, endpoint);
    merge_option_to_value!(config, source, slow_request_threshold);
    merge_option_to_value!(config, source, ignore_actions);
    merge_option_to_value!(config, source, ignore_exceptions);
    merge_option_to_value!(config, source, send_params);
    merge_option_to_value!(config, source, skip_session_data);
    merge_option_to_value!(config, source, filter_parameters);
    merge_option!(config, source, http_proxy);
    if let Some(path) = &source.ca_file_path {
        config.ca_file_path = Some(PathBuf::from(path));
    }
    if let Some(path) = &source.root_path {
        config.root_path = PathBuf::from(path);
    }
    merge_option_to_value!(config, source, log_level);
    merge_option_to_value!(config, source, debug);
    merge_option_to_value!(config, source, transmit_timeout);
    merge_option_to_value!(config, source, enable_view_sanitizer);
    merge_option_to_value!(config, source, enable_orm_sanitizer);
    merge_option_to_value!(config, source, flush_strategy);
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    ParseError(String),
    UnsupportedField(String),
}

pub trait ConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError>;
}

#[derive(Default)]
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    config: Config,
}

impl ConfigBuilder {
    #[must_use]
    pub fn add_source(mut self, source: Box<dyn ConfigSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(&mut self) -> Config {
        let mut failed_sources = 0;
        for source in &self.sources {
            match source.load(&mut self.config) {
                Ok(()) => (),
                Err(e) => {
                    error!("Failed to load config: {:?}", e);
                    failed_sources += 1;
                }
            }
        }

        if !self.sources.is_empty() && failed_sources == self.sources.len() {
            debug!("All sources failed to load config, using default config.");
        }

        self.config.endpoint = normalize_endpoint(&self.config.endpoint);

        if self.config.http_proxy.is_none() {
            self.config.http_proxy = std::env::var("HTTPS_PROXY")
                .or_else(|_| std::env::var("HTTP_PROXY"))
                .ok()
                .filter(|proxy| !proxy.trim().is_empty());
        }

        if self.config.debug {
            self.config.log_level = LogLevel::Debug;
        }

        self.config.clone()
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_ENDPOINT.to_string();
    }
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

/// Loads `apm.yml` from `config_directory`, then the `APM_*` environment.
#[must_use]
pub fn get_config(config_directory: &Path) -> Config {
    let path = config_directory.join(CONFIG_FILE_NAME);
    ConfigBuilder::default()
        .add_source(Box::new(YamlConfigSource { path }))
        .add_source(Box::new(EnvConfigSource))
        .build()
}

pub fn deserialize_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(Some(s)),
        other => {
            error!(
                "Failed to parse value, expected a string, got: {}, ignoring",
                other
            );
            Ok(None)
        }
    }
}

pub fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}

pub fn deserialize_optional_bool_from_anything<'de, D>(
    deserializer: D,
) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<Value> = Option::deserialize(deserializer)?;

    match opt {
        None => Ok(None),
        Some(value) => match deserialize_bool_from_anything(value) {
            Ok(bool_result) => Ok(Some(bool_result)),
            Err(e) => {
                error!("Failed to parse bool value: {}, ignoring", e);
                Ok(None)
            }
        },
    }
}

/// Accepts either a sequence of strings or a single comma-separated string.
pub fn deserialize_optional_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect()
    };
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(Some(split(&s))),
        Value::Array(items) => Ok(Some(
            items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .filter(|item| !item.is_empty())
                .collect(),
        )),
        Value::Null => Ok(None),
        other => {
            error!("Failed to parse list, got: {}, ignoring", other);
            Ok(None)
        }
    }
}

pub fn deserialize_option_lossless<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    match Option::<T>::deserialize(deserializer) {
        Ok(value) => Ok(value),
        Err(e) => {
            error!("Failed to deserialize optional value: {}, ignoring", e);
            Ok(None)
        }
    }
}

pub fn deserialize_optional_duration_from_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => match n.as_f64() {
            Some(ms) if ms >= 0.0 => Ok(Some(Duration::from_secs_f64(ms / 1000.0))),
            _ => {
                error!("Failed to parse duration: {}, ignoring", n);
                Ok(None)
            }
        },
        other => {
            error!("Expected milliseconds, got: {}, ignoring", other);
            Ok(None)
        }
    }
}

pub fn deserialize_optional_duration_from_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    struct DurationVisitor;
    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Option<Duration>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a duration in seconds (integer or float)")
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(Some(Duration::from_secs(v)))
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
            match u64::try_from(v) {
                Ok(v) => self.visit_u64(v),
                Err(_) => {
                    error!("Failed to parse duration: negative durations are not allowed, ignoring");
                    Ok(None)
                }
            }
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<Self::Value, E> {
            if v < 0f64 {
                error!("Failed to parse duration: negative durations are not allowed, ignoring");
                return Ok(None);
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
            error!("Failed to parse duration: {}, ignoring", v);
            Ok(None)
        }
    }
    deserializer.deserialize_any(DurationVisitor)
}
