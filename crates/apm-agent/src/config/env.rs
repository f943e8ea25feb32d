// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `APM_*` environment variables.
//!
//! Each field of [`PartialConfig`] maps to the upper-cased variable with the
//! `APM_` prefix: `APM_ACTIVE`, `APM_PUSH_API_KEY`, `APM_IGNORE_ACTIONS`
//! (comma-separated), `APM_SLOW_REQUEST_THRESHOLD` (milliseconds),
//! `APM_TRANSMIT_TIMEOUT` (seconds) and so on.

use figment::{providers::Env, Figment};

use crate::config::{merge_config, Config, ConfigError, ConfigSource, PartialConfig};

pub const ENV_PREFIX: &str = "APM_";

pub struct EnvConfigSource;

impl ConfigSource for EnvConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<PartialConfig>() {
            Ok(env_config) => merge_config(config, &env_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from environment variables: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::flush_strategy::FlushStrategy;

    #[test]
    fn test_merge_config_overrides_with_environment_variables() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("APM_ACTIVE", "true");
            jail.set_env("APM_ENV", "production");
            jail.set_env("APM_NAME", "shop");
            jail.set_env("APM_PUSH_API_KEY", "abc-123");
            jail.set_env("APM_ENDPOINT", "http://127.0.0.1:9000");
            jail.set_env("APM_SLOW_REQUEST_THRESHOLD", "350");
            jail.set_env("APM_IGNORE_ACTIONS", "Health#up, Ping#index");
            jail.set_env("APM_IGNORE_EXCEPTIONS", "NotFound");
            jail.set_env("APM_SEND_PARAMS", "false");
            jail.set_env("APM_SKIP_SESSION_DATA", "true");
            jail.set_env("APM_FILTER_PARAMETERS", "password");
            jail.set_env("APM_CA_FILE_PATH", "/etc/ssl/bundle.pem");
            jail.set_env("APM_ROOT_PATH", "/srv/shop");
            jail.set_env("APM_TRANSMIT_TIMEOUT", "12");
            jail.set_env("APM_ENABLE_VIEW_SANITIZER", "true");
            jail.set_env("APM_ENABLE_ORM_SANITIZER", "true");
            jail.set_env("APM_FLUSH_STRATEGY", "manual");

            let mut config = Config::default();
            EnvConfigSource
                .load(&mut config)
                .expect("environment should parse");

            assert!(config.active);
            assert_eq!(config.env, "production");
            assert_eq!(config.name, "shop");
            assert_eq!(config.push_api_key, "abc-123");
            assert_eq!(config.endpoint, "http://127.0.0.1:9000");
            assert_eq!(config.slow_request_threshold, Duration::from_millis(350));
            assert_eq!(config.ignore_actions, vec!["Health#up", "Ping#index"]);
            assert_eq!(config.ignore_exceptions, vec!["NotFound"]);
            assert!(!config.send_params);
            assert!(config.skip_session_data);
            assert_eq!(config.filter_parameters, vec!["password"]);
            assert_eq!(
                config.ca_file_path.as_deref(),
                Some(std::path::Path::new("/etc/ssl/bundle.pem"))
            );
            assert_eq!(config.root_path, std::path::PathBuf::from("/srv/shop"));
            assert_eq!(config.transmit_timeout, Duration::from_secs(12));
            assert!(config.enable_view_sanitizer);
            assert!(config.enable_orm_sanitizer);
            assert_eq!(config.flush_strategy, FlushStrategy::Manual);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("APM_ACTIVE", "maybe");
            jail.set_env("APM_SLOW_REQUEST_THRESHOLD", "soon");

            let mut config = Config::default();
            EnvConfigSource
                .load(&mut config)
                .expect("invalid values are skipped, not fatal");

            assert!(!config.active);
            assert_eq!(config.slow_request_threshold, Duration::from_millis(200));
            Ok(())
        });
    }
}
