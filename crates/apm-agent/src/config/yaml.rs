// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! `apm.yml` configuration file.
//!
//! ```yaml
//! active: true
//! name: shop
//! env: production
//! push_api_key: your_key_here
//! ignore_actions:
//!   - HealthController#up
//! filter_parameters: password, credit_card
//! ```

use std::path::PathBuf;

use figment::{
    providers::{Format, Yaml},
    Figment,
};

use crate::config::{merge_config, Config, ConfigError, ConfigSource, PartialConfig};

pub struct YamlConfigSource {
    pub path: PathBuf,
}

impl ConfigSource for YamlConfigSource {
    fn load(&self, config: &mut Config) -> Result<(), ConfigError> {
        let figment = Figment::new().merge(Yaml::file(self.path.clone()));

        match figment.extract::<PartialConfig>() {
            Ok(yaml_config) => merge_config(config, &yaml_config),
            Err(e) => {
                return Err(ConfigError::ParseError(format!(
                    "Failed to parse config from yaml file: {e}, using default config."
                )));
            }
        }

        Ok(())
    }
}
