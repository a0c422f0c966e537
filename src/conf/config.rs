use std::path::Path;

use crate::{
    conf::{SpillConfig, StressConfig},
    core::SpillError::{self, ConfigParsingError},
};
use config::Config as CConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub spill: SpillConfig,
    #[serde(default)]
    pub stress: StressConfig,
}

impl Config {
    pub fn from_str(toml_str: &str) -> Result<Config, SpillError> {
        Self::build(CConfig::builder().add_source(config::File::from_str(
            toml_str,
            config::FileFormat::Toml,
        )))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, SpillError> {
        Self::build(CConfig::builder().add_source(config::File::from(path.as_ref())))
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Config, SpillError> {
        let config = builder
            .build()
            .map_err(|e| ConfigParsingError(e.to_string()))?
            .try_deserialize::<Config>()
            .map_err(|e| ConfigParsingError(e.to_string()))?;
        config.spill.validate()?;
        Ok(config)
    }
}
