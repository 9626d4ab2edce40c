use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Toml},
    Figment,
};
use std::path::Path;

/// Default location of the configuration files, relative to the working directory.
pub const DEFAULT_CONFIG_DIR: &str = "config";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads application configuration by merging TOML, environment variables, and JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the result is invalid.
    pub fn load() -> Result<AppConfig> {
        Self::load_from(DEFAULT_CONFIG_DIR, None)
    }

    /// Loads application configuration with a specific profile.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the result is invalid.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::load_from(DEFAULT_CONFIG_DIR, Some(profile))
    }

    /// Loads configuration from `dir`, layering `Config.toml`, the optional
    /// `Config.<profile>.toml`, `MDC_*` variables and `DATABASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be parsed or the result is invalid.
    pub fn load_from(dir: impl AsRef<Path>, profile: Option<&str>) -> Result<AppConfig> {
        let config: AppConfig = Self::figment(dir.as_ref(), profile)
            .extract()
            .context("Failed to load configuration")?;

        config.validate().context("Invalid configuration")?;

        tracing::debug!(
            series = config.series.len(),
            rate_limits = config.rate_limits.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    fn figment(dir: &Path, profile: Option<&str>) -> Figment {
        let mut figment = Figment::new().merge(Toml::file(dir.join("Config.toml")));

        if let Some(profile) = profile {
            figment = figment.merge(Toml::file(dir.join(format!("Config.{profile}.toml"))));
        }

        figment
            .merge(Env::prefixed("MDC_").split("__"))
            .merge(
                Env::raw()
                    .only(&["DATABASE_URL"])
                    .map(|_| "database.url".into()),
            )
            .join(Json::file(dir.join("Config.json")))
    }
}
