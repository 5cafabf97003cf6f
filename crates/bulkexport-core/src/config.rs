//! Lightweight configuration loader and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `BULKEXPORT_*`
//! env vars. Provides helpers to expand `~` and `${VAR}` and to resolve
//! relative paths against a known base directory.
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_VAR: &str = "BULKEXPORT_ENV";
pub const ENV_PREFIX: &str = "BULKEXPORT_";

pub struct Config {
    figment: Figment,
}

/// Invocation budget and output settings (`[export]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Wall-clock budget the host grants one invocation.
    pub budget_ms: u64,
    pub finalization_window_ms: u64,
    pub output_dir: String,
    pub page_size: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            budget_ms: 900_000,
            finalization_window_ms: 30_000,
            output_dir: "./out".to_string(),
            page_size: 500,
        }
    }
}

impl ExportSettings {
    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let env_name = env::var(ENV_VAR).unwrap_or_else(|_| "dev".to_string());
        Self::load_from(Path::new("."), &env_name)
    }

    /// Same as [`Config::load`] but with config files looked up in `dir`.
    pub fn load_from(dir: &Path, env_name: &str) -> anyhow::Result<Self> {
        let mut figment = Figment::new().merge(Toml::file(dir.join("config.toml")));
        match env_name {
            "dev" | "development" => {
                figment = figment.merge(Toml::file(dir.join("config.dev.toml")))
            }
            "prod" | "production" => {
                figment = figment.merge(Toml::file(dir.join("config.prod.toml")))
            }
            "test" | "testing" => {
                figment = figment.merge(Toml::file(dir.join("config.test.toml")))
            }
            _ => {}
        }
        let env_vars = Env::prefixed(ENV_PREFIX).ignore(&["env"]).split("__");
        figment = figment.merge(env_vars);

        let config = Self { figment };
        config.validate_for_env(env_name)?;
        Ok(config)
    }

    pub fn get<T>(&self, key: &str) -> anyhow::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| anyhow::anyhow!("Failed to get '{}': {}", key, e))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.figment.find_value(key).is_ok()
    }

    /// `[export]`, falling back to defaults when the section is absent.
    pub fn export_settings(&self) -> anyhow::Result<ExportSettings> {
        if self.contains("export") {
            self.get("export")
        } else {
            Ok(ExportSettings::default())
        }
    }

    fn validate_for_env(&self, env: &str) -> anyhow::Result<()> {
        match env {
            "prod" | "production" => {
                if !self.contains("index.url") {
                    anyhow::bail!("index.url must be configured in {}", env);
                }
            }
            "dev" | "development" | "test" | "testing" => {}
            _ => {}
        }
        Ok(())
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
