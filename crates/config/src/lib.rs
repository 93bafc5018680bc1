//! Layered configuration for the diff cache.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults ([`Config::default()`]).
//! 2. A TOML, YAML or JSON file: either the path given explicitly, or
//!    `config.toml` in the platform config directory if it exists.
//! 3. `DIFFCACHE_`-prefixed environment variables, with `__` separating
//!    nested keys (`DIFFCACHE_CACHE_GIGS=4`).

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "DIFFCACHE_";
const CONFIG_FILE_NAME: &str = "config.toml";

/// A named local directory that raw images are fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for the `images/` and `diffs/` directories and the metrics database.
    pub base_dir: PathBuf,
    /// Memory budget, in GiB, shared by the image and diff metric caches.
    pub cache_gigs: u64,
    /// Worker pool size. Defaults to the number of available CPUs.
    pub parallelism: Option<usize>,
    /// Path prefix stripped by the HTTP image handler.
    pub url_prefix: String,
    pub listen: SocketAddr,
    /// Directory inside each source that holds raw images.
    pub source_prefix: String,
    /// Tried in order; the first source that has a digest wins.
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: project_dirs().map(|dirs| dirs.data_local_dir().to_path_buf()).unwrap_or_default(),
            cache_gigs: 1,
            parallelism: None,
            url_prefix: "/img".to_string(),
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            source_prefix: "dm-images-v1".to_string(),
            sources: Vec::new(),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "diffcache")
}

/// Location of the config file used when none is given explicitly.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

impl Config {
    /// Load and validate the configuration.
    ///
    /// An explicitly given file must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::FileNotFound(path.to_path_buf())),
            Some(path) => figment = merge_file(figment, path),
            None => {
                if let Some(default) = default_config_path().filter(|p| p.is_file()) {
                    figment = merge_file(figment, &default);
                }
            },
        }
        let config: Config =
            figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(
            base_dir = %config.base_dir.display(),
            cache_gigs = config.cache_gigs,
            sources = config.sources.len(),
            "Loaded configuration",
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.base_dir.is_absolute() {
            exn::bail!(ErrorKind::Invalid(format!("base_dir must be absolute: {}", self.base_dir.display())));
        }
        if self.sources.is_empty() {
            exn::bail!(ErrorKind::Invalid("at least one source is required".to_string()));
        }
        if let Some(source) = self.sources.iter().find(|s| !s.path.is_absolute()) {
            exn::bail!(ErrorKind::Invalid(format!("source {} must have an absolute path", source.name)));
        }
        if self.parallelism == Some(0) {
            exn::bail!(ErrorKind::Invalid("parallelism must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Worker pool size, falling back to the available CPUs.
    pub fn parallelism(&self) -> usize {
        self.parallelism
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    }
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    tracing::debug!(path = %path.display(), "Reading configuration file");
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}
