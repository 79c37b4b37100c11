use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// `[cache]` section of `config.ini`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,

    #[serde(default = "default_max_cache_size_mb")]
    pub max_cache_size_mb: u64,
}

impl CacheConfig {
    pub fn max_cache_size_bytes(&self) -> u64 {
        self.max_cache_size_mb * 1024 * 1024
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_enabled: default_cache_enabled(),
            max_cache_size_mb: default_max_cache_size_mb(),
        }
    }
}

/// `[index]` section. Reserved for future tuning knobs; parsed but unused,
/// matching the original's empty placeholder section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndexSectionConfig {}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub index: IndexSectionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            index: IndexSectionConfig::default(),
        }
    }
}

/// Reads and parses `config.ini` at `path`. The INI subset the directory
/// layer writes out (bare `key = value` lines under a single `[section]`
/// header) parses as TOML, so the same `toml` crate the teacher already
/// depends on is reused here rather than a hand-rolled line parser.
pub fn load_config(path: &Path) -> crate::error::BptResult<Config> {
    let text = fs::read_to_string(path)?;
    toml::from_str(&text)
        .map_err(|e| crate::error::BptError::BadConfig(format!("{}: {}", path.display(), e)))
}

/// The literal text written for a fresh `config.ini`, mirroring
/// `IndexDirectory::create_default_config`'s output exactly.
pub fn default_config_text() -> String {
    format!(
        "[cache]\ncache_enabled = {}\nmax_cache_size_mb = {}\n\n[index]\n# Index configuration options\n",
        default_cache_enabled(),
        default_max_cache_size_mb(),
    )
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_cache_size_mb() -> u64 {
    100
}
