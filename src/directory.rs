use crate::config::{self, Config};
use crate::error::BptResult;
use std::path::{Path, PathBuf};

/// Lays out the files that make up one on-disk index: the B+ tree file
/// itself, its paired vector store (named by the paged-file layer as
/// `index.bpt.vectors` / `.vectors.meta`), a `.cache/` directory for the
/// query cache, and a `config.ini`.
pub struct IndexDirectory {
    base_dir: PathBuf,
    index_file: PathBuf,
    cache_dir: PathBuf,
    config_file: PathBuf,
}

impl IndexDirectory {
    pub fn new(dir_path: impl Into<PathBuf>) -> Self {
        let base_dir = dir_path.into();
        Self {
            index_file: base_dir.join("index.bpt"),
            cache_dir: base_dir.join(".cache"),
            config_file: base_dir.join("config.ini"),
            base_dir,
        }
    }

    pub fn ensure_exists(&self) -> BptResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(&self.cache_dir)?;
        if !self.config_file.exists() {
            std::fs::write(&self.config_file, config::default_config_text())?;
        }
        Ok(())
    }

    pub fn index_file_path(&self) -> &Path {
        &self.index_file
    }

    pub fn cache_dir_path(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config_file_path(&self) -> &Path {
        &self.config_file
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn index_exists(&self) -> bool {
        self.index_file.exists()
    }

    pub fn cache_exists(&self) -> bool {
        self.cache_dir.exists()
    }

    /// Loads `config.ini`, falling back to defaults if absent rather than
    /// failing — mirroring `read_cache_config`'s "default to enabled"
    /// behavior when no config file is present.
    pub fn load_config(&self) -> BptResult<Config> {
        if !self.config_file.exists() {
            return Ok(Config::default());
        }
        config::load_config(&self.config_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_exists_creates_layout_and_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexDirectory::new(dir.path().join("idx"));
        layout.ensure_exists().unwrap();

        assert!(layout.base_dir().is_dir());
        assert!(layout.cache_dir_path().is_dir());
        assert!(layout.config_file_path().is_file());

        let cfg = layout.load_config().unwrap();
        assert!(cfg.cache.cache_enabled);
        assert_eq!(cfg.cache.max_cache_size_mb, 100);
    }

    #[test]
    fn load_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = IndexDirectory::new(dir.path().join("idx"));
        let cfg = layout.load_config().unwrap();
        assert!(cfg.cache.cache_enabled);
    }
}
