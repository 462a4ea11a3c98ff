use std::path::{Path, PathBuf};

pub const BASE_DIR_ENV_VAR: &str = "FINDCONNECTIONS_BASE_DIR";
const DEFAULT_BASE_DIR_NAME: &str = ".findconnections";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Explicit dir, then `FINDCONNECTIONS_BASE_DIR`, then `./.findconnections`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(dir) = explicit {
            return Self::new(dir.to_path_buf());
        }
        if let Ok(v) = std::env::var(BASE_DIR_ENV_VAR) {
            let t = v.trim();
            if !t.is_empty() {
                return Self::new(PathBuf::from(t));
            }
        }
        Self::new(PathBuf::from(DEFAULT_BASE_DIR_NAME))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn pipeline_config_path(&self) -> PathBuf {
        self.config_dir().join("pipeline.json")
    }

    /// Root of the local object store; each bucket is a sub-directory.
    pub fn buckets_dir(&self) -> PathBuf {
        self.base_dir.join("buckets")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn log_file_path(&self) -> PathBuf {
        self.logs_dir().join("findconnections.log")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.buckets_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
