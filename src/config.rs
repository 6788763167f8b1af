use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::orchestration::robustness::{
    RobustnessLimits, CONSECUTIVE_ERROR_PIVOT_THRESHOLD, ENTROPY_LOOP_THRESHOLD,
    MAX_IMPLEMENTATION_TURNS,
};
use crate::{flog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// SQLite file holding checkpoints and business entities.
    pub database_path: Option<String>,
    /// Git workspace snapshotted after each verified task.
    pub workspace: Option<String>,
    /// Check workspace and object-store integrity before each snapshot.
    /// Any uncommitted change then counts as a violation.
    pub verify_integrity: Option<bool>,
    pub max_implementation_turns: Option<u32>,
    pub consecutive_error_threshold: Option<u32>,
    pub entropy_loop_threshold: Option<u32>,
}

impl Config {
    pub fn flightdeck_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".flightdeck"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::flightdeck_dir()?.join("flightdeck.toml"))
    }

    pub fn effective_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::flightdeck_dir()?.join("state.sqlite")),
        }
    }

    pub fn workspace_path(&self) -> Option<PathBuf> {
        self.workspace.as_deref().map(expand_tilde)
    }

    pub fn verify_integrity(&self) -> bool {
        self.verify_integrity.unwrap_or(false)
    }

    pub fn limits(&self) -> RobustnessLimits {
        RobustnessLimits {
            max_implementation_turns: self
                .max_implementation_turns
                .unwrap_or(MAX_IMPLEMENTATION_TURNS),
            consecutive_error_threshold: self
                .consecutive_error_threshold
                .unwrap_or(CONSECUTIVE_ERROR_PIVOT_THRESHOLD),
            entropy_loop_threshold: self
                .entropy_loop_threshold
                .unwrap_or(ENTROPY_LOOP_THRESHOLD),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        flog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            flog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        flog_debug!(
            "Config loaded: database_path={:?}, workspace={:?}",
            config.database_path,
            config.workspace
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        flog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::flightdeck_dir()?;
        if !dir.exists() {
            flog_debug!("Creating flightdeck directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
