//! Command-line interface configuration
//!
//! The [Config] type loads and saves `navflash.toml`, searched for in
//! the current directory, its parent, and finally the per-user
//! configuration directory.

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::PathBuf,
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub port: Option<String>,
    /// Baud rate for the port
    pub baud: Option<u32>,
}

/// Default flashing behavior
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlashConfig {
    /// Erase the whole application flash before updating it
    #[serde(default = "default_true")]
    pub erase_application: bool,
    /// Skip coprocessor updates whose version is already current
    #[serde(default = "default_true")]
    pub check_versions: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig {
            erase_application: true,
            check_versions: true,
        }
    }
}

/// Deserialized contents of a configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Preferred serial connection
    #[serde(default)]
    pub connection: Connection,
    /// Device name used for firmware-index lookups
    #[serde(default)]
    pub device: Option<String>,
    /// Flash defaults
    #[serde(default)]
    pub flash: FlashConfig,
    /// Path of the file the configuration was loaded from
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load configuration from the configuration file, or defaults when
    /// no file exists.
    pub fn load() -> Result<Self> {
        let file = Self::config_path();

        let mut config = match read_to_string(&file) {
            Ok(data) => toml::from_str(&data)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to parse {}", file.display()))?,
            Err(_) => Self::default(),
        };
        config.save_path = file;

        debug!("Config: {config:#?}");
        Ok(config)
    }

    /// Save the (modified) configuration back to its file.
    pub fn save_with<F: Fn(&mut Self)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.clone();
        modify_fn(&mut copy);

        let serialized = toml::to_string(&copy)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;

        if let Some(parent) = self.save_path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }

        write(&self.save_path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", self.save_path.display()))
    }

    fn config_path() -> PathBuf {
        const FILENAME: &str = "navflash.toml";

        if let Ok(cwd) = std::env::current_dir() {
            let local = cwd.join(FILENAME);
            if local.exists() {
                return local;
            }
            if let Some(parent) = cwd.parent() {
                let workspace = parent.join(FILENAME);
                if workspace.exists() {
                    return workspace;
                }
            }
        }

        match ProjectDirs::from("rs", "nav", "navflash") {
            Some(dirs) => dirs.config_dir().join(FILENAME),
            None => PathBuf::from(FILENAME),
        }
    }
}
