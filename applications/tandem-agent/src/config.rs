/// Agent configuration
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tandem_ota::EngineConfig;

const DEFAULT_CONFIG_FILE: &str = "tandem-agent.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default = "default_simulator")]
    pub simulator: SimulatorSettings,
}

/// Simulated device pair
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorSettings {
    /// Version the companion reports in its device info
    #[serde(default = "default_companion_version")]
    pub companion_version: String,

    /// Version of the running main firmware
    #[serde(default = "default_main_version")]
    pub main_version: String,

    /// Whether the companion accepts flashing over SPI
    #[serde(default = "default_spi_available")]
    pub spi_available: bool,

    /// Backing file of the companion flash
    #[serde(default = "default_companion_flash_path")]
    pub companion_flash_path: PathBuf,

    /// Backing file of the inactive main-firmware slot
    #[serde(default = "default_ota_slot_path")]
    pub ota_slot_path: PathBuf,
}

impl AgentConfig {
    /// Load from `path` (or `tandem-agent.toml` if present) and the
    /// environment.
    ///
    /// Environment variables use the `TANDEM_` prefix and `__` between
    /// nesting levels, e.g. `TANDEM_SIMULATOR__MAIN_VERSION=1.4.0`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = config::Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(AgentError::Config(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                settings = settings.add_source(config::File::from(path));
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    settings = settings.add_source(config::File::from(default_path));
                }
            }
        }

        settings = settings.add_source(
            config::Environment::with_prefix("TANDEM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = settings
            .build()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.engine.validate()?;

        if self.simulator.companion_version.trim().is_empty() {
            return Err(AgentError::Config(
                "simulator.companion_version must not be empty".to_string(),
            ));
        }
        if self.simulator.main_version.trim().is_empty() {
            return Err(AgentError::Config(
                "simulator.main_version must not be empty".to_string(),
            ));
        }
        if self.simulator.companion_flash_path == self.simulator.ota_slot_path {
            return Err(AgentError::Config(format!(
                "companion flash and OTA slot share the file {:?}",
                self.simulator.companion_flash_path
            )));
        }

        Ok(())
    }
}

// Default values
fn default_simulator() -> SimulatorSettings {
    SimulatorSettings {
        companion_version: default_companion_version(),
        main_version: default_main_version(),
        spi_available: default_spi_available(),
        companion_flash_path: default_companion_flash_path(),
        ota_slot_path: default_ota_slot_path(),
    }
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        default_simulator()
    }
}

fn default_companion_version() -> String {
    "1.1.0".to_string()
}

fn default_main_version() -> String {
    "1.0.0".to_string()
}

fn default_spi_available() -> bool {
    true
}

fn default_companion_flash_path() -> PathBuf {
    PathBuf::from("./data/companion-flash.bin")
}

fn default_ota_slot_path() -> PathBuf {
    PathBuf::from("./data/ota-slot.bin")
}
