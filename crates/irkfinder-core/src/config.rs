//! Application configuration management.
//!
//! Configuration is layered with the `config` crate, later layers winning:
//!
//! 1. Built-in defaults ([`Config::default`])
//! 2. A TOML file (`/etc/irkfinder/config.toml` on Linux, the platform config
//!    directory elsewhere, or the path in `IRKFINDER_CONFIG`)
//! 3. Environment variables such as `IRKFINDER__BLE__PASSKEY=654321`
//!
//! ```toml
//! [ble]
//! device_name = "IRK_FINDER"
//! passkey = 123456
//! random_address = "C0:01:02:03:04:05"
//! manufacturer_data = "455350"
//! bond_poll_interval_secs = 5
//! bluez_storage_dir = "/var/lib/bluetooth"
//! bluez_main_conf = "/etc/bluetooth/main.conf"
//!
//! [server]
//! bind_address = "0.0.0.0"
//! port = 3000
//! production = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::advertising::AdvertisingConfig;
use crate::security::SecurityParams;
use crate::types::{is_valid_mac_address, Address};

/// Static passkey used for pairing unless configured otherwise.
pub const DEFAULT_PASSKEY: u32 = 123_456;

/// Largest passkey that fits the six-digit entry field.
pub const MAX_PASSKEY: u32 = 999_999;

/// Longest device name that fits the scan response alongside the
/// manufacturer data.
pub const MAX_DEVICE_NAME_LEN: usize = 29;

/// Default advertised device name.
pub const DEFAULT_DEVICE_NAME: &str = "IRK_FINDER";

/// Default static random address.
pub const DEFAULT_RANDOM_ADDRESS: &str = "C0:01:02:03:04:05";

/// Default manufacturer data (`"ESP"`), hex-encoded.
pub const DEFAULT_MANUFACTURER_DATA: &str = "455350";

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "IRKFINDER_CONFIG";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "IRKFINDER";

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration layer could not be parsed or merged.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// A single field holds an invalid value.
    #[error("Invalid {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),

    /// No platform configuration directory could be determined.
    #[error("Cannot determine config directory")]
    NoConfigDir,
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// BLE peripheral settings.
    pub ble: BleConfig,
    /// HTTP server settings.
    pub server: ServerConfig,
}

/// BLE peripheral settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Advertised name, at most [`MAX_DEVICE_NAME_LEN`] bytes.
    pub device_name: String,

    /// Static passkey offered during pairing.
    pub passkey: u32,

    /// Static random address, `AA:BB:CC:DD:EE:FF`.
    pub random_address: String,

    /// Manufacturer data carried in the scan response, hex-encoded.
    pub manufacturer_data: String,

    /// How often to enumerate bonds while no key has been retrieved.
    pub bond_poll_interval_secs: u64,

    /// Root of BlueZ's persistent storage.
    pub bluez_storage_dir: PathBuf,

    /// bluetoothd's configuration file, read for its privacy and pairing
    /// settings.
    pub bluez_main_conf: PathBuf,

    /// Adapter to use (e.g. `hci0`); the default adapter when unset.
    pub adapter: Option<String>,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            passkey: DEFAULT_PASSKEY,
            random_address: DEFAULT_RANDOM_ADDRESS.to_string(),
            manufacturer_data: DEFAULT_MANUFACTURER_DATA.to_string(),
            bond_poll_interval_secs: 5,
            bluez_storage_dir: PathBuf::from("/var/lib/bluetooth"),
            bluez_main_conf: PathBuf::from("/etc/bluetooth/main.conf"),
            adapter: None,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_address: String,
    /// TCP port.
    pub port: u16,
    /// Production logging (JSON files plus compact stdout).
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 3000,
            production: false,
        }
    }
}

impl BleConfig {
    /// The configured random address.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the address does not parse.
    pub fn random_address(&self) -> ConfigResult<Address> {
        self.random_address
            .parse()
            .map_err(|e: crate::types::InvalidAddress| ConfigError::ValidationError {
                field: "ble.random_address",
                message: e.to_string(),
            })
    }

    /// The configured manufacturer data as raw bytes.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the value is not valid hex.
    pub fn manufacturer_bytes(&self) -> ConfigResult<Vec<u8>> {
        hex::decode(&self.manufacturer_data).map_err(|e| ConfigError::ValidationError {
            field: "ble.manufacturer_data",
            message: e.to_string(),
        })
    }

    /// Bond poll period.
    #[must_use]
    pub const fn bond_poll_interval(&self) -> Duration {
        Duration::from_secs(self.bond_poll_interval_secs)
    }

    /// Pairing parameters with the configured passkey.
    #[must_use]
    pub const fn security_params(&self) -> SecurityParams {
        SecurityParams::with_passkey(self.passkey)
    }

    /// Advertising payloads and parameters for this device.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the manufacturer data is not valid hex.
    pub fn advertising_config(&self) -> ConfigResult<AdvertisingConfig> {
        Ok(AdvertisingConfig::new(
            self.device_name.clone(),
            self.manufacturer_bytes()?,
        ))
    }

    fn validate_into(&self, errors: &mut Vec<ConfigError>) {
        if self.device_name.is_empty() {
            errors.push(ConfigError::ValidationError {
                field: "ble.device_name",
                message: "must not be empty".to_string(),
            });
        } else if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            errors.push(ConfigError::ValidationError {
                field: "ble.device_name",
                message: format!(
                    "must be at most {MAX_DEVICE_NAME_LEN} bytes (got {})",
                    self.device_name.len()
                ),
            });
        }

        if self.passkey > MAX_PASSKEY {
            errors.push(ConfigError::ValidationError {
                field: "ble.passkey",
                message: format!("must be at most {MAX_PASSKEY} (got {})", self.passkey),
            });
        }

        if !is_valid_mac_address(&self.random_address) {
            errors.push(ConfigError::ValidationError {
                field: "ble.random_address",
                message: format!(
                    "'{}' is not of the form AA:BB:CC:DD:EE:FF",
                    self.random_address
                ),
            });
        } else if let Ok(address) = self.random_address() {
            if !address.is_static_random() {
                errors.push(ConfigError::ValidationError {
                    field: "ble.random_address",
                    message: format!(
                        "{address} is not a static random address (top two bits must be 11)"
                    ),
                });
            }
        }

        if let Err(e) = self.manufacturer_bytes() {
            errors.push(e);
        }

        if self.bond_poll_interval_secs == 0 {
            errors.push(ConfigError::ValidationError {
                field: "ble.bond_poll_interval_secs",
                message: "must be greater than zero".to_string(),
            });
        }
    }
}

impl ServerConfig {
    /// `bind_address:port`.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

impl Config {
    /// Load configuration from the default location, overlaid with
    /// environment variables.
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the result is invalid.
    pub fn load() -> ConfigResult<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map_or_else(Self::default_path, |p| Ok(p.into()))?;
        Self::load_from(&path)
    }

    /// Load configuration from `path` (optional), overlaid with environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be parsed or the result is invalid.
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        debug!(path = %path.display(), "Loading configuration");
        let config: Self = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Self::default())?)
            .add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check every field, collecting all problems.
    ///
    /// # Errors
    ///
    /// Returns the single validation error, or
    /// [`ConfigError::MultipleValidationErrors`] if there are several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        self.ble.validate_into(&mut errors);

        if self.server.bind_address.is_empty() {
            errors.push(ConfigError::ValidationError {
                field: "server.bind_address",
                message: "must not be empty".to_string(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// The default configuration file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] if no platform directory exists.
    pub fn default_path() -> ConfigResult<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/irkfinder/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "irkfinder")
                .ok_or(ConfigError::NoConfigDir)?;
            Ok(dirs.config_dir().join("config.toml"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.ble.passkey, 123_456);
        assert_eq!(
            config.ble.random_address().unwrap(),
            Address::new([0xC0, 0x01, 0x02, 0x03, 0x04, 0x05])
        );
        assert_eq!(config.ble.manufacturer_bytes().unwrap(), b"ESP".to_vec());
        assert_eq!(config.ble.bond_poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_security_params_use_configured_passkey() {
        let mut ble = BleConfig::default();
        ble.passkey = 654_321;
        assert_eq!(ble.security_params().static_passkey, 654_321);
    }

    #[test]
    fn test_device_name_length_limit() {
        let mut config = Config::default();
        config.ble.device_name = "X".repeat(MAX_DEVICE_NAME_LEN);
        config.validate().unwrap();

        config.ble.device_name.push('X');
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError {
                field: "ble.device_name",
                ..
            })
        ));
    }

    #[test]
    fn test_passkey_limit() {
        let mut config = Config::default();
        config.ble.passkey = 1_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError {
                field: "ble.passkey",
                ..
            })
        ));
    }

    #[test]
    fn test_random_address_must_be_static() {
        let mut config = Config::default();
        config.ble.random_address = "40:01:02:03:04:05".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("static random"));

        config.ble.random_address = "not-an-address".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiple_errors_are_collected() {
        let mut config = Config::default();
        config.ble.device_name = String::new();
        config.ble.manufacturer_data = "zz".to_string();
        config.ble.bond_poll_interval_secs = 0;
        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_full_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.ble.device_name = "PHONE_KEYS".to_string();
        config.ble.bluez_main_conf = PathBuf::from("/run/bluetooth/main.conf");
        config.server.port = 8080;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ble]\npasskey = 111111\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.ble.passkey, 111_111);
        assert_eq!(config.ble.device_name, DEFAULT_DEVICE_NAME);
        assert_eq!(config.server, ServerConfig::default());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ble\npasskey = ").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_from_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.ble.device_name, DEFAULT_DEVICE_NAME);
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[ble]\nrandom_address = \"00:11:22:33:44:55\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_advertising_config_from_ble() {
        let adv = BleConfig::default().advertising_config().unwrap();
        assert_eq!(adv.scan_response.local_name, DEFAULT_DEVICE_NAME);
        assert_eq!(adv.scan_response.manufacturer_data, b"ESP".to_vec());
    }
}
