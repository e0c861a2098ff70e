//! Daemon and client configuration.
//!
//! Two directories locate everything:
//!
//! - the configuration directory (`CEO_CONFIG_DIR`, default `/etc/csc`)
//!   holding `ceod.toml`, the key tables and the `ops.d` registry
//! - the library directory (`CEO_LIB_DIR`, default `/usr/lib/ceod`)
//!   holding the `op-<name>` executables
//!
//! `ceod.toml` is optional; a missing file means every default.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::protocol::TransportKind;

/// Environment variable naming the configuration directory.
pub const CONFIG_DIR_ENV: &str = "CEO_CONFIG_DIR";

/// Environment variable naming the operation library directory.
pub const LIB_DIR_ENV: &str = "CEO_LIB_DIR";

/// Default configuration directory.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/csc";

/// Default operation library directory.
pub const DEFAULT_LIB_DIR: &str = "/usr/lib/ceod";

/// Well-known daemon port.
pub const DEFAULT_PORT: u16 = 9987;

/// Default service name; the service principal is `<service>@<fqdn>`.
pub const DEFAULT_SERVICE: &str = "ceod";

/// Name of the optional configuration file inside the configuration
/// directory.
pub const CONFIG_FILE_NAME: &str = "ceod.toml";

/// Name of the registry subdirectory.
pub const OPS_DIR_NAME: &str = "ops.d";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// Resolved directory locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Configuration directory.
    pub config_dir: PathBuf,
    /// Operation library directory.
    pub lib_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            lib_dir: PathBuf::from(DEFAULT_LIB_DIR),
        }
    }
}

impl Paths {
    /// Create from explicit directories.
    pub fn new(config_dir: impl Into<PathBuf>, lib_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            lib_dir: lib_dir.into(),
        }
    }

    /// The registry directory, `<config>/ops.d`.
    #[must_use]
    pub fn ops_dir(&self) -> PathBuf {
        self.config_dir.join(OPS_DIR_NAME)
    }

    /// The configuration file, `<config>/ceod.toml`.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }

    /// Executable path for a local operation, `<lib>/op-<name>`.
    #[must_use]
    pub fn op_path(&self, name: &str) -> PathBuf {
        self.lib_dir.join(format!("op-{name}"))
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CeoConfig {
    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Client settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Operation name to run-as user name.
    #[serde(default)]
    pub run_as: BTreeMap<String, String>,
}

impl CeoConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, has unknown keys, or fails
    /// validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<config>/ceod.toml`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(paths: &Paths) -> Result<Self, ConfigError> {
        let path = paths.config_file();
        match fs::metadata(&path) {
            Ok(_) => Self::from_file(&path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.service.is_empty() || self.daemon.service.contains('@') {
            return Err(ConfigError::Validation(format!(
                "invalid service name '{}'",
                self.daemon.service
            )));
        }
        if self.daemon.hostname.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Validation(
                "daemon.hostname must not be empty".to_string(),
            ));
        }
        if let Some((op, _)) = self.run_as.iter().find(|(_, user)| user.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "run_as.{op} names no user"
            )));
        }
        Ok(())
    }
}

/// `[daemon]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Port the daemon listens on and clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport binding.
    #[serde(default)]
    pub transport: TransportKind,

    /// Service name.
    #[serde(default = "default_service")]
    pub service: String,

    /// Canonical host name override.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Acceptor key table; defaults to `<config>/ceod.keytab`.
    #[serde(default)]
    pub keytab: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            transport: TransportKind::default(),
            service: default_service(),
            hostname: None,
            keytab: None,
        }
    }
}

impl DaemonConfig {
    /// Acceptor key table location.
    #[must_use]
    pub fn keytab_path(&self, paths: &Paths) -> PathBuf {
        self.keytab
            .clone()
            .unwrap_or_else(|| paths.config_dir.join("ceod.keytab"))
    }
}

/// `[client]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Initiator key table; defaults to `<config>/client.keytab`.
    #[serde(default)]
    pub keytab: Option<PathBuf>,

    /// Principal to authenticate as; defaults to the sole key table entry.
    #[serde(default)]
    pub principal: Option<String>,
}

impl ClientConfig {
    /// Initiator key table location.
    #[must_use]
    pub fn keytab_path(&self, paths: &Paths) -> PathBuf {
        self.keytab
            .clone()
            .unwrap_or_else(|| paths.config_dir.join("client.keytab"))
    }
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [daemon]
            port = 10000
            transport = "message"
            service = "ceod"
            hostname = "caffeine.csclub.uwaterloo.ca"
            keytab = "/etc/csc/ceod.keytab"

            [client]
            keytab = "/etc/csc/client.keytab"
            principal = "alice@CSCLUB"

            [run_as]
            adduser = "root"
        "#;

        let config = CeoConfig::from_toml(toml).unwrap();
        assert_eq!(config.daemon.port, 10000);
        assert_eq!(config.daemon.transport, TransportKind::Message);
        assert_eq!(
            config.daemon.hostname.as_deref(),
            Some("caffeine.csclub.uwaterloo.ca")
        );
        assert_eq!(config.client.principal.as_deref(), Some("alice@CSCLUB"));
        assert_eq!(config.run_as.get("adduser").map(String::as_str), Some("root"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CeoConfig::from_toml("").unwrap();
        assert_eq!(config.daemon.port, DEFAULT_PORT);
        assert_eq!(config.daemon.transport, TransportKind::Stream);
        assert_eq!(config.daemon.service, "ceod");
        assert!(config.run_as.is_empty());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            CeoConfig::from_toml("[daemon]\nsocket = \"/tmp/x\"\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(CeoConfig::from_toml("[extra]\n").is_err());
    }

    #[test]
    fn test_invalid_service_rejected() {
        assert!(matches!(
            CeoConfig::from_toml("[daemon]\nservice = \"a@b\"\n"),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_paths() {
        let paths = Paths::new("/cfg", "/lib/ceod");
        assert_eq!(paths.ops_dir(), PathBuf::from("/cfg/ops.d"));
        assert_eq!(paths.op_path("adduser"), PathBuf::from("/lib/ceod/op-adduser"));
        assert_eq!(
            DaemonConfig::default().keytab_path(&paths),
            PathBuf::from("/cfg/ceod.keytab")
        );
        assert_eq!(
            ClientConfig::default().keytab_path(&paths),
            PathBuf::from("/cfg/client.keytab")
        );
        assert_eq!(Paths::default().config_dir, PathBuf::from("/etc/csc"));
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path(), dir.path());
        let config = CeoConfig::load(&paths).unwrap();
        assert_eq!(config.daemon.port, DEFAULT_PORT);

        std::fs::write(paths.config_file(), "[daemon]\nport = 1234\n").unwrap();
        assert_eq!(CeoConfig::load(&paths).unwrap().daemon.port, 1234);
    }
}
