//! Flasher configuration, loaded from a TOML file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    kwp2000::InterfaceSettings,
    memory::MemoryLayout,
    operations::{
        DataLoggingSettings, ReadFlashSettings, RegionSyncSettings, RelocationPayload,
        SessionSettings, WriteFlashSettings,
    },
    security::SecuritySettings,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlasherConfig {
    pub connection: ConnectionConfig,
    pub session: SessionSettings,
    /// Replaces the security settings of the session section
    pub security: SecuritySettings,
    pub flash: FlashConfig,
    pub logging: LoggingConfig,
    pub relocation: RelocationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port of the K-line adapter
    pub port: String,
    #[serde(flatten)]
    pub interface: InterfaceSettings,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: default_port().to_string(),
            interface: InterfaceSettings::default(),
        }
    }
}

fn default_port() -> &'static str {
    if cfg!(windows) { "COM1" } else { "/dev/ttyUSB0" }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub layout: MemoryLayout,
    pub read: ReadFlashSettings,
    pub write: WriteFlashSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Settings for plain memory reads
    pub sync: RegionSyncSettings,
    /// Settings for the injected variable services
    pub variables: DataLoggingSettings,
}

/// ECU machine code injected by the relocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationConfig {
    /// Redirect function handing unknown services to the original tables
    pub redirect: Option<PathBuf>,
    /// Define and read variable handlers, back to back
    pub logging_functions: Option<PathBuf>,
}

impl RelocationConfig {
    /// Loads the data logging payload, `None` if either file isn't configured.
    pub fn data_logging_payload(&self) -> Result<Option<RelocationPayload>, Error> {
        let (Some(redirect), Some(functions)) = (&self.redirect, &self.logging_functions) else {
            return Ok(None);
        };
        let payload = RelocationPayload::data_logging(std::fs::read(redirect)?, &std::fs::read(functions)?)?;
        Ok(Some(payload))
    }
}

impl FlasherConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Loads `path` if it exists, the defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            security: self.security,
            ..self.session.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::kwp2000::{constants::baud, interface::ConnectMethod};
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[connection]
port = "/dev/ttyUSB3"
connect_method = "fast_init"
connect_address = 0x01

[session]
baud_rates = [10400]

[security]
key_index = 2

[flash.write]
verify = false

[logging.sync]
max_reads_per_second = 5.0
"#
        )
        .unwrap();

        let config = FlasherConfig::load(file.path()).unwrap();
        assert_eq!(config.connection.port, "/dev/ttyUSB3");
        assert_eq!(config.connection.interface.connect_method, ConnectMethod::FastInit);
        assert_eq!(config.connection.interface.connect_address, 0x01);
        assert_eq!(config.connection.interface.connection_attempts, 2);
        assert_eq!(config.session.baud_rates, vec![baud::B10400]);
        assert_eq!(config.session_settings().security.key_index, 2);
        assert!(!config.flash.write.verify);
        assert!(config.flash.write.check_if_write_required);
        assert_eq!(config.flash.layout, MemoryLayout::default());
        assert_eq!(config.logging.sync.max_reads_per_second, 5.0);
        assert_eq!(config.logging.sync.max_bytes_per_read, 64);
        assert_eq!(config.relocation, RelocationConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flasher.toml");
        let mut config = FlasherConfig::default();
        config.connection.port = "COM4".into();
        config.flash.layout.sectors = vec![0x8000, 0x8000];
        config.relocation.redirect = Some("redirect.bin".into());

        config.save(&path).unwrap();
        assert_eq!(FlasherConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FlasherConfig::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, FlasherConfig::default());
        assert!(FlasherConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[session]\nbaud_rates = \"fast\"\n").unwrap();
        assert!(matches!(FlasherConfig::load(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn payload_needs_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let redirect = dir.path().join("redirect.bin");
        std::fs::write(&redirect, crate::operations::relocate::tests::redirect()).unwrap();
        let mut relocation = RelocationConfig {
            redirect: Some(redirect),
            logging_functions: None,
        };
        assert_eq!(relocation.data_logging_payload().unwrap(), None);

        let functions = dir.path().join("logging.bin");
        std::fs::write(&functions, crate::operations::relocate::tests::logging_functions()).unwrap();
        relocation.logging_functions = Some(functions);
        let payload = relocation.data_logging_payload().unwrap().unwrap();
        assert_eq!(payload.functions().len(), 2);
    }
}
