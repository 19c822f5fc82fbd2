use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::coordinator::DatasetDefaults;
use super::error::ConfigError;
use super::stomp::QueueSettings;

/// Which change notifications drive the tick worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierKind {
    #[default]
    Filesystem,
    Queue,
    Both,
    None,
}

impl NotifierKind {
    pub fn uses_filesystem(&self) -> bool {
        matches!(self, Self::Filesystem | Self::Both)
    }

    pub fn uses_queue(&self) -> bool {
        matches!(self, Self::Queue | Self::Both)
    }
}

/// Structure representing the application configuration. Contains the default dataset
/// location, the server address and the notifier settings.
/// Configs are seralizable and deserializable to YAML using serde and serde_yaml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub filepath: PathBuf,
    pub filename: String,
    pub dataset_name: String,
    pub bind_address: String,
    pub notifier: NotifierKind,
    pub watch_path: Option<PathBuf>,
    pub stomp_address: String,
    pub stomp_login: String,
    pub stomp_passcode: String,
    pub stomp_destination: String,
    pub stomp_reconnect_secs: u64,
    pub subscriber_queue_depth: usize,
    pub log_level: String,
    pub log_path: PathBuf,
    pub open_on_start: bool,
}

impl Default for Config {
    /// Generate a new Config object pointing at the beamline's default bluesky output
    fn default() -> Self {
        Self {
            filepath: PathBuf::from("/dls/b01-1/data/2025/cm40661-1/bluesky"),
            filename: String::from("0.hdf"),
            dataset_name: String::from("entry/instrument/detector/data"),
            bind_address: String::from("127.0.0.1:8000"),
            notifier: NotifierKind::Filesystem,
            watch_path: None,
            stomp_address: String::from("localhost:5672"),
            stomp_login: String::from("user"),
            stomp_passcode: String::from("password"),
            stomp_destination: String::from("/queue/test"),
            stomp_reconnect_secs: 5,
            subscriber_queue_depth: 256,
            log_level: String::from("info"),
            log_path: PathBuf::from("visr_live.log"),
            open_on_start: false,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Write the configuration to a YAML file
    pub fn write_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(config_path, yaml_str)?;
        Ok(())
    }

    /// Check everything that can be checked without touching the data files
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_address()?;
        self.log_level_filter()?;
        if !self.is_queue_depth_valid() {
            return Err(ConfigError::BadQueueDepth);
        }
        Ok(())
    }

    /// Path to the file holding the default dataset
    pub fn full_dataset_path(&self) -> PathBuf {
        self.filepath.join(&self.filename)
    }

    /// Directory watched for file changes; the dataset directory unless overridden
    pub fn watch_directory(&self) -> &Path {
        self.watch_path.as_deref().unwrap_or(&self.filepath)
    }

    pub fn is_queue_depth_valid(&self) -> bool {
        self.subscriber_queue_depth >= 1
    }

    pub fn socket_address(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_address
            .parse()
            .map_err(|_| ConfigError::BadBindAddress(self.bind_address.clone()))
    }

    pub fn log_level_filter(&self) -> Result<log::LevelFilter, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::BadLogLevel(self.log_level.clone()))
    }

    pub fn dataset_defaults(&self) -> DatasetDefaults {
        DatasetDefaults {
            filepath: self.filepath.clone(),
            filename: self.filename.clone(),
            dataset_name: self.dataset_name.clone(),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            address: self.stomp_address.clone(),
            login: self.stomp_login.clone(),
            passcode: self.stomp_passcode.clone(),
            destination: self.stomp_destination.clone(),
            reconnect_delay: Duration::from_secs(self.stomp_reconnect_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_reads_back_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.yml");
        Config::default().write_config_file(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("dataset_name:"));
        assert_eq!(Config::read_config_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn template_survives_a_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        let config = Config {
            notifier: NotifierKind::Both,
            watch_path: Some(PathBuf::from("/tmp/watch")),
            ..Default::default()
        };
        config.write_config_file(&path).unwrap();
        assert_eq!(Config::read_config_file(&path).unwrap(), config);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.yml");
        std::fs::write(&path, "filename: 7.hdf\nnotifier: queue\n").unwrap();

        let config = Config::read_config_file(&path).unwrap();
        assert_eq!(config.filename, "7.hdf");
        assert_eq!(config.notifier, NotifierKind::Queue);
        assert!(config.notifier.uses_queue());
        assert!(!config.notifier.uses_filesystem());
        assert_eq!(config.dataset_name, "entry/instrument/detector/data");
        assert_eq!(
            config.full_dataset_path(),
            PathBuf::from("/dls/b01-1/data/2025/cm40661-1/bluesky/7.hdf")
        );
    }

    #[test]
    fn missing_file_is_a_bad_path() {
        assert!(matches!(
            Config::read_config_file(Path::new("/no/such/config.yml")),
            Err(ConfigError::BadFilePath(_))
        ));
    }

    #[test]
    fn validation_catches_bad_values() {
        assert!(Config::default().validate().is_ok());
        let bad_address = Config {
            bind_address: String::from("not an address"),
            ..Default::default()
        };
        assert!(matches!(bad_address.validate(), Err(ConfigError::BadBindAddress(_))));
        let bad_depth = Config {
            subscriber_queue_depth: 0,
            ..Default::default()
        };
        assert!(matches!(bad_depth.validate(), Err(ConfigError::BadQueueDepth)));
        let bad_level = Config {
            log_level: String::from("loud"),
            ..Default::default()
        };
        assert!(matches!(bad_level.validate(), Err(ConfigError::BadLogLevel(_))));
    }

    #[test]
    fn watch_directory_defaults_to_filepath() {
        let mut config = Config::default();
        assert_eq!(config.watch_directory(), config.filepath.as_path());
        config.watch_path = Some(PathBuf::from("/elsewhere"));
        assert_eq!(config.watch_directory(), Path::new("/elsewhere"));
    }
}
