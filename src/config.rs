//! Configuration management for the service.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices and connection parameters, and holds the
//! settings that can be changed at runtime over D-Bus.

use std::{
   env, fs,
   path::{Path, PathBuf},
   sync::atomic::{AtomicBool, Ordering},
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::{AirPodsError, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   #[serde(default = "default_retry_base_delay")]
   pub retry_base_delay_ms: u64,

   #[serde(default = "default_max_retry_delay")]
   pub max_retry_delay_sec: u64,

   #[serde(default = "default_handshake_timeout")]
   pub handshake_timeout_ms: u64,

   #[serde(default = "default_true")]
   pub auto_play_pause: bool,

   #[serde(default = "default_ear_debounce")]
   pub ear_debounce_ms: u64,

   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub log_filter: Option<String>,
}

/// Represents a known accessory.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
}

const fn default_retry_count() -> u32 {
   10
}

const fn default_retry_base_delay() -> u64 {
   2000
}

const fn default_max_retry_delay() -> u64 {
   120
}

const fn default_handshake_timeout() -> u64 {
   5000
}

const fn default_true() -> bool {
   true
}

const fn default_ear_debounce() -> u64 {
   1000
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         connection_retry_count: default_retry_count(),
         retry_base_delay_ms: default_retry_base_delay(),
         max_retry_delay_sec: default_max_retry_delay(),
         handshake_timeout_ms: default_handshake_timeout(),
         auto_play_pause: default_true(),
         ear_debounce_ms: default_ear_debounce(),
         log_filter: None,
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;
      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(airpods_home) = env::var("AIRPODS_HOME") {
         PathBuf::from(airpods_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(AirPodsError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("airpods-service").join("config.toml"))
   }

   /// Checks if the given address is a known device and returns its name.
   pub fn is_known_device(&self, address: Address) -> Option<&str> {
      self
         .known_addresses()
         .find(|(a, _)| *a == address)
         .map(|(_, name)| name)
   }

   /// Configured devices whose address parses.
   pub fn known_addresses(&self) -> impl Iterator<Item = (Address, &str)> {
      self
         .known_devices
         .iter()
         .filter_map(|d| Some((d.address.parse().ok()?, d.name.as_str())))
   }

   pub const fn retry_base_delay(&self) -> Duration {
      Duration::from_millis(self.retry_base_delay_ms)
   }

   pub const fn max_retry_delay(&self) -> Duration {
      Duration::from_secs(self.max_retry_delay_sec)
   }

   pub const fn handshake_timeout(&self) -> Duration {
      Duration::from_millis(self.handshake_timeout_ms)
   }

   pub const fn ear_debounce(&self) -> Duration {
      Duration::from_millis(self.ear_debounce_ms)
   }

   /// Level the logger starts at when `RUST_LOG` does not say otherwise.
   pub fn log_level(&self) -> LevelFilter {
      self
         .log_filter
         .as_deref()
         .and_then(|f| f.parse().ok())
         .unwrap_or(LevelFilter::Info)
   }

   /// Builds the process logger and the level it should start at.
   ///
   /// A bare level, from `rust_log` or the config, only sets the starting
   /// level: the logger itself lets every record through and
   /// [`log::set_max_level`] stays the single gate, so [`Settings`] can
   /// raise verbosity later. Target directives such as `podlinkd=debug`
   /// are kept in the logger.
   pub fn logger(&self, rust_log: Option<&str>) -> (env_logger::Logger, LevelFilter) {
      let mut builder = env_logger::Builder::new();
      let start = match rust_log.map(str::trim).filter(|s| !s.is_empty()) {
         None => self.log_level(),
         Some(spec) => match spec.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => {
               builder.parse_filters(spec);
               let logger = builder.build();
               let level = logger.filter();
               return (logger, level);
            },
         },
      };
      builder.filter_level(LevelFilter::Trace);
      (builder.build(), start)
   }
}

/// Settings that can be changed while the service runs.
#[derive(Debug)]
pub struct Settings {
   auto_play_pause: AtomicBool,
   log_level: AtomicCell<LevelFilter>,
}

impl Settings {
   pub fn new(config: &Config) -> Self {
      Self {
         auto_play_pause: AtomicBool::new(config.auto_play_pause),
         log_level: AtomicCell::new(log::max_level()),
      }
   }

   pub fn auto_play_pause(&self) -> bool {
      self.auto_play_pause.load(Ordering::Relaxed)
   }

   pub fn set_auto_play_pause(&self, enabled: bool) {
      self.auto_play_pause.store(enabled, Ordering::Relaxed);
   }

   pub fn log_level(&self) -> LevelFilter {
      self.log_level.load()
   }

   /// Applies a new log level immediately.
   pub fn set_log_level(&self, level: &str) -> Option<LevelFilter> {
      let level: LevelFilter = level.trim().parse().ok()?;
      self.log_level.store(level);
      log::set_max_level(level);
      Some(level)
   }
}

#[cfg(test)]
mod tests {
   use log::{Level, Log, Metadata};

   use super::*;

   #[test]
   fn missing_file_is_created_with_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("airpods-service").join("config.toml");

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config, Config::default());
      assert!(path.exists());
      assert_eq!(Config::load_from(&path).unwrap(), config);
   }

   #[test]
   fn partial_file_falls_back_to_defaults() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(
         &path,
         r#"
connection_retry_count = 3
auto_play_pause = false
log_filter = "debug"

[[known_devices]]
address = "AA:BB:CC:DD:EE:FF"
name = "Work AirPods"
"#,
      )
      .unwrap();

      let config = Config::load_from(&path).unwrap();
      assert_eq!(config.connection_retry_count, 3);
      assert!(!config.auto_play_pause);
      assert_eq!(config.retry_base_delay(), Duration::from_secs(2));
      assert_eq!(config.handshake_timeout(), Duration::from_secs(5));
      assert_eq!(config.log_level(), LevelFilter::Debug);
      assert_eq!(
         config.is_known_device(Address::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])),
         Some("Work AirPods")
      );
      assert_eq!(config.is_known_device(Address::any()), None);
      assert_eq!(config.known_addresses().count(), 1);
   }

   #[test]
   fn invalid_toml_is_an_error() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("config.toml");
      fs::write(&path, "connection_retry_count = \"many\"").unwrap();
      assert!(matches!(
         Config::load_from(&path),
         Err(AirPodsError::TomlParse(_))
      ));
   }

   #[test]
   fn settings_apply_at_runtime() {
      let settings = Settings::new(&Config::default());
      assert!(settings.auto_play_pause());
      settings.set_auto_play_pause(false);
      assert!(!settings.auto_play_pause());

      assert_eq!(settings.set_log_level("warn"), Some(LevelFilter::Warn));
      assert_eq!(settings.log_level(), LevelFilter::Warn);
      assert_eq!(settings.set_log_level("chatty"), None);
      assert_eq!(settings.log_level(), LevelFilter::Warn);
   }

   #[test]
   fn raised_level_reaches_the_logger() {
      let debug = Metadata::builder()
         .level(Level::Debug)
         .target("podlinkd::registry")
         .build();
      let config = Config::default();

      let (logger, level) = config.logger(None);
      assert_eq!(level, LevelFilter::Info);
      let settings = Settings::new(&config);
      assert_eq!(settings.set_log_level("debug"), Some(LevelFilter::Debug));
      assert!(settings.log_level() >= Level::Debug);
      assert!(logger.enabled(&debug));

      let (logger, level) = config.logger(Some("warn"));
      assert_eq!(level, LevelFilter::Warn);
      assert!(logger.enabled(&debug));

      let (logger, level) = config.logger(Some("podlinkd=debug"));
      assert_eq!(level, LevelFilter::Debug);
      assert!(logger.enabled(&debug));
      let zbus = Metadata::builder().level(Level::Debug).target("zbus").build();
      assert!(!logger.enabled(&zbus));
   }
}
