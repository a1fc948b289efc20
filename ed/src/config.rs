//! EDDI configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main EDDI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event pool sizing
    pub pool: PoolConfig,

    /// Mailbox sizing
    pub boxes: BoxConfig,

    /// Dispatcher behaviour
    pub dispatcher: DispatchConfig,

    /// Connection to the hub socket
    pub link: LinkConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./eddi.yml
        let local_config = PathBuf::from("eddi.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/eddi/eddi.yml
        if let Some(user_config) = user_config_path()
            && user_config.exists()
        {
            match Self::load_from_file(&user_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed here; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => [Some(PathBuf::from("eddi.yml")), user_config_path()]
                .into_iter()
                .flatten()
                .collect(),
        };
        candidates
            .iter()
            .find(|p| p.exists())
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Self>(&content).ok())
            .and_then(|config| config.log_level)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Look up a setting by dotted key, e.g. `dispatcher.drop-is-fatal`
    ///
    /// Scalars come back in their YAML text form; missing keys and
    /// non-scalar nodes yield `None`.
    pub fn get(&self, key: &str) -> Option<String> {
        let mut node = serde_yaml::to_value(self).ok()?;
        for part in key.split('.') {
            node = match node {
                serde_yaml::Value::Mapping(mut map) => map.remove(part)?,
                _ => return None,
            };
        }
        match node {
            serde_yaml::Value::String(s) => Some(s),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Pool settings with the size derived from the queue size when unset
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: Some(self.pool.size.unwrap_or(2 * self.boxes.queue_size)),
            grow: self.pool.grow,
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("eddi").join("eddi.yml"))
}

/// Event pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of pre-built events; defaults to twice the queue size
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,

    /// Heap-allocate overflow events when every slot is taken
    pub grow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { size: None, grow: true }
    }
}

/// Mailbox sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxConfig {
    /// Initial capacity of every box
    #[serde(rename = "queue-size")]
    pub queue_size: usize,

    /// Capacity added each time a full box grows
    pub increment: usize,

    /// Capacity beyond which inserts fail
    #[serde(rename = "max-size")]
    pub max_size: usize,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            queue_size: 32,
            increment: 32,
            max_size: 1024,
        }
    }
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Idle wait between polls in milliseconds
    #[serde(rename = "wait-ms")]
    pub wait_ms: u64,

    /// Filter file applied by the dispatcher
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<PathBuf>,

    /// Reject filter files with any malformed rule
    #[serde(rename = "strict-filters")]
    pub strict_filters: bool,

    /// Also forward distributed events over the link
    #[serde(rename = "send-internal-events")]
    pub send_internal_events: bool,

    /// Raise a `fatalerror` event whenever an event is dropped
    #[serde(rename = "drop-is-fatal")]
    pub drop_is_fatal: bool,

    /// Delivery attempts into a full mailbox
    pub retries: u32,

    /// Pause between delivery attempts in milliseconds
    #[serde(rename = "retry-backoff-ms")]
    pub retry_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            wait_ms: 1500,
            filter: None,
            strict_filters: false,
            send_internal_events: false,
            drop_is_fatal: false,
            retries: 3,
            retry_backoff_ms: 10,
        }
    }
}

impl DispatchConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Hub connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Connect to the hub at all
    pub enabled: bool,

    /// Hub socket; defaults to the runtime directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<PathBuf>,

    /// Delay between reconnect attempts in milliseconds
    #[serde(rename = "reconnect-ms")]
    pub reconnect_ms: u64,

    /// Frames buffered while the hub is unreachable
    #[serde(rename = "queue-size")]
    pub queue_size: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket: None,
            reconnect_ms: 1000,
            queue_size: 256,
        }
    }
}

impl LinkConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(crate::link::get_socket_path)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.boxes.queue_size, 32);
        assert_eq!(config.dispatcher.retries, 3);
        assert_eq!(config.dispatcher.retry_backoff_ms, 10);
        assert!(!config.dispatcher.drop_is_fatal);
        assert!(!config.link.enabled);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
pool:
  size: 50
  grow: false

boxes:
  queue-size: 8
  increment: 4
  max-size: 16

dispatcher:
  wait-ms: 200
  filter: /etc/eddi/main.filter
  send-internal-events: true
  drop-is-fatal: true

link:
  enabled: true
  socket: /tmp/eddi-test.sock

log-level: debug
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.pool.size, Some(50));
        assert!(!config.pool.grow);
        assert_eq!(config.boxes.max_size, 16);
        assert_eq!(config.dispatcher.wait(), Duration::from_millis(200));
        assert_eq!(config.dispatcher.filter, Some(PathBuf::from("/etc/eddi/main.filter")));
        assert!(config.dispatcher.send_internal_events);
        assert!(config.dispatcher.drop_is_fatal);
        assert_eq!(config.link.socket_path(), PathBuf::from("/tmp/eddi-test.sock"));
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
dispatcher:
  drop-is-fatal: true
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert!(config.dispatcher.drop_is_fatal);
        assert_eq!(config.dispatcher.retries, 3);
        assert_eq!(config.boxes.queue_size, 32);
        assert!(config.pool.grow);
    }

    #[test]
    fn test_pool_size_follows_queue_size() {
        let mut config = Config::default();
        config.boxes.queue_size = 20;
        assert_eq!(config.pool_config().size, Some(40));

        config.pool.size = Some(12);
        assert_eq!(config.pool_config().size, Some(12));
    }

    #[test]
    fn test_get_dotted_key() {
        let mut config = Config::default();
        config.dispatcher.drop_is_fatal = true;

        assert_eq!(config.get("dispatcher.drop-is-fatal").as_deref(), Some("true"));
        assert_eq!(config.get("boxes.queue-size").as_deref(), Some("32"));
        assert_eq!(config.get("dispatcher.missing"), None);
        assert_eq!(config.get("boxes"), None);
    }

    #[test]
    fn test_load_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("eddi.yml");
        std::fs::write(&path, "log-level: trace\nboxes:\n  queue-size: 4\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.boxes.queue_size, 4);
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("trace"));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nope.yml");
        assert!(Config::load(Some(&path)).is_err());
        assert!(Config::load_log_level(Some(&path)).is_none());
    }
}
