//! Manager configuration
//!
//! A process is described by one file, YAML or TOML:
//!
//! ```yaml
//! process_name: arm-controller
//! mailbox_capacity: 64
//! network:
//!   global_address: 10.0.0.2:7400
//!   listen_address: 0.0.0.0:0
//! components:
//!   - name: arm
//!     type_name: ArmServo
//!     kind: periodic
//!     period_ms: 5
//!     options:
//!       joints: 6
//! connections:
//!   - required: planner.Arm
//!     provided: arm.Control
//! ```

use crate::communication::mailbox::DEFAULT_MAILBOX_CAPACITY;
use crate::core::component::{ComponentKind, ComponentOptions};
use crate::core::state_table::DEFAULT_STATE_TABLE_CAPACITY;
use crate::error::{MtaskError, MtaskResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_process_name() -> String {
    "mtask".to_string()
}

fn default_mailbox_capacity() -> usize {
    DEFAULT_MAILBOX_CAPACITY
}

fn default_state_table_capacity() -> usize {
    DEFAULT_STATE_TABLE_CAPACITY
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_blocking_timeout_ms() -> u64 {
    5000
}

/// How a component is scheduled, as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KindConfig {
    #[default]
    Passive,
    Periodic,
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address of the global component manager; `None` for a standalone process
    #[serde(default)]
    pub global_address: Option<String>,

    /// Address this process serves remote calls on
    #[serde(default)]
    pub listen_address: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            global_address: None,
            listen_address: None,
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: String,

    /// Key into the component registry
    pub type_name: String,

    #[serde(default)]
    pub kind: KindConfig,

    #[serde(default)]
    pub period_ms: Option<u64>,

    /// Factory-specific options
    #[serde(default)]
    pub options: HashMap<String, serde_yaml::Value>,
}

impl ComponentConfig {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            kind: KindConfig::Passive,
            period_ms: None,
            options: HashMap::new(),
        }
    }

    pub fn periodic(mut self, period_ms: u64) -> Self {
        self.kind = KindConfig::Periodic;
        self.period_ms = Some(period_ms);
        self
    }

    pub fn continuous(mut self) -> Self {
        self.kind = KindConfig::Continuous;
        self
    }

    pub fn component_kind(&self) -> MtaskResult<ComponentKind> {
        match self.kind {
            KindConfig::Passive => Ok(ComponentKind::Passive),
            KindConfig::Continuous => Ok(ComponentKind::Continuous),
            KindConfig::Periodic => match self.period_ms {
                Some(ms) if ms > 0 => Ok(ComponentKind::Periodic(Duration::from_millis(ms))),
                _ => Err(MtaskError::config(format!(
                    "periodic component '{}' needs a positive period_ms",
                    self.name
                ))),
            },
        }
    }

    /// Get an option as a string
    pub fn get_option(&self, key: &str) -> Option<String> {
        self.options.get(key).and_then(|v| match v {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn get_option_i64(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_option_f64(&self, key: &str) -> Option<f64> {
        self.options.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(|v| v.as_bool())
    }
}

/// `required` is `component.interface` in this process, `provided` is
/// `[process:]component.interface`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub required: String,
    pub provided: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default = "default_process_name")]
    pub process_name: String,

    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,

    #[serde(default = "default_state_table_capacity")]
    pub state_table_capacity: usize,

    /// Timeout of blocking queued calls issued on behalf of remote callers
    #[serde(default = "default_blocking_timeout_ms")]
    pub blocking_timeout_ms: u64,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub components: Vec<ComponentConfig>,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            process_name: default_process_name(),
            mailbox_capacity: default_mailbox_capacity(),
            state_table_capacity: default_state_table_capacity(),
            blocking_timeout_ms: default_blocking_timeout_ms(),
            network: NetworkConfig::default(),
            components: Vec::new(),
            connections: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn new(process_name: &str) -> Self {
        Self {
            process_name: process_name.to_string(),
            ..Self::default()
        }
    }

    /// Load config from a file (auto-detect format)
    pub fn from_file<P: AsRef<Path>>(path: P) -> MtaskResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MtaskError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let extension = path.extension().and_then(|s| s.to_str());
        let config = match extension {
            Some("toml") => Self::from_toml(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_yaml(&contents).or_else(|_| Self::from_toml(&contents)),
        }?;
        log::debug!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse config from YAML string
    pub fn from_yaml(contents: &str) -> MtaskResult<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| MtaskError::config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> MtaskResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| MtaskError::config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load config from the working directory
    ///
    /// Search order: `mtask.yaml`, `mtask.yml`, `mtask.toml`
    pub fn find_and_load() -> MtaskResult<Self> {
        Self::find_in(Path::new("."))
    }

    pub fn find_in(dir: &Path) -> MtaskResult<Self> {
        let candidates: Vec<PathBuf> = ["mtask.yaml", "mtask.yml", "mtask.toml"]
            .iter()
            .map(|name| dir.join(name))
            .collect();
        for path in candidates {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Err(MtaskError::config(format!(
            "No mtask.yaml or mtask.toml in {}",
            dir.display()
        )))
    }

    /// Save config to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> MtaskResult<()> {
        let path = path.as_ref();
        let extension = path.extension().and_then(|s| s.to_str());

        let contents = match extension {
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| MtaskError::config(format!("Failed to serialize TOML: {}", e)))?,
            _ => serde_yaml::to_string(self)
                .map_err(|e| MtaskError::config(format!("Failed to serialize YAML: {}", e)))?,
        };

        std::fs::write(path, contents)
            .map_err(|e| MtaskError::config(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// Reject values the manager cannot run with
    pub fn validate(&self) -> MtaskResult<()> {
        if self.process_name.is_empty() {
            return Err(MtaskError::config("process_name must not be empty"));
        }
        if self.process_name.contains(':') || self.process_name.contains('.') {
            return Err(MtaskError::config(format!(
                "process_name '{}' must not contain ':' or '.'",
                self.process_name
            )));
        }
        if self.mailbox_capacity == 0 || self.state_table_capacity < 2 {
            return Err(MtaskError::config(
                "mailbox_capacity must be positive and state_table_capacity at least 2",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for component in &self.components {
            if !seen.insert(component.name.as_str()) {
                return Err(MtaskError::config(format!(
                    "component '{}' configured twice",
                    component.name
                )));
            }
            component.component_kind()?;
        }
        Ok(())
    }

    pub fn component_options(&self) -> ComponentOptions {
        ComponentOptions {
            mailbox_capacity: self.mailbox_capacity,
            state_table_capacity: self.state_table_capacity,
        }
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::from_yaml("process_name: p1\n").unwrap();
        assert_eq!(config.process_name, "p1");
        assert_eq!(config.mailbox_capacity, 64);
        assert_eq!(config.state_table_capacity, 256);
        assert_eq!(config.network.request_timeout(), Duration::from_secs(5));
        assert!(config.network.global_address.is_none());
        assert!(config.components.is_empty());
    }

    #[test]
    fn test_yaml_components_and_connections() {
        let yaml = r#"
process_name: robot
mailbox_capacity: 16
network:
  global_address: 127.0.0.1:7400
  request_timeout_ms: 250
components:
  - name: arm
    type_name: Servo
    kind: periodic
    period_ms: 5
    options:
      joints: 6
      port: /dev/ttyUSB0
  - name: planner
    type_name: Planner
    kind: continuous
connections:
  - required: planner.Arm
    provided: arm.Control
"#;
        let config = ManagerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.mailbox_capacity, 16);
        assert_eq!(config.network.request_timeout_ms, 250);
        let arm = &config.components[0];
        assert_eq!(
            arm.component_kind().unwrap(),
            ComponentKind::Periodic(Duration::from_millis(5))
        );
        assert_eq!(arm.get_option_i64("joints"), Some(6));
        assert_eq!(arm.get_option("port"), Some("/dev/ttyUSB0".to_string()));
        assert_eq!(
            config.components[1].component_kind().unwrap(),
            ComponentKind::Continuous
        );
        assert_eq!(config.connections[0].provided, "arm.Control");
    }

    #[test]
    fn test_toml() {
        let toml = r#"
process_name = "p2"
blocking_timeout_ms = 100

[network]
listen_address = "127.0.0.1:0"

[[components]]
name = "sensor"
type_name = "Sensor"
"#;
        let config = ManagerConfig::from_toml(toml).unwrap();
        assert_eq!(config.blocking_timeout(), Duration::from_millis(100));
        assert_eq!(config.network.listen_address.as_deref(), Some("127.0.0.1:0"));
        assert_eq!(
            config.components[0].component_kind().unwrap(),
            ComponentKind::Passive
        );
    }

    #[test]
    fn test_validation() {
        assert!(ManagerConfig::from_yaml("process_name: 'a:b'\n").is_err());
        assert!(ManagerConfig::from_yaml("mailbox_capacity: 0\n").is_err());
        let yaml = r#"
components:
  - name: x
    type_name: T
    kind: periodic
"#;
        assert!(ManagerConfig::from_yaml(yaml).is_err());
        let yaml = r#"
components:
  - name: x
    type_name: T
  - name: x
    type_name: U
"#;
        assert!(ManagerConfig::from_yaml(yaml).is_err());
    }
}
