//! Driver configuration
//!
//! Loaded once at startup from a YAML file. Every section has defaults so a
//! minimal file only names the array endpoints and credentials.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Array hosting the volumes
    pub array: ArrayAuthConfig,
    /// Replication peer, required for replication operations
    pub remote_array: Option<ArrayAuthConfig>,
    pub iscsi: IscsiConfig,
    pub naming: NamingConfig,
    pub waits: WaitConfig,
    pub replication: ReplicationConfig,
    pub volume: VolumeConfig,
}

/// Connection settings of one array controller
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayAuthConfig {
    /// Management REST endpoints, tried in order at login
    pub endpoints: Vec<String>,
    pub username: String,
    pub password: String,
    /// Accept self-signed controller certificates
    pub insecure: bool,
    pub request_timeout_secs: u64,
}

impl std::fmt::Debug for ArrayAuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayAuthConfig")
            .field("endpoints", &self.endpoints)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for ArrayAuthConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            username: String::new(),
            password: String::new(),
            insecure: false,
            request_timeout_secs: 30,
        }
    }
}

impl ArrayAuthConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::Configuration(format!("{}.endpoints must not be empty", section)));
        }
        if self.username.is_empty() {
            return Err(Error::Configuration(format!("{}.username must be set", section)));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Configuration(format!(
                "{}.request_timeout_secs must be positive",
                section
            )));
        }
        Ok(())
    }
}

/// iSCSI portal selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IscsiConfig {
    /// Portal IPs handed to hosts; empty means every portal the array reports
    pub target_ips: Vec<String>,
    pub port: u16,
}

impl Default for IscsiConfig {
    fn default() -> Self {
        Self {
            target_ips: Vec::new(),
            port: 3260,
        }
    }
}

/// Deterministic naming of per-host array objects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub host_group_prefix: String,
    pub lun_group_prefix: String,
    pub mapping_view_prefix: String,
    /// Array limit on object name length
    pub max_name_length: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            host_group_prefix: "HostGroup_".to_string(),
            lun_group_prefix: "LunGroup_".to_string(),
            mapping_view_prefix: "MappingView_".to_string(),
            max_name_length: 31,
        }
    }
}

/// Polling intervals and deadlines for asynchronous array changes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub replica_interval_secs: u64,
    pub replica_timeout_secs: u64,
    pub lun_ready_interval_secs: u64,
    pub lun_ready_timeout_secs: u64,
    pub lun_copy_interval_secs: u64,
    pub lun_copy_timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            replica_interval_secs: 10,
            replica_timeout_secs: 600,
            lun_ready_interval_secs: 5,
            lun_ready_timeout_secs: 300,
            lun_copy_interval_secs: 5,
            lun_copy_timeout_secs: 3600,
        }
    }
}

impl WaitConfig {
    pub fn replica_interval(&self) -> Duration {
        Duration::from_secs(self.replica_interval_secs)
    }

    pub fn replica_timeout(&self) -> Duration {
        Duration::from_secs(self.replica_timeout_secs)
    }

    pub fn lun_ready_interval(&self) -> Duration {
        Duration::from_secs(self.lun_ready_interval_secs)
    }

    pub fn lun_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.lun_ready_timeout_secs)
    }

    pub fn lun_copy_interval(&self) -> Duration {
        Duration::from_secs(self.lun_copy_interval_secs)
    }

    pub fn lun_copy_timeout(&self) -> Duration {
        Duration::from_secs(self.lun_copy_timeout_secs)
    }
}

/// Replication pair creation parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Array synchronization speed code
    pub speed: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            speed: "2".to_string(),
        }
    }
}

/// Volumes created from snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Pool used when a request names none
    pub default_pool: String,
    /// Array LUN copy speed code (1 low .. 4 highest)
    pub copy_speed: String,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            default_pool: "StoragePool001".to_string(),
            copy_speed: "2".to_string(),
        }
    }
}

impl DriverConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.array.validate("array")?;
        if let Some(remote) = &self.remote_array {
            remote.validate("remote_array")?;
        }
        if self.naming.max_name_length == 0 {
            return Err(Error::Configuration("naming.max_name_length must be positive".into()));
        }
        let longest_prefix = [
            &self.naming.host_group_prefix,
            &self.naming.lun_group_prefix,
            &self.naming.mapping_view_prefix,
        ]
        .iter()
        .map(|p| p.len())
        .max()
        .unwrap_or(0);
        if longest_prefix >= self.naming.max_name_length {
            return Err(Error::Configuration(
                "naming prefixes must be shorter than naming.max_name_length".into(),
            ));
        }
        if self.waits.replica_interval_secs == 0
            || self.waits.lun_ready_interval_secs == 0
            || self.waits.lun_copy_interval_secs == 0
        {
            return Err(Error::Configuration("wait intervals must be positive".into()));
        }
        if self.waits.replica_timeout_secs < self.waits.replica_interval_secs
            || self.waits.lun_ready_timeout_secs < self.waits.lun_ready_interval_secs
            || self.waits.lun_copy_timeout_secs < self.waits.lun_copy_interval_secs
        {
            return Err(Error::Configuration(
                "wait timeouts must not be shorter than their intervals".into(),
            ));
        }
        Ok(())
    }

    /// Remote array settings, required for replication
    pub fn remote(&self) -> Result<&ArrayAuthConfig> {
        self.remote_array
            .as_ref()
            .ok_or_else(|| Error::Configuration("remote_array is not configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    const SAMPLE: &str = r#"
array:
  endpoints: ["https://10.0.0.10:8088/deviceManager/rest"]
  username: admin
  password: secret
  insecure: true
remote_array:
  endpoints: ["https://10.0.1.10:8088/deviceManager/rest"]
  username: admin
  password: secret
iscsi:
  target_ips: ["192.168.10.21"]
waits:
  replica_interval_secs: 2
volume:
  default_pool: gold
"#;

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = DriverConfig::from_file(file.path()).unwrap();
        assert!(config.array.insecure);
        assert_eq!(config.array.request_timeout_secs, 30);
        assert_eq!(config.iscsi.port, 3260);
        assert_eq!(config.iscsi.target_ips, vec!["192.168.10.21".to_string()]);
        assert_eq!(config.naming.host_group_prefix, "HostGroup_");
        assert_eq!(config.naming.max_name_length, 31);
        assert_eq!(config.waits.replica_interval(), Duration::from_secs(2));
        assert_eq!(config.waits.replica_timeout(), Duration::from_secs(600));
        assert_eq!(config.replication.speed, "2");
        assert_eq!(config.volume.default_pool, "gold");
        assert_eq!(config.volume.copy_speed, "2");
        assert_eq!(config.waits.lun_copy_timeout(), Duration::from_secs(3600));
        assert!(config.remote().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let config = DriverConfig::default();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config: DriverConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.naming.max_name_length = 8;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config: DriverConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.waits.replica_timeout_secs = 1;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config: DriverConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.waits.lun_copy_interval_secs = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config: DriverConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.remote_array = None;
        assert!(config.validate().is_ok());
        assert_matches!(config.remote(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file() {
        assert_matches!(
            DriverConfig::from_file("/nonexistent/driver.yaml"),
            Err(Error::Io(_))
        );
    }

    #[test]
    fn test_password_not_logged() {
        let config: DriverConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let rendered = format!("{:?}", config.array);
        assert!(!rendered.contains("secret"));
    }
}
