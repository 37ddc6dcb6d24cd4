//! Configuration management for netquota.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::error::{NetquotaError, Result};
use crate::ratelimit::{LimitMode, ObjectInfo, ObjectType, RuleSet};

/// Prefix of environment variables that override file settings, e.g.
/// `NETQUOTA__CLEANUP__INTERVAL_SECS=10`.
pub const ENV_PREFIX: &str = "NETQUOTA";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetquotaConfig {
    /// Cleanup sweep configuration
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Protected objects and their rules
    #[serde(default)]
    pub objects: Vec<ObjectConfig>,
}

/// Cleanup sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Seconds between two sweeps
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

impl CleanupConfig {
    /// The sweep interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_active() -> bool {
    true
}

/// Rate limiting definition of one protected object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectConfig {
    /// Kind of object
    pub object_type: ObjectType,

    /// Object name, unique within its type
    pub name: String,

    /// Parent object that must also admit each request
    #[serde(default)]
    pub parent: Option<ObjectInfo>,

    /// Limit mode
    #[serde(default)]
    pub mode: LimitMode,

    /// Inactive objects admit all requests
    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Rule text, one `<network> = <rate>/<unit>` per line
    pub rules: String,
}

impl ObjectConfig {
    /// Create an active, approximate object definition.
    pub fn new(object: ObjectInfo, rules: impl Into<String>) -> Self {
        Self {
            object_type: object.object_type,
            name: object.name,
            parent: None,
            mode: LimitMode::default(),
            is_active: true,
            rules: rules.into(),
        }
    }

    /// Set the parent object.
    pub fn with_parent(mut self, parent: ObjectInfo) -> Self {
        self.parent = Some(parent);
        self
    }

    /// The key this object is registered under.
    pub fn object_info(&self) -> ObjectInfo {
        ObjectInfo::new(self.object_type, self.name.clone())
    }

    /// Parse the rule text.
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::parse(&self.rules).map_err(|e| match e {
            NetquotaError::Config(msg) => {
                NetquotaError::Config(format!("{}: {}", self.object_info(), msg))
            }
            other => other,
        })
    }
}

impl NetquotaConfig {
    /// Load configuration from a YAML file, applying `NETQUOTA__*`
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        info!(path = %path, "Loading netquota configuration");

        let config = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Load configuration from a YAML file without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse every object's rules, failing on the first malformed one.
    pub fn validate(&self) -> Result<()> {
        for object in &self.objects {
            object.rule_set()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
cleanup:
  interval_secs: 10
objects:
  - object_type: security_definition
    name: partner-a
    rules: "* = 100/hour"
  - object_type: channel
    name: orders
    mode: exact
    parent:
      object_type: security_definition
      name: partner-a
    rules: |
      # internal
      10.0.0.0/8 = 3/minute
      * = 1/minute
"#;

    #[test]
    fn test_parse_config() {
        let config = NetquotaConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.cleanup.interval_secs, 10);
        assert_eq!(config.objects.len(), 2);

        let orders = &config.objects[1];
        assert_eq!(orders.object_info(), ObjectInfo::new(ObjectType::Channel, "orders"));
        assert_eq!(orders.mode, LimitMode::Exact);
        assert!(orders.is_active);
        assert_eq!(
            orders.parent,
            Some(ObjectInfo::new(ObjectType::SecurityDefinition, "partner-a"))
        );
        assert_eq!(orders.rule_set().unwrap().items().len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = NetquotaConfig::from_yaml("objects: []").unwrap();
        assert_eq!(config.cleanup.interval_secs, 30);
        assert_eq!(config.cleanup.interval(), Duration::from_secs(30));
        assert!(config.objects.is_empty());
    }

    #[test]
    fn test_validate_reports_object() {
        let yaml = r#"
objects:
  - object_type: api
    name: billing
    rules: "10.0.0.0/8 = 3/fortnight"
"#;
        let config = NetquotaConfig::from_yaml(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("api:billing"), "{}", err);
        assert!(err.contains("fortnight"), "{}", err);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = NetquotaConfig::from_yaml("objects: [").unwrap_err();
        assert!(matches!(err, NetquotaError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("netquota-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = NetquotaConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.objects.len(), 2);
        assert_eq!(config.objects[0].name, "partner-a");

        let again = NetquotaConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(again.cleanup.interval_secs, 10);

        std::fs::remove_file(&path).unwrap();
    }
}
