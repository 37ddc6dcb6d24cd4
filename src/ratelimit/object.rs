//! Identity of protected objects.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::NetquotaError;

/// The kind of resource a limiter protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// A published API
    Api,
    /// A security definition shared by several channels
    SecurityDefinition,
    /// An inbound channel
    Channel,
    /// A single-sign-on user
    SsoUser,
    /// An outgoing connection
    OutgoingConnection,
}

impl ObjectType {
    /// The canonical lowercase name, as used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Api => "api",
            ObjectType::SecurityDefinition => "security_definition",
            ObjectType::Channel => "channel",
            ObjectType::SsoUser => "sso_user",
            ObjectType::OutgoingConnection => "outgoing_connection",
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = NetquotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "api" => Ok(ObjectType::Api),
            "security_definition" | "sec_def" => Ok(ObjectType::SecurityDefinition),
            "channel" => Ok(ObjectType::Channel),
            "sso_user" => Ok(ObjectType::SsoUser),
            "outgoing_connection" | "outconn" => Ok(ObjectType::OutgoingConnection),
            other => Err(NetquotaError::Config(format!(
                "Unknown object type `{}`",
                other
            ))),
        }
    }
}

/// A key that uniquely identifies a protected object instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// What kind of object this is
    pub object_type: ObjectType,
    /// Name of the object, unique within its type
    pub name: String,
}

impl ObjectInfo {
    /// Create a new object key.
    pub fn new(object_type: ObjectType, name: impl Into<String>) -> Self {
        Self {
            object_type,
            name: name.into(),
        }
    }

    /// The `<type>:<name>` form used in logs and diagnostics.
    pub fn config_key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for ObjectInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.object_type, self.name)
    }
}
