//! Method-call envelope, addressing defaults and listen filters.

use serde::{Deserialize, Serialize};

use super::CmdType;
use crate::codec::Content;

/// One method call travelling over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    /// Unique name of the sending connection, stamped by the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    pub target: String,
    pub object: String,
    pub interface: String,
    pub method: String,
    pub cmd_type: CmdType,
    #[serde(with = "base64_content")]
    pub content: Vec<u8>,
}

/// Where a call goes. Object path and interface default from the target name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAddress {
    pub target: String,
    pub object: Option<String>,
    pub interface: Option<String>,
    pub method: String,
}

impl CallAddress {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            object: None,
            interface: None,
            method: method.into(),
        }
    }

    pub fn with_object(mut self, object: impl Into<String>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Object path: explicit, else `/` + target with dots as slashes.
    pub fn object_path(&self) -> String {
        self.object
            .clone()
            .unwrap_or_else(|| default_object_path(&self.target))
    }

    /// Interface: explicit, else the target name.
    pub fn interface_name(&self) -> String {
        self.interface.clone().unwrap_or_else(|| self.target.clone())
    }

    pub fn to_call(&self, cmd_type: CmdType, content: Vec<u8>) -> MethodCall {
        MethodCall {
            sender: None,
            target: self.target.clone(),
            object: self.object_path(),
            interface: self.interface_name(),
            method: self.method.clone(),
            cmd_type,
            content,
        }
    }
}

/// `a.b.c` -> `/a/b/c`
pub fn default_object_path(target: &str) -> String {
    format!("/{}", target.replace('.', "/"))
}

/// Selects which incoming calls a listen accepts.
///
/// An absent or empty interface filter accepts any interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFilter {
    pub interface: Option<String>,
    pub method: String,
}

impl CallFilter {
    pub fn new(interface: Option<&str>, method: &str) -> Self {
        Self {
            interface: interface.filter(|i| !i.is_empty()).map(str::to_string),
            method: method.to_string(),
        }
    }

    pub fn matches(&self, call: &MethodCall) -> bool {
        call.method == self.method
            && self
                .interface
                .as_deref()
                .is_none_or(|interface| call.interface == interface)
    }
}

/// A call accepted by `listen_call`, content decoded per the requested encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCall {
    pub cmd_type: CmdType,
    pub content: Content,
    pub sender: Option<String>,
    pub object: String,
    pub interface: String,
    pub method: String,
}

mod base64_content {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
