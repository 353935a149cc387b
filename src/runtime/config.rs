//! Configuration for context groups and processes.
//!
//! This module defines the configuration structures for JavaScript groups and
//! processes, including heap limits, bootstrap options and the media access mask.

use crate::runtime::error::BridgeError;
use bitflags::bitflags;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Media/filesystem permission bits granted to a process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessMask: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl AccessMask {
    /// Convenience alias for the empty mask.
    pub const NONE: AccessMask = AccessMask::empty();

    pub fn as_str(self) -> &'static str {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (false, false) => "none",
            (true, false) => "read",
            (false, true) => "write",
            (true, true) => "read-write",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::NONE),
            "read" => Some(Self::READ),
            "write" => Some(Self::WRITE),
            "read-write" | "readwrite" => Some(Self::READ_WRITE),
            _ => None,
        }
    }

    /// Whether this mask grants every bit in `required`.
    pub fn grants(self, required: AccessMask) -> bool {
        self.contains(required)
    }
}

impl Serialize for AccessMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AccessMask {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AccessMask::parse(&raw).ok_or_else(|| {
            D::Error::custom(format!(
                "unknown access mask '{}', expected none, read, write or read-write",
                raw
            ))
        })
    }
}

/// Isolate settings for one context group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Maximum heap size in bytes (None = V8 default)
    pub max_heap_size: Option<usize>,

    /// Initial heap size in bytes (None = V8 default)
    pub initial_heap_size: Option<usize>,

    /// Name of the dedicated group thread
    pub thread_name: Option<String>,
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Check heap limits before an isolate is created.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.initial_heap_size.is_some() && self.max_heap_size.is_none() {
            return Err(BridgeError::InvalidConfig(
                "initial_heap_size requires max_heap_size to be set as well".to_string(),
            ));
        }

        if let (Some(initial), Some(max)) = (self.initial_heap_size, self.max_heap_size) {
            if initial > max {
                return Err(BridgeError::InvalidConfig(format!(
                    "initial_heap_size ({}) cannot exceed max_heap_size ({})",
                    initial, max
                )));
            }
        }

        Ok(())
    }
}

fn default_console() -> bool {
    true
}

/// Settings for a Node-style process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Caller-chosen namespace key for the process
    pub identity: String,

    /// Media/filesystem permissions exposed as `process.mediaAccess`
    #[serde(default)]
    pub access: AccessMask,

    /// Isolate settings for the process group
    #[serde(default, flatten)]
    pub group: GroupConfig,

    /// Bootstrap script to run after the globals are installed
    #[serde(default)]
    pub bootstrap_script: Option<String>,

    /// Route `console.*` to tracing (default: true)
    #[serde(default = "default_console")]
    pub enable_console: bool,
}

impl ProcessConfig {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            access: AccessMask::NONE,
            group: GroupConfig::default(),
            bootstrap_script: None,
            enable_console: true,
        }
    }

    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(json).map_err(|err| BridgeError::InvalidConfig(err.to_string()))
    }

    pub fn with_access(mut self, access: AccessMask) -> Self {
        self.access = access;
        self
    }

    pub fn with_max_heap_size(mut self, bytes: usize) -> Self {
        self.group.max_heap_size = Some(bytes);
        self
    }

    pub fn with_initial_heap_size(mut self, bytes: usize) -> Self {
        self.group.initial_heap_size = Some(bytes);
        self
    }

    pub fn with_bootstrap(mut self, source: impl Into<String>) -> Self {
        self.bootstrap_script = Some(source.into());
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.enable_console = enabled;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.group.thread_name = Some(name.into());
        self
    }

    /// Thread name used when none was configured.
    pub(crate) fn thread_name(&self) -> String {
        self.group
            .thread_name
            .clone()
            .unwrap_or_else(|| format!("jsprocess-{}", self.identity))
    }
}

/// Reject identities that cannot double as a directory name.
pub fn validate_identity(identity: &str) -> Result<(), BridgeError> {
    let invalid = identity.is_empty()
        || identity == "."
        || identity == ".."
        || identity.contains("..")
        || identity.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BridgeError::InvalidIdentity(identity.to_string()));
    }
    Ok(())
}
