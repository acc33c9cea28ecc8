//! Engine configuration.
//!
//! The host hands the agent a feature string such as
//! `namespace=trace;unsafe.enable=true;dump.path=/tmp/woven`, the same
//! string a JVM passes after `-agentpath:lib.so=`. Blank or malformed pairs
//! are skipped and unknown keys ignored.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_NAMESPACE: &str = "default";

pub const KEY_NAMESPACE: &str = "namespace";
pub const KEY_UNSAFE_ENABLE: &str = "unsafe.enable";
pub const KEY_DUMP_PATH: &str = "dump.path";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub namespace: String,
    /// Allow weaving types defined by the bootstrap loader.
    pub enable_unsafe: bool,
    /// Write every rewritten class below this directory.
    pub dump_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { namespace: DEFAULT_NAMESPACE.to_string(), enable_unsafe: false, dump_path: None }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse a `key=value;key=value` feature string.
    pub fn parse(feature: &str) -> Self {
        let mut config = Self::default();
        for pair in feature.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                if !pair.trim().is_empty() {
                    debug!(pair, "skipping malformed configuration pair");
                }
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                continue;
            }
            match key {
                KEY_NAMESPACE => config.namespace = value.to_string(),
                KEY_UNSAFE_ENABLE => config.enable_unsafe = value.eq_ignore_ascii_case("true"),
                KEY_DUMP_PATH => config.dump_path = Some(PathBuf::from(value)),
                _ => debug!(key, "ignoring unknown configuration key"),
            }
        }
        config
    }

    /// The feature string form, readable by [`EngineConfig::parse`].
    pub fn to_feature_string(&self) -> String {
        let mut out = format!("{KEY_NAMESPACE}={};{KEY_UNSAFE_ENABLE}={}", self.namespace, self.enable_unsafe);
        if let Some(path) = &self.dump_path {
            out.push_str(&format!(";{KEY_DUMP_PATH}={}", path.display()));
        }
        out
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn enable_unsafe(mut self, value: bool) -> Self {
        self.config.enable_unsafe = value;
        self
    }

    pub fn dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dump_path = Some(path.into());
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
