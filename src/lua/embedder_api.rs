use serde::{Deserialize, Serialize};

use crate::base::Result;
use crate::MAX_TABLE_DEPTH;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
/// Embedder specific configuration data
pub struct BridgeConfig {
    /// Open the Lua standard libraries on creation
    pub open_libs: bool,
    /// Maximum nesting depth when reading tables back to the host
    pub max_table_depth: usize,
    /// Append a Lua traceback to runtime error messages
    pub traceback: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            open_libs: true,
            max_table_depth: MAX_TABLE_DEPTH,
            traceback: false,
        }
    }
}

impl BridgeConfig {
    /// Creates a new BridgeConfig
    pub fn new(open_libs: bool, max_table_depth: usize, traceback: bool) -> Self {
        Self {
            open_libs,
            max_table_depth,
            traceback,
        }
    }

    /// Parses a config from JSON. Missing fields take their defaults
    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Tracks how deep a table read has descended
#[derive(Clone, Copy, Debug)]
pub(crate) struct DepthContext {
    depth: usize,
    max: usize,
}

impl DepthContext {
    pub(crate) fn new(config: &BridgeConfig) -> Self {
        Self {
            depth: 0,
            max: config.max_table_depth,
        }
    }

    /// One level further down, or `None` once the limit is reached
    pub(crate) fn nest(&self) -> Option<Self> {
        if self.depth >= self.max {
            return None;
        }
        Some(Self {
            depth: self.depth + 1,
            max: self.max,
        })
    }
}
