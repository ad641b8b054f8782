// vim: tw=80
//! Tunables for a [`ChannelFactory`](crate::channel_factory::ChannelFactory)

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Factory-wide settings.  Every field is optional in YAML.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Maximum number of outstanding channels and raw queue pairs
    pub max_channel_count: usize,
    /// Default queue depth of new channels
    pub queue_depth: u32,
    /// Whether new channels keep their direct-I/O bounce buffer by default
    pub preserve_buffer: bool,
}

impl Config {
    pub fn from_yaml(s: &str) -> Result<Self> {
        serde_yaml_ng::from_str(s).map_err(|e| {
            tracing::warn!("invalid configuration: {e}");
            Error::InvalidArguments
        })
    }

    pub fn to_yaml(&self) -> String {
        // Serializing plain scalars can't fail
        serde_yaml_ng::to_string(self).unwrap_or_default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_channel_count: 8,
            queue_depth: 1,
            preserve_buffer: false,
        }
    }
}

// LCOV_EXCL_STOP
