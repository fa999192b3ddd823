use core::fmt;

use serde::{Deserialize, Serialize};

use crate::flash::Region;

/// What an upload is going to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    #[default]
    Firmware,
    Filesystem,
}

impl UpdateMode {
    /// Resolve the `mode` request parameter.
    ///
    /// Only the exact value `"filesystem"` selects [`UpdateMode::Filesystem`];
    /// anything else, including a missing parameter, falls back to firmware.
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            Some("filesystem") => UpdateMode::Filesystem,
            _ => UpdateMode::Firmware,
        }
    }

    /// Flash region the image for this mode is written to.
    pub fn region(self) -> Region {
        match self {
            UpdateMode::Firmware => Region::Executable,
            UpdateMode::Filesystem => Region::Data,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateMode::Firmware => "firmware",
            UpdateMode::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
