/// Configuration structures that can be tested independently
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploaderConfig {
    // Basic auth; enabled only when both are set
    pub username: String,
    pub password: String,

    pub auto_reboot: bool,
    pub debug: bool,

    // UI only
    pub theme: Theme,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            auto_reboot: true,
            debug: false,
            theme: Theme::Light,
        }
    }
}

impl UploaderConfig {
    pub fn auth_enabled(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}
