// Device side of the uploader: flash target and platform hooks

pub mod platform;
pub mod target;

use std::sync::{Arc, Mutex};

use uploader_core::Uploader;

pub use platform::EspPlatform;
pub use target::EspFlashTarget;

pub type DeviceUploader = Uploader<EspFlashTarget, EspPlatform>;

/// Shared between the HTTP handlers and the main loop
pub type SharedUploader = Arc<Mutex<DeviceUploader>>;
