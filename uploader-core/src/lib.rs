//! Uploader Core - Hardware-independent logic for the ESP32 firmware uploader
//!
//! This crate contains the upload state machine and everything around it
//! that can be tested on the host platform without requiring ESP32 hardware.
//! The device crate supplies the flash target, the platform hooks and the
//! HTTP server; everything else lives here.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod flash;
pub mod mode;
pub mod multipart;
pub mod reboot;
pub mod request;
pub mod session;
pub mod uploader;

pub use auth::{AccessDecision, AccessGate, AccessScope, WWW_AUTHENTICATE};
pub use config::{Theme, UploaderConfig};
pub use error::{ErrorKind, ErrorState};
pub use events::UploadEvents;
pub use flash::{FlashError, FlashWriteTarget, MemoryFlashTarget, Region};
pub use mode::UpdateMode;
pub use reboot::{RebootRequest, RebootScheduler, REBOOT_DELAY};
pub use request::UploadResponse;
pub use session::{ChunkEvent, SessionState, UploadSession};
pub use uploader::{Platform, UploadStatus, UploadSummary, Uploader};
