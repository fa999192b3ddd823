use core::fmt;

use serde::{Deserialize, Serialize};

use crate::events::ErrorCallback;

/// Classification of the last upload failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    None,
    AuthFailed,
    UpdateBeginFailed,
    UpdateWriteFailed,
    UpdateEndFailed,
    FileTooLarge,
    InvalidFile,
    NetworkError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::UpdateBeginFailed => "update_begin_failed",
            ErrorKind::UpdateWriteFailed => "update_write_failed",
            ErrorKind::UpdateEndFailed => "update_end_failed",
            ErrorKind::FileTooLarge => "file_too_large",
            ErrorKind::InvalidFile => "invalid_file",
            ErrorKind::NetworkError => "network_error",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::None => "no error",
            ErrorKind::AuthFailed => "authentication failed",
            ErrorKind::UpdateBeginFailed => "flash target refused to open",
            ErrorKind::UpdateWriteFailed => "flash write failed",
            ErrorKind::UpdateEndFailed => "update could not be finalized",
            ErrorKind::FileTooLarge => "image larger than the target region",
            ErrorKind::InvalidFile => "upload carried no data",
            ErrorKind::NetworkError => "upload was interrupted",
        }
    }

    pub fn is_error(&self) -> bool {
        *self != ErrorKind::None
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The single "last error" slot.
///
/// Every [`ErrorState::set`] overwrites the previous error and notifies the
/// registered observer before returning. Reading never clears; only the
/// next session start does.
#[derive(Default)]
pub struct ErrorState {
    kind: ErrorKind,
    message: String,
    observer: Option<ErrorCallback>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.kind = kind;
        self.message = message.into();
        log::error!("{}", self.message);

        if let Some(observer) = self.observer.as_mut() {
            observer(kind, &self.message);
        }
    }

    pub fn clear(&mut self) {
        self.kind = ErrorKind::None;
        self.message.clear();
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_set(&self) -> bool {
        self.kind.is_error()
    }

    pub fn set_observer(&mut self, observer: ErrorCallback) {
        self.observer = Some(observer);
    }
}

impl fmt::Debug for ErrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorState")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}
