// Observer hooks for embedding code (UI, logging, telemetry)

use core::fmt;

use crate::error::ErrorKind;

pub type StartCallback = Box<dyn FnMut() + Send>;
/// Called with `(bytes_received, total_size)`; `total_size` is 0 when unknown.
pub type ProgressCallback = Box<dyn FnMut(usize, usize) + Send>;
pub type EndCallback = Box<dyn FnMut(bool) + Send>;
pub type ErrorCallback = Box<dyn FnMut(ErrorKind, &str) + Send>;

/// Registered start/progress/end listeners.
///
/// The error listener lives on [`crate::ErrorState`] so that every error
/// assignment notifies it.
#[derive(Default)]
pub struct UploadEvents {
    on_start: Option<StartCallback>,
    on_progress: Option<ProgressCallback>,
    on_end: Option<EndCallback>,
}

impl UploadEvents {
    pub fn set_on_start(&mut self, callback: StartCallback) {
        self.on_start = Some(callback);
    }

    pub fn set_on_progress(&mut self, callback: ProgressCallback) {
        self.on_progress = Some(callback);
    }

    pub fn set_on_end(&mut self, callback: EndCallback) {
        self.on_end = Some(callback);
    }

    pub(crate) fn start(&mut self) {
        if let Some(callback) = self.on_start.as_mut() {
            callback();
        }
    }

    pub(crate) fn progress(&mut self, current: usize, total: usize) {
        if let Some(callback) = self.on_progress.as_mut() {
            callback(current, total);
        }
    }

    pub(crate) fn end(&mut self, success: bool) {
        if let Some(callback) = self.on_end.as_mut() {
            callback(success);
        }
    }
}

impl fmt::Debug for UploadEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadEvents")
            .field("on_start", &self.on_start.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .field("on_end", &self.on_end.is_some())
            .finish()
    }
}
