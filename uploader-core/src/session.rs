//! Upload session state machine.
//!
//! One session spans exactly one upload request. The HTTP layer delivers
//! chunk events in order (start, zero or more data, then end or aborted) and
//! each event runs to completion before the next one arrives:
//!
//! ```text
//! Idle --start--> Started --data--> Writing --end--> Ended
//!                    \                 \
//!                     `----------------`--> Aborted
//! ```
//!
//! Any failure aborts the flash target (unless it never opened, or it
//! finalized itself while failing `end`) before the error is recorded.

use core::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, ErrorState};
use crate::events::UploadEvents;
use crate::flash::FlashWriteTarget;
use crate::mode::UpdateMode;
use crate::uploader::Platform;

/// Progress is logged each time another 10 KiB has arrived.
const PROGRESS_LOG_STEP: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Started,
    Writing,
    Ended,
    Aborted,
}

impl SessionState {
    /// The flash target has been begun and not yet ended or aborted.
    pub fn is_open(self) -> bool {
        matches!(self, SessionState::Started | SessionState::Writing)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Aborted)
    }
}

/// One notification from the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEvent<'a> {
    Start {
        /// Raw `mode` request parameter
        mode: Option<&'a str>,
        /// Declared image size, 0 when unknown
        total_size: usize,
        filename: Option<&'a str>,
    },
    Data(&'a [u8]),
    End,
    Aborted,
}

/// Collaborators a session drives while handling one event.
pub struct SessionContext<'a> {
    pub target: &'a mut dyn FlashWriteTarget,
    pub errors: &'a mut ErrorState,
    pub events: &'a mut UploadEvents,
    pub platform: &'a dyn Platform,
}

pub struct UploadSession {
    state: SessionState,
    mode: UpdateMode,
    bytes_received: usize,
    total_size: usize,
    first_chunk_seen: bool,
    end_reported: bool,
    next_progress_log: usize,
    hasher: Sha256,
    digest: Option<String>,
}

impl Default for UploadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadSession {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            mode: UpdateMode::Firmware,
            bytes_received: 0,
            total_size: 0,
            first_chunk_seen: false,
            end_reported: false,
            next_progress_log: PROGRESS_LOG_STEP,
            hasher: Sha256::new(),
            digest: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn first_chunk_seen(&self) -> bool {
        self.first_chunk_seen
    }

    /// Hex SHA-256 of the image, available once the session has ended.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn handle(&mut self, event: ChunkEvent<'_>, ctx: &mut SessionContext<'_>) {
        match event {
            ChunkEvent::Start {
                mode,
                total_size,
                filename,
            } => self.start(ctx, mode, total_size, filename),
            ChunkEvent::Data(data) => self.write(ctx, data),
            ChunkEvent::End => self.end(ctx),
            ChunkEvent::Aborted => self.abort(ctx),
        }
    }

    pub fn start(
        &mut self,
        ctx: &mut SessionContext<'_>,
        mode: Option<&str>,
        total_size: usize,
        filename: Option<&str>,
    ) {
        if self.state.is_open() {
            log::warn!("New upload while a previous one was still open; aborting it");
            ctx.target.abort();
        }

        log::info!("Update started: {}", filename.unwrap_or("<unnamed>"));
        self.reset();
        self.total_size = total_size;
        ctx.errors.clear();

        ctx.events.start();

        self.mode = UpdateMode::from_param(mode);
        log::info!("OTA mode: {}", self.mode);

        let region = self.mode.region();
        let capacity = ctx.target.capacity(region);

        if let Some(capacity) = capacity {
            if total_size > 0 && total_size > capacity {
                let partition = match self.mode {
                    UpdateMode::Firmware => "flash",
                    UpdateMode::Filesystem => "filesystem",
                };
                let message = format!(
                    "File too large for {partition} partition ({total_size} > {capacity} bytes)"
                );
                self.fail(ctx, ErrorKind::FileTooLarge, message, false);
                return;
            }
        }

        match ctx.target.begin(capacity, region) {
            Ok(()) => {
                log::debug!("Flash target opened for {} region (capacity {:?})", region, capacity);
                self.state = SessionState::Started;
            }
            Err(e) => {
                // Nothing was opened, so there is nothing to abort
                self.fail(ctx, ErrorKind::UpdateBeginFailed, format!("Failed to begin update: {e}"), false);
            }
        }
    }

    pub fn write(&mut self, ctx: &mut SessionContext<'_>, data: &[u8]) {
        if !self.state.is_open() {
            log::debug!("Dropping {} bytes, session is {:?}", data.len(), self.state);
            return;
        }

        if !self.first_chunk_seen {
            if data.is_empty() {
                self.fail(ctx, ErrorKind::InvalidFile, "No data received in upload", true);
                return;
            }
            self.first_chunk_seen = true;
            log::info!("First chunk received: {} bytes", data.len());
        }

        if data.is_empty() {
            return;
        }

        let written = ctx.target.write(data);
        if written != data.len() {
            let message = self.write_failure_message(ctx, data.len(), written);
            self.fail(ctx, ErrorKind::UpdateWriteFailed, message, true);
            return;
        }

        self.state = SessionState::Writing;
        self.bytes_received += data.len();
        self.hasher.update(data);

        ctx.events.progress(self.bytes_received, self.total_size);
        self.log_progress();
    }

    pub fn end(&mut self, ctx: &mut SessionContext<'_>) {
        if !self.state.is_open() {
            log::debug!("Ignoring end of upload, session is {:?}", self.state);
            return;
        }

        if !self.first_chunk_seen {
            self.fail(ctx, ErrorKind::InvalidFile, "No data received in upload", true);
            self.report_end(ctx.events, false);
            return;
        }

        match ctx.target.end(true) {
            Ok(()) => {
                let digest = hex(&std::mem::take(&mut self.hasher).finalize());
                log::info!("Update success: {} bytes (sha256 {})", self.bytes_received, digest);
                self.digest = Some(digest);
                self.state = SessionState::Ended;
                self.report_end(ctx.events, true);
            }
            Err(e) => {
                // The target has already torn itself down
                self.fail(ctx, ErrorKind::UpdateEndFailed, format!("Failed to finalize update: {e}"), false);
                self.report_end(ctx.events, false);
            }
        }
    }

    /// Client disconnected mid-upload.
    pub fn abort(&mut self, ctx: &mut SessionContext<'_>) {
        match self.state {
            SessionState::Started | SessionState::Writing => {
                self.fail(ctx, ErrorKind::NetworkError, "Upload was aborted", true);
            }
            SessionState::Idle => {
                self.state = SessionState::Aborted;
                ctx.errors.set(ErrorKind::NetworkError, "Upload was aborted");
            }
            SessionState::Ended | SessionState::Aborted => {
                log::debug!("Upload aborted after session was already {:?}", self.state);
            }
        }
    }

    /// Close out the request: returns whether the update succeeded and makes
    /// sure the end callback has fired exactly once.
    pub(crate) fn conclude(&mut self, events: &mut UploadEvents) -> bool {
        let success = self.state == SessionState::Ended;
        self.report_end(events, success);
        success
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    fn fail(
        &mut self,
        ctx: &mut SessionContext<'_>,
        kind: ErrorKind,
        message: impl Into<String>,
        abort_target: bool,
    ) {
        if abort_target {
            ctx.target.abort();
        }
        self.state = SessionState::Aborted;
        ctx.errors.set(kind, message);
    }

    fn report_end(&mut self, events: &mut UploadEvents, success: bool) {
        if !self.end_reported {
            self.end_reported = true;
            events.end(success);
        }
    }

    fn write_failure_message(&self, ctx: &SessionContext<'_>, expected: usize, written: usize) -> String {
        let reason = ctx
            .target
            .last_error_reason()
            .filter(|reason| !reason.is_empty() && reason != "No Error");

        let detail = match reason {
            Some(reason) => reason,
            None => {
                let mut detail = format!("Write size mismatch (expected: {expected}, written: {written})");
                if let Some(free) = ctx.platform.free_heap() {
                    detail.push_str(&format!(", Free heap: {free} bytes"));
                }
                detail
            }
        };
        format!("Failed to write update data: {detail}")
    }

    fn log_progress(&mut self) {
        let reached_total = self.total_size > 0 && self.bytes_received == self.total_size;
        if self.bytes_received < self.next_progress_log && !reached_total {
            return;
        }
        self.next_progress_log = (self.bytes_received / PROGRESS_LOG_STEP + 1) * PROGRESS_LOG_STEP;

        if self.total_size > 0 {
            let percentage = self.bytes_received as f32 / self.total_size as f32 * 100.0;
            log::info!(
                "Upload progress: {:.1}% ({}/{} bytes)",
                percentage,
                self.bytes_received,
                self.total_size
            );
        } else {
            log::info!("Upload progress: {} bytes", self.bytes_received);
        }
    }
}

impl fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSession")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("bytes_received", &self.bytes_received)
            .field("total_size", &self.total_size)
            .field("first_chunk_seen", &self.first_chunk_seen)
            .field("digest", &self.digest)
            .finish()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
