// Request-level coordinator: owns the session, the flash target and the
// deferred restart, and is what the HTTP adapters talk to.

use std::time::Duration;

use log::LevelFilter;
use serde::Serialize;

use crate::auth::{AccessDecision, AccessGate, AccessScope};
use crate::config::{Theme, UploaderConfig};
use crate::error::{ErrorKind, ErrorState};
use crate::events::UploadEvents;
use crate::flash::FlashWriteTarget;
use crate::mode::UpdateMode;
use crate::reboot::{RebootRequest, RebootScheduler};
use crate::request::UploadResponse;
use crate::session::{ChunkEvent, SessionContext, SessionState, UploadSession};

/// Device hooks the uploader needs besides flash.
pub trait Platform {
    fn restart(&mut self);

    /// Free heap in bytes, used to enrich write failure messages.
    fn free_heap(&self) -> Option<usize> {
        None
    }
}

/// Outcome of the most recent upload request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadSummary {
    pub mode: UpdateMode,
    pub bytes: usize,
    pub success: bool,
    pub sha256: Option<String>,
}

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UploadStatus {
    pub state: SessionState,
    pub mode: UpdateMode,
    pub bytes_received: usize,
    pub total_size: usize,
    pub last_error: ErrorKind,
    pub last_error_message: String,
    pub auth_enabled: bool,
    pub auto_reboot: bool,
    pub reboot_pending: Option<RebootRequest>,
    pub last_upload: Option<UploadSummary>,
}

pub struct Uploader<T, P> {
    target: T,
    platform: P,
    session: UploadSession,
    errors: ErrorState,
    events: UploadEvents,
    gate: AccessGate,
    reboot: RebootScheduler,
    auto_reboot: bool,
    debug: bool,
    theme: Theme,
    last_upload: Option<UploadSummary>,
    // Set by finish_request, consumed by after_response
    reboot_candidate: bool,
    // Set by the setters, consumed by take_settings_change
    settings_changed: bool,
}

impl<T: FlashWriteTarget, P: Platform> Uploader<T, P> {
    pub fn new(target: T, platform: P, config: &UploaderConfig) -> Self {
        let mut uploader = Self {
            target,
            platform,
            session: UploadSession::new(),
            errors: ErrorState::new(),
            events: UploadEvents::default(),
            gate: AccessGate::new(&config.username, &config.password),
            reboot: RebootScheduler::new(),
            auto_reboot: config.auto_reboot,
            debug: config.debug,
            theme: config.theme,
            last_upload: None,
            reboot_candidate: false,
            settings_changed: false,
        };
        if uploader.gate.is_enabled() {
            log::info!("Authentication enabled for user: {}", config.username);
        }
        uploader.set_debug(config.debug);
        uploader.settings_changed = false;
        uploader
    }

    /// Feed one chunk event of the upload currently in flight.
    pub fn handle_chunk(&mut self, event: ChunkEvent<'_>) {
        if matches!(event, ChunkEvent::Start { .. }) {
            if let Some(pending) = self.reboot.pending() {
                log::warn!(
                    "Upload started while a reboot is pending (due at {:?})",
                    pending.due_at
                );
            }
        }

        let mut ctx = SessionContext {
            target: &mut self.target,
            errors: &mut self.errors,
            events: &mut self.events,
            platform: &self.platform,
        };
        self.session.handle(event, &mut ctx);
    }

    /// Close the request and pick the response. Fires the end callback with
    /// `false` if the upload never reported an outcome.
    pub fn finish_request(&mut self) -> UploadResponse {
        let success = self.session.conclude(&mut self.events);

        if !success && !self.errors.is_set() {
            let message = match self.session.state() {
                SessionState::Idle => "Update failed: no file received",
                _ => "Update failed: upload did not complete",
            };
            self.errors.set(ErrorKind::UpdateEndFailed, message);
        }

        self.last_upload = Some(UploadSummary {
            mode: self.session.mode(),
            bytes: self.session.bytes_received(),
            success,
            sha256: self.session.digest().map(str::to_string),
        });
        self.reboot_candidate = success;
        self.session.reset();

        if success {
            log::info!("Update completed successfully");
            UploadResponse::Ok
        } else {
            UploadResponse::Fail
        }
    }

    /// Called once the response has been sent. Arms the restart after a
    /// successful update when auto reboot is on.
    pub fn after_response(&mut self, now: Duration) -> Option<RebootRequest> {
        if !std::mem::take(&mut self.reboot_candidate) || !self.auto_reboot {
            return None;
        }
        let request = self.reboot.arm(now);
        log::info!("Rebooting in {} seconds", crate::REBOOT_DELAY.as_secs());
        Some(request)
    }

    /// Record a request-level failure that never reached the session,
    /// such as a malformed body.
    pub fn reject(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.errors.set(kind, message);
    }

    /// Gate a request. A denied request records `AuthFailed`; the caller
    /// must answer with a 401 challenge and go no further.
    pub fn authorize(&mut self, authorization: Option<&str>, scope: AccessScope) -> AccessDecision {
        if self.gate.check(authorization) {
            AccessDecision::Granted
        } else {
            self.errors.set(ErrorKind::AuthFailed, scope.failure_message());
            AccessDecision::Challenge
        }
    }

    /// Poll the deferred restart. Returns true if the platform was restarted.
    pub fn tick(&mut self, now: Duration) -> bool {
        if self.reboot.poll(now) {
            log::info!("Restarting");
            self.platform.restart();
            true
        } else {
            false
        }
    }

    pub fn status(&self) -> UploadStatus {
        UploadStatus {
            state: self.session.state(),
            mode: self.session.mode(),
            bytes_received: self.session.bytes_received(),
            total_size: self.session.total_size(),
            last_error: self.errors.kind(),
            last_error_message: self.errors.message().to_string(),
            auth_enabled: self.gate.is_enabled(),
            auto_reboot: self.auto_reboot,
            reboot_pending: self.reboot.pending(),
            last_upload: self.last_upload.clone(),
        }
    }

    pub fn last_error(&self) -> ErrorKind {
        self.errors.kind()
    }

    pub fn last_error_message(&self) -> &str {
        self.errors.message()
    }

    pub fn last_upload(&self) -> Option<&UploadSummary> {
        self.last_upload.as_ref()
    }

    pub fn on_start(&mut self, callback: impl FnMut() + Send + 'static) {
        self.events.set_on_start(Box::new(callback));
    }

    pub fn on_progress(&mut self, callback: impl FnMut(usize, usize) + Send + 'static) {
        self.events.set_on_progress(Box::new(callback));
    }

    pub fn on_end(&mut self, callback: impl FnMut(bool) + Send + 'static) {
        self.events.set_on_end(Box::new(callback));
    }

    pub fn on_error(&mut self, callback: impl FnMut(ErrorKind, &str) + Send + 'static) {
        self.errors.set_observer(Box::new(callback));
    }

    pub fn set_auth(&mut self, username: &str, password: &str) {
        if self.gate.set_credentials(username, password) {
            log::info!("Authentication enabled for user: {}", username);
        } else {
            log::warn!("Authentication disabled, username and password are both required");
        }
        self.settings_changed = true;
    }

    pub fn clear_auth(&mut self) {
        self.gate.clear();
        self.settings_changed = true;
        log::info!("Authentication disabled");
    }

    pub fn set_auto_reboot(&mut self, enable: bool) {
        self.auto_reboot = enable;
        self.settings_changed = true;
        log::info!("Auto reboot {}", if enable { "enabled" } else { "disabled" });
    }

    /// Toggle verbose logging for the whole process.
    pub fn set_debug(&mut self, enable: bool) {
        self.debug = enable;
        self.settings_changed = true;
        log::set_max_level(level_for(enable));
        log::debug!("Debug logging enabled");
    }

    pub fn set_dark_mode(&mut self, enable: bool) {
        self.theme = if enable { Theme::Dark } else { Theme::Light };
        self.settings_changed = true;
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn gate(&self) -> &AccessGate {
        &self.gate
    }

    /// Settings to persist, if a setter ran since the last call.
    pub fn take_settings_change(&mut self) -> Option<UploaderConfig> {
        std::mem::take(&mut self.settings_changed).then(|| self.config())
    }

    /// Current settings
    pub fn config(&self) -> UploaderConfig {
        UploaderConfig {
            username: self.gate.username().unwrap_or_default().to_string(),
            password: self.gate.password().unwrap_or_default().to_string(),
            auto_reboot: self.auto_reboot,
            debug: self.debug,
            theme: self.theme,
        }
    }

    pub fn session(&self) -> &UploadSession {
        &self.session
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }
}

/// Log level matching the debug switch.
pub fn level_for(debug: bool) -> LevelFilter {
    if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::basic_header;
    use crate::flash::MemoryFlashTarget;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CountingPlatform {
        restarts: usize,
    }

    impl Platform for CountingPlatform {
        fn restart(&mut self) {
            self.restarts += 1;
        }
    }

    fn uploader(config: &UploaderConfig) -> Uploader<MemoryFlashTarget, CountingPlatform> {
        Uploader::new(MemoryFlashTarget::new(), CountingPlatform::default(), config)
    }

    fn upload(uploader: &mut Uploader<MemoryFlashTarget, CountingPlatform>, data: &[u8]) -> UploadResponse {
        uploader.handle_chunk(ChunkEvent::Start {
            mode: None,
            total_size: data.len(),
            filename: Some("fw.bin"),
        });
        uploader.handle_chunk(ChunkEvent::Data(data));
        uploader.handle_chunk(ChunkEvent::End);
        uploader.finish_request()
    }

    #[test]
    fn test_success_arms_single_reboot() {
        let mut up = uploader(&UploaderConfig::default());
        assert_eq!(upload(&mut up, b"image"), UploadResponse::Ok);

        let request = up.after_response(Duration::from_secs(10));
        assert_eq!(request.map(|r| r.due_at), Some(Duration::from_secs(12)));
        // A second call for the same request does nothing
        assert_eq!(up.after_response(Duration::from_secs(11)), None);

        assert!(!up.tick(Duration::from_millis(11_999)));
        assert!(up.tick(Duration::from_secs(12)));
        assert!(!up.tick(Duration::from_secs(13)));
        assert_eq!(up.platform().restarts, 1);
    }

    #[test]
    fn test_auto_reboot_off() {
        let config = UploaderConfig {
            auto_reboot: false,
            ..Default::default()
        };
        let mut up = uploader(&config);
        assert_eq!(upload(&mut up, b"image"), UploadResponse::Ok);
        assert_eq!(up.after_response(Duration::ZERO), None);
        assert!(!up.tick(Duration::from_secs(60)));
    }

    #[test]
    fn test_failure_never_arms_reboot() {
        let mut up = Uploader::new(
            MemoryFlashTarget::new().failing_end("Verify failed"),
            CountingPlatform::default(),
            &UploaderConfig::default(),
        );
        assert_eq!(upload(&mut up, b"image"), UploadResponse::Fail);
        assert_eq!(up.last_error(), ErrorKind::UpdateEndFailed);
        assert_eq!(up.last_error_message(), "Failed to finalize update: Verify failed");
        assert_eq!(up.after_response(Duration::ZERO), None);
    }

    #[test]
    fn test_end_callback_fires_once_per_request() {
        let ends = Arc::new(Mutex::new(Vec::new()));
        let sink = ends.clone();

        let mut up = uploader(&UploaderConfig::default());
        up.on_end(move |success| sink.lock().unwrap().push(success));

        upload(&mut up, b"image");
        // Request without a file part
        up.reject(ErrorKind::InvalidFile, "No file in request");
        up.finish_request();

        assert_eq!(*ends.lock().unwrap(), vec![true, false]);
        assert_eq!(up.last_error(), ErrorKind::InvalidFile);
    }

    #[test]
    fn test_finish_without_outcome_sets_error() {
        let mut up = uploader(&UploaderConfig::default());
        up.handle_chunk(ChunkEvent::Start {
            mode: None,
            total_size: 0,
            filename: None,
        });
        up.handle_chunk(ChunkEvent::Data(b"partial"));

        assert_eq!(up.finish_request(), UploadResponse::Fail);
        assert_eq!(up.last_error(), ErrorKind::UpdateEndFailed);
        assert_eq!(up.session().state(), SessionState::Idle);
        assert_eq!(up.last_upload().map(|s| s.bytes), Some(7));
    }

    #[test]
    fn test_authorize_records_scope_message() {
        let config = UploaderConfig {
            username: "admin".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        };
        let mut up = uploader(&config);

        assert_eq!(up.authorize(None, AccessScope::Status), AccessDecision::Challenge);
        assert_eq!(up.last_error(), ErrorKind::AuthFailed);
        assert_eq!(up.last_error_message(), "Authentication failed for status request");

        let header = basic_header("admin", "secret");
        assert_eq!(up.authorize(Some(&header), AccessScope::Upload), AccessDecision::Granted);
    }

    #[test]
    fn test_config_round_trips_settings() {
        let mut up = uploader(&UploaderConfig::default());
        up.set_auth("admin", "secret");
        up.set_auto_reboot(false);
        up.set_dark_mode(true);

        let config = up.config();
        assert!(config.auth_enabled());
        assert_eq!(config.username, "admin");
        assert!(!config.auto_reboot);
        assert_eq!(config.theme, Theme::Dark);

        up.clear_auth();
        assert!(!up.config().auth_enabled());
    }

    #[test]
    fn test_settings_change_is_reported_once() {
        let mut up = uploader(&UploaderConfig::default());
        assert_eq!(up.take_settings_change(), None);

        up.set_auto_reboot(false);
        up.set_dark_mode(true);
        let changed = up.take_settings_change().unwrap();
        assert!(!changed.auto_reboot);
        assert_eq!(changed.theme, Theme::Dark);
        assert_eq!(up.take_settings_change(), None);

        up.clear_auth();
        assert!(up.take_settings_change().is_some());
    }

    #[test]
    fn test_status_serializes() {
        let mut up = uploader(&UploaderConfig::default());
        upload(&mut up, b"image");

        let json = serde_json::to_value(up.status()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["last_error"], "none");
        assert_eq!(json["last_upload"]["success"], true);
        assert_eq!(json["last_upload"]["bytes"], 5);
    }
}
