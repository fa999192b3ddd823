use std::time::Duration;

use serde::Serialize;

/// Delay between a verified update and the restart.
pub const REBOOT_DELAY: Duration = Duration::from_secs(2);

/// A pending restart. Times are measured from boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebootRequest {
    pub due_at: Duration,
}

/// Single-slot deferred restart.
///
/// Arming again replaces the pending request; [`RebootScheduler::poll`]
/// reports a due request exactly once.
#[derive(Debug, Default, Clone, Copy)]
pub struct RebootScheduler {
    pending: Option<RebootRequest>,
}

impl RebootScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, now: Duration) -> RebootRequest {
        let request = RebootRequest {
            due_at: now.saturating_add(REBOOT_DELAY),
        };
        self.pending = Some(request);
        request
    }

    pub fn cancel(&mut self) -> Option<RebootRequest> {
        self.pending.take()
    }

    pub fn pending(&self) -> Option<RebootRequest> {
        self.pending
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Returns true once when the pending request is due, disarming it.
    pub fn poll(&mut self, now: Duration) -> bool {
        match self.pending {
            Some(request) if now >= request.due_at => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}
