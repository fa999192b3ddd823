// Flash write target contract and the in-memory implementation

use core::fmt;

use serde::{Deserialize, Serialize};

/// A named flash area with its own capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    /// Application image slot
    Executable,
    /// Filesystem data partition
    Data,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Executable => f.write_str("executable"),
            Region::Data => f.write_str("data"),
        }
    }
}

/// Failure reported by a flash target, carrying its human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashError {
    reason: String,
}

impl FlashError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for FlashError {}

/// Destination for update bytes. Owns the actual erase/program work.
///
/// Lifecycle per upload: `begin`, any number of `write`s, then either `end`
/// or `abort`. A target that fails `end` has already released its own
/// state; callers do not abort it afterwards.
pub trait FlashWriteTarget {
    /// Available capacity of `region`, `None` when the platform can't tell.
    fn capacity(&self, region: Region) -> Option<usize>;

    fn begin(&mut self, capacity: Option<usize>, region: Region) -> Result<(), FlashError>;

    /// Returns how many bytes were accepted. Anything short of
    /// `data.len()` is a failure.
    fn write(&mut self, data: &[u8]) -> usize;

    fn end(&mut self, verify: bool) -> Result<(), FlashError>;

    fn abort(&mut self);

    /// Reason for the most recent failure, if the target recorded one.
    fn last_error_reason(&self) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub begin: usize,
    pub write: usize,
    pub end: usize,
    pub abort: usize,
}

#[derive(Debug, Clone, Copy)]
struct OpenImage {
    region: Region,
    limit: Option<usize>,
}

/// In-memory flash target used by the host simulator and the tests.
#[derive(Debug, Default)]
pub struct MemoryFlashTarget {
    executable_capacity: Option<usize>,
    data_capacity: Option<usize>,
    begin_failure: Option<String>,
    end_failure: Option<String>,
    write_budget: Option<usize>,
    open: Option<OpenImage>,
    buffer: Vec<u8>,
    committed: Option<(Region, Vec<u8>)>,
    last_error: Option<String>,
    calls: CallCounts,
}

impl MemoryFlashTarget {
    /// Target with unknown (unbounded) capacity in both regions.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, region: Region, capacity: usize) -> Self {
        match region {
            Region::Executable => self.executable_capacity = Some(capacity),
            Region::Data => self.data_capacity = Some(capacity),
        }
        self
    }

    pub fn failing_begin(mut self, reason: impl Into<String>) -> Self {
        self.begin_failure = Some(reason.into());
        self
    }

    pub fn failing_end(mut self, reason: impl Into<String>) -> Self {
        self.end_failure = Some(reason.into());
        self
    }

    /// Accept only `bytes` in total, then write short without a reason,
    /// like a driver that ran out of buffers.
    pub fn short_writes_after(mut self, bytes: usize) -> Self {
        self.write_budget = Some(bytes);
        self
    }

    pub fn calls(&self) -> CallCounts {
        self.calls
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Bytes of the image currently being written.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Last successfully finalized image.
    pub fn committed(&self) -> Option<(Region, &[u8])> {
        self.committed
            .as_ref()
            .map(|(region, data)| (*region, data.as_slice()))
    }

    fn fail(&mut self, reason: &str) -> FlashError {
        self.last_error = Some(reason.to_string());
        FlashError::new(reason)
    }
}

impl FlashWriteTarget for MemoryFlashTarget {
    fn capacity(&self, region: Region) -> Option<usize> {
        match region {
            Region::Executable => self.executable_capacity,
            Region::Data => self.data_capacity,
        }
    }

    fn begin(&mut self, capacity: Option<usize>, region: Region) -> Result<(), FlashError> {
        self.calls.begin += 1;

        if self.open.is_some() {
            return Err(self.fail("Update already running"));
        }
        if let Some(reason) = self.begin_failure.clone() {
            return Err(self.fail(&reason));
        }

        let limit = match (capacity, self.capacity(region)) {
            (Some(requested), Some(available)) => Some(requested.min(available)),
            (requested, available) => requested.or(available),
        };
        self.open = Some(OpenImage { region, limit });
        self.buffer.clear();
        self.last_error = None;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.calls.write += 1;

        let Some(open) = self.open else {
            self.last_error = Some("Update not started".to_string());
            return 0;
        };

        let room = open
            .limit
            .map_or(usize::MAX, |limit| limit.saturating_sub(self.buffer.len()));
        let budget = self
            .write_budget
            .map_or(usize::MAX, |budget| budget.saturating_sub(self.buffer.len()));

        let accepted = data.len().min(room).min(budget);
        self.buffer.extend_from_slice(&data[..accepted]);

        if accepted < data.len() && room < data.len() {
            self.last_error = Some("Not enough space".to_string());
        }
        accepted
    }

    fn end(&mut self, _verify: bool) -> Result<(), FlashError> {
        self.calls.end += 1;

        let Some(open) = self.open.take() else {
            return Err(self.fail("Update not started"));
        };
        let image = std::mem::take(&mut self.buffer);

        if let Some(reason) = self.end_failure.clone() {
            return Err(self.fail(&reason));
        }
        if image.is_empty() {
            return Err(self.fail("Nothing written"));
        }

        self.committed = Some((open.region, image));
        Ok(())
    }

    fn abort(&mut self) {
        self.calls.abort += 1;
        self.open = None;
        self.buffer.clear();
    }

    fn last_error_reason(&self) -> Option<String> {
        self.last_error.clone()
    }
}
