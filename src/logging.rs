use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Serial logger printing colored, timestamped lines
struct EnhancedLogger;

impl log::Log for EnhancedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let ts_compact = compact_timestamp(uptime());

        // Level, color and module
        let (color, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, 'W'),
            Level::Info => (colors::BRIGHT_GREEN, 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, 'D'),
            Level::Trace => (colors::GRAY, 'T'),
        };
        let module = record
            .module_path()
            .unwrap_or("unknown")
            .split("::")
            .last()
            .unwrap_or("unknown");
        let module_display = if module.len() > 12 { &module[..12] } else { module };

        println!(
            "{}{} [{}] {:>12} | {}{}",
            color,
            ts_compact,
            level_char,
            module_display,
            record.args(),
            colors::RESET
        );
    }

    fn flush(&self) {}
}

static LOGGER: EnhancedLogger = EnhancedLogger;

/// Install the logger. `level` usually comes from the debug toggle.
pub fn init_logger(level: LevelFilter) -> anyhow::Result<()> {
    let _ = BOOT_TIME.set(SystemTime::now());
    log::set_logger(&LOGGER).map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;
    log::set_max_level(level);

    println!("{}┌─────────────────────────────────────────┐{}", colors::BRIGHT_GREEN, colors::RESET);
    println!("{}│        ESP32 Firmware Uploader          │{}", colors::BRIGHT_GREEN, colors::RESET);
    println!(
        "{}│   Levels: {}E{}rror {}W{}arn {}I{}nfo {}D{}ebug {}T{}race   │{}",
        colors::BRIGHT_GREEN,
        colors::BRIGHT_RED,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_YELLOW,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_GREEN,
        colors::BRIGHT_BLUE,
        colors::BRIGHT_GREEN,
        colors::GRAY,
        colors::BRIGHT_GREEN,
        colors::RESET
    );
    println!("{}└─────────────────────────────────────────┘{}", colors::BRIGHT_GREEN, colors::RESET);
    Ok(())
}

/// Time since the logger was installed
pub fn uptime() -> Duration {
    let boot_time = BOOT_TIME.get_or_init(SystemTime::now);
    SystemTime::now().duration_since(*boot_time).unwrap_or_default()
}

/// Change log level at runtime
pub fn set_max_level_runtime(level: LevelFilter) {
    log::set_max_level(level);
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    match parse_level(level) {
        Some(lf) => {
            set_max_level_runtime(lf);
            true
        }
        None => false,
    }
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    let lf = match level.to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return None,
    };
    Some(lf)
}

fn compact_timestamp(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, millis)
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
