//! Leveled file logging for the controller and its orchestrator.
//!
//! Log levels:
//! - ERROR: Handler panics, machine calls that fail outright
//! - WARN: Recoverable conditions (rendezvous timeouts, declined decisions)
//! - INFO: Operation notifications (startup, shutdown, decisions posted)
//! - DEBUG: Enqueue, dispatch and retirement of composite tasks
//! - TRACE: Per-subtask completions and queue idle transitions
//!
//! Debug mode is enabled with `--debug` or `VROBOT_DEBUG=1`. `VROBOT_LOG`
//! names an explicit level and wins over both. Nothing is written until
//! `init` has resolved a log path, and the level is checked before a
//! message is formatted.
//!
//! Lines look like `[12:03:44.120] [DEBUG] [tokio-runtime-worker] message`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

/// Log to ~/.vrobot/vrobot.log at INFO unless the environment says otherwise.
pub fn init() {
    init_with_debug(false);
}

/// Log to ~/.vrobot/vrobot.log, at DEBUG when `debug` or `VROBOT_DEBUG` is set.
pub fn init_with_debug(debug: bool) {
    set_level(resolve_level(
        debug,
        std::env::var("VROBOT_DEBUG").ok().as_deref(),
        std::env::var("VROBOT_LOG").ok().as_deref(),
    ));

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".vrobot")) {
        let _ = std::fs::create_dir_all(&dir);
        init_at(dir.join("vrobot.log"));
    }
}

fn resolve_level(debug: bool, debug_env: Option<&str>, level_env: Option<&str>) -> LogLevel {
    if let Some(level) = level_env.and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = matches!(debug_env, Some(v) if v == "1" || v.eq_ignore_ascii_case("true"));
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Route log output to an explicit file, truncating it.
///
/// Only the first call takes effect.
pub fn init_at(path: PathBuf) {
    if LOG_PATH.get().is_none() {
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

/// Path of the active log file, if logging was initialized.
pub fn path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

pub fn is_debug() -> bool {
    level() >= LogLevel::Debug
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// True if a message at `level` would be written.
pub fn enabled(level: LogLevel) -> bool {
    level <= self::level() && LOG_PATH.get().is_some()
}

/// Append one line at `level`. Prefer the `vlog*` macros.
pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let thread = std::thread::current();
        let _ = writeln!(
            file,
            "[{}] [{}] [{}] {}",
            timestamp,
            level.as_str(),
            thread.name().unwrap_or("unnamed"),
            msg
        );
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __vlog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::log_at($level, &format!($($arg)*))
        }
    };
}

/// INFO.
#[macro_export]
macro_rules! vlog {
    ($($arg:tt)*) => { $crate::__vlog_at!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! vlog_error {
    ($($arg:tt)*) => { $crate::__vlog_at!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! vlog_warn {
    ($($arg:tt)*) => { $crate::__vlog_at!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! vlog_debug {
    ($($arg:tt)*) => { $crate::__vlog_at!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! vlog_trace {
    ($($arg:tt)*) => { $crate::__vlog_at!($crate::log::LogLevel::Trace, $($arg)*) };
}
