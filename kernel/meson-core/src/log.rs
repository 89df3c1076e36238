//! Kernel logging.
//!
//! Provides [`kprint!`] / [`kprintln!`] for raw output and leveled macros
//! (`kerror!`, `kwarn!`, `kinfo!`, `kdebug!`, `ktrace!`) over a swappable
//! sink. Before a sink is registered, output is silently discarded, so early
//! code may log unconditionally.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Kernel log severity level. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Something failed; the system may or may not continue.
    Error = 0,
    /// Unexpected condition, not necessarily an error.
    Warn = 1,
    /// High-level progress messages.
    Info = 2,
    /// Detailed diagnostic information.
    Debug = 3,
    /// Very verbose, low-level tracing.
    Trace = 4,
}

impl LogLevel {
    /// Returns the fixed-width human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

/// The signature of the global log sink.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());

/// Registers the global log sink.
///
/// May be called more than once (e.g., once for an early console, once for
/// the full logger). `Release` ordering gates subsequent loads.
pub fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `LogFn` pointers (or the initial `null_log`) are
    // ever stored into LOG_FN.
    unsafe { core::mem::transmute(ptr) }
}

/// Implementation detail for the logging macros. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    load_log_fn()(level, args);
}

/// Prints raw text to the registered sink (reported at `Info`).
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Prints raw text with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => { $crate::kprint!("\n") };
    ($($arg:tt)*) => { $crate::kprint!("{}\n", format_args!($($arg)*)) };
}

/// Logs a message at the given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}
