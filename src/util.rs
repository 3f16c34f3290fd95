//! Logging and time helpers shared across the server.

use std::fmt::Display;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Verbose,
    Notice,
    Warning,
}

impl LogLevel {
    pub fn from_str(s: &str) -> Option<LogLevel> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "verbose" => Some(LogLevel::Verbose),
            "notice" => Some(LogLevel::Notice),
            "warning" => Some(LogLevel::Warning),
            _ => None,
        }
    }
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ch = match self {
            LogLevel::Debug => '.',
            LogLevel::Verbose => '-',
            LogLevel::Notice => '*',
            LogLevel::Warning => '#',
        };
        write!(f, "{ch}")
    }
}

/// Writes one timestamped log line at `level`, gated by `floor`. Never fails
/// loudly: a broken log file just drops the line to stderr.
pub fn log(floor: LogLevel, level: LogLevel, logfile: &str, body: &str) {
    if level < floor {
        return;
    }

    let writer: Box<dyn Write> = if logfile.is_empty() {
        Box::new(io::stdout())
    } else {
        match OpenOptions::new().create(true).append(true).open(logfile) {
            Ok(f) => Box::new(f),
            Err(e) => {
                eprintln!("Can't open log file '{}': {}", logfile, e);
                return;
            }
        }
    };

    let mut buf_writer = BufWriter::new(writer);
    let line = format!(
        "[{}] {} {}: {}\n",
        std::process::id(),
        now_ms(),
        level,
        body
    );
    if let Err(e) = buf_writer.write_all(line.as_bytes()) {
        eprintln!("Can't write log: {}", e);
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis()
}

pub fn add_ms_to_now(ms: u128) -> u128 {
    now_ms() + ms
}

pub fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

pub fn errno_str(code: i32) -> String {
    unsafe {
        let ptr = libc::strerror(code);
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Notice);
        assert!(LogLevel::Warning > LogLevel::Verbose);
    }

    #[test]
    fn log_level_display() {
        assert_eq!(format!("{}", LogLevel::Debug), ".");
        assert_eq!(format!("{}", LogLevel::Warning), "#");
    }

    #[test]
    fn from_str_roundtrip() {
        assert!(matches!(LogLevel::from_str("notice"), Some(LogLevel::Notice)));
        assert!(LogLevel::from_str("bogus").is_none());
    }
}
