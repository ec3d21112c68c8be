//! Engine logger. Records go to stderr and, with the same severity, to
//! syslog(3) under the identity `ll-box` so that crashes inside the cloned
//! children remain visible even when stderr is gone.

use std::env;
use std::io::{stderr, Write};

use anyhow::Result;
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;

static LOGGER: OnceCell<BoxLogger> = OnceCell::new();

const SYSLOG_IDENT: &[u8] = b"ll-box\0";

/// Seed configuration for the logger. The environment only feeds this
/// struct; everything downstream receives the value explicitly.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    pub level: LevelFilter,
}

impl LogConfig {
    /// `LINGLONG_LOG_LEVEL` knows the five levels of the Linglong stack.
    /// Fatal collapses onto Error; anything unknown falls back to Error.
    pub fn from_env() -> Self {
        let level = match env::var("LINGLONG_LOG_LEVEL").as_deref() {
            Ok("Debug") => LevelFilter::Debug,
            Ok("Info") => LevelFilter::Info,
            Ok("Warning") => LevelFilter::Warn,
            _ => LevelFilter::Error,
        };
        Self { level }
    }
}

pub fn init(config: LogConfig) -> Result<()> {
    let logger = LOGGER.get_or_init(|| {
        unsafe {
            libc::openlog(
                SYSLOG_IDENT.as_ptr() as *const libc::c_char,
                libc::LOG_PID,
                libc::LOG_USER,
            );
        }
        BoxLogger {
            level: config.level,
        }
    });
    // set_logger fails when called twice; harmless for our single entry point.
    let _ = log::set_logger(logger).map(|()| log::set_max_level(config.level));
    Ok(())
}

struct BoxLogger {
    level: LevelFilter,
}

fn syslog_priority(level: log::Level) -> libc::c_int {
    match level {
        log::Level::Error => libc::LOG_ERR,
        log::Level::Warn => libc::LOG_WARNING,
        log::Level::Info => libc::LOG_INFO,
        log::Level::Debug | log::Level::Trace => libc::LOG_DEBUG,
    }
}

impl Log for BoxLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let msg = match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!(
                "[{} {}:{}] {} {}",
                record.level(),
                file,
                line,
                chrono::Local::now().to_rfc3339(),
                record.args()
            ),
            (_, _) => format!(
                "[{}] {} {}",
                record.level(),
                chrono::Local::now().to_rfc3339(),
                record.args()
            ),
        };

        let _ = writeln!(stderr(), "{}", msg);

        if let Ok(c_msg) = std::ffi::CString::new(msg) {
            unsafe {
                libc::syslog(
                    syslog_priority(record.level()),
                    b"%s\0".as_ptr() as *const libc::c_char,
                    c_msg.as_ptr(),
                );
            }
        }
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}
