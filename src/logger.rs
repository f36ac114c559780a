//! Process-global logging backend for the `log` facade.
//!
//! Writes to stderr by default or to a log file, one line per record with a
//! UTC timestamp. [`rotate`] reopens the file in place; the supervisor calls
//! it on SIGHUP so an external rotator can move the old file out of the way
//! first.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use log::{Level, LevelFilter, Log, Metadata, Record};
use time::macros::format_description;
use time::OffsetDateTime;

enum Output {
    Stderr,
    File { path: PathBuf, file: File },
}

struct ProcLogger {
    out: Mutex<Output>,
}

static LOGGER: OnceLock<ProcLogger> = OnceLock::new();

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Maps the command line's numeric level to the facade's filter:
/// 0=error, 1=warn, 2=info, 3=debug, 4 and up=trace.
pub fn level_from_cli(n: u32) -> LevelFilter {
    match n {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs (or re-targets) the process logger. Safe to call more than once;
/// later calls replace the level and output of the running logger.
pub fn init(level: LevelFilter, file: Option<&Path>) -> io::Result<()> {
    let out = match file {
        Some(path) => Output::File {
            file: open_log_file(path)?,
            path: path.to_path_buf(),
        },
        None => Output::Stderr,
    };

    let logger = LOGGER.get_or_init(|| ProcLogger {
        out: Mutex::new(Output::Stderr),
    });
    *logger.out.lock().unwrap() = out;

    // Fails only if some other backend was installed first, which would be a
    // wiring bug in the embedding binary.
    let _ = log::set_logger(logger);
    log::set_max_level(level);
    Ok(())
}

/// Reopens the log file, if logging to one. Called on SIGHUP.
pub fn rotate() {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    let mut out = logger.out.lock().unwrap();
    if let Output::File { path, file } = &mut *out {
        match open_log_file(path) {
            Ok(f) => *file = f,
            Err(e) => eprintln!("failed to reopen log file {}: {}", path.display(), e),
        }
    }
}

fn format_line(record: &Record<'_>) -> String {
    let fmt = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    );
    let now = OffsetDateTime::now_utc();
    let stamp = now.format(&fmt).unwrap_or_default();
    let level = match record.level() {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    };
    format!("[{}] {} {}\n", level, stamp, record.args())
}

impl Log for ProcLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record);
        let mut out = self.out.lock().unwrap();
        let _ = match &mut *out {
            Output::Stderr => io::stderr().write_all(line.as_bytes()),
            Output::File { file, .. } => file.write_all(line.as_bytes()),
        };
    }

    fn flush(&self) {
        let mut out = self.out.lock().unwrap();
        let _ = match &mut *out {
            Output::Stderr => io::stderr().flush(),
            Output::File { file, .. } => file.flush(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_level_mapping() {
        assert_eq!(level_from_cli(0), LevelFilter::Error);
        assert_eq!(level_from_cli(2), LevelFilter::Info);
        assert_eq!(level_from_cli(3), LevelFilter::Debug);
        assert_eq!(level_from_cli(9), LevelFilter::Trace);
    }

    #[test]
    fn log_lines_land_in_file_and_survive_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relayd.log");

        init(LevelFilter::Info, Some(&path)).unwrap();
        log::info!("first line");
        log::logger().flush();
        rotate();
        log::info!("after rotate");
        log::logger().flush();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("first line"));
        assert!(text.contains("after rotate"));
        assert!(text.contains("[INFO]"));
    }
}
