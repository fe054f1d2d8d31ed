//! File-backed logger for use inside a host process whose stdout is not
//! ours to write to.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{LevelFilter, Log, Metadata, Record};

/// `log::Log` implementation appending to a file.
///
/// The file is opened on first use and every I/O failure is swallowed:
/// logging must never take the host process down.
struct FileLogger {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileLogger {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    fn write_line(&self, record: &Record) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .ok();
        }
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(
                file,
                "[{:<5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.write_line(record);
        }
    }

    fn flush(&self) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(file) = guard.as_mut() {
            let _ = file.flush();
        }
    }
}

/// Install a file logger as the global `log` sink.
///
/// Fails only when another logger is already installed.
pub fn init_file_logger(
    path: impl AsRef<Path>,
    level: LevelFilter,
) -> std::result::Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(FileLogger::new(path.as_ref().to_path_buf())))?;
    log::set_max_level(level);
    Ok(())
}

/// Install the file logger from `GANTRY_LOG` (log file path), doing nothing
/// when the variable is unset or a logger already exists. Setting
/// `GANTRY_HOOK_DEBUG` to anything but `0` raises the level to trace, which
/// makes the patcher and arena `trace!` output visible.
pub fn init_from_env() {
    let Ok(path) = std::env::var("GANTRY_LOG") else {
        return;
    };
    let verbose = debug_requested(std::env::var_os("GANTRY_HOOK_DEBUG"));
    let _ = init_file_logger(path, env_level(verbose));
}

fn debug_requested(var: Option<std::ffi::OsString>) -> bool {
    var.is_some_and(|v| v != "0")
}

fn env_level(verbose: bool) -> LevelFilter {
    if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record<'a>(args: std::fmt::Arguments<'a>) -> Record<'a> {
        Record::builder()
            .args(args)
            .level(log::Level::Info)
            .target("diag_test")
            .build()
    }

    #[test]
    fn writes_formatted_lines() {
        let path = std::env::temp_dir().join("gantry_diag_test.log");
        std::fs::remove_file(&path).ok();

        let logger = FileLogger::new(path.clone());
        log::set_max_level(LevelFilter::Info);
        logger.write_line(&make_record(format_args!("hook installed at {:#x}", 0x1000)));
        logger.flush();

        let contents = std::fs::read_to_string(&path).expect("log file");
        assert!(contents.contains("[INFO ] diag_test: hook installed at 0x1000"));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn hook_debug_env_selects_trace() {
        assert!(!debug_requested(None));
        assert!(!debug_requested(Some("0".into())));
        assert!(debug_requested(Some("1".into())));
        assert!(debug_requested(Some("yes".into())));
        assert_eq!(env_level(false), LevelFilter::Info);
        assert_eq!(env_level(true), LevelFilter::Trace);
    }

    #[test]
    fn unwritable_path_is_swallowed() {
        let logger = FileLogger::new(PathBuf::from("/nonexistent-dir/gantry.log"));
        // Must not panic.
        logger.write_line(&make_record(format_args!("dropped")));
        logger.flush();
    }
}
