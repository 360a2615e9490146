//! Access-log file handling, grounded on `logger.c`. The original keeps a
//! `FILE *` open for the process lifetime and reopens it in place on
//! `SIGHUP` so log rotation (external `logrotate`, not this crate's job per
//! spec §1) doesn't lose the tail of the old file. This port keeps the same
//! shape: an open file behind a lock that gets swapped for a freshly opened
//! one, rather than closed and reopened out from under concurrent writers.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct Logger {
    path: PathBuf,
    file: Mutex<File>,
}

impl Logger {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = open_append(path)?;
        Ok(Logger {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Write one access-log line (spec §6's "stable format"), newline
    /// appended if missing.
    pub fn access(&self, line: &str) {
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if writeln!(file, "{}", line).is_err() {
            log::warn!("failed to write access log line to {}", self.path.display());
        }
    }

    /// Reopen the log file at the same path, matching `logger_reopen`: the
    /// new file descriptor replaces the old one, which lets `logrotate`
    /// move the old file out from under us.
    pub fn reopen(&self) -> io::Result<()> {
        let new_file = open_append(&self.path)?;
        let mut guard = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = new_file;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn access_appends_lines() {
        let dir = std::env::temp_dir().join(format!("sniproxy-logger-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("access.log");
        let logger = Logger::open(&path).unwrap();
        logger.access("line one");
        logger.access("line two");

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "line one\nline two\n");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reopen_picks_up_a_moved_file() {
        let dir = std::env::temp_dir().join(format!("sniproxy-logger-test-reopen-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("access.log");
        let logger = Logger::open(&path).unwrap();
        logger.access("before rotation");

        std::fs::rename(&path, dir.join("access.log.1")).unwrap();
        logger.reopen().unwrap();
        logger.access("after rotation");

        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "after rotation\n");

        std::fs::remove_dir_all(&dir).ok();
    }
}
