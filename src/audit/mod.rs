//! Audit logging: one daily file, one line per mutating operation.
//!
//! File name is `YYYYMMDD` under the configured directory; each line is
//! `HH:MM:SS.mmm|user|operation|key=val;…`. An empty directory disables
//! auditing. The writer is mutex-guarded and reopened when the date rolls
//! over.

use chrono::{Local, NaiveDate};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

struct AuditInner {
    current_date: Option<NaiveDate>,
    file: Option<File>,
}

pub struct AuditLog {
    dir: Option<PathBuf>,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    /// `directory` empty disables auditing entirely.
    pub fn new(directory: &str) -> Self {
        let dir = if directory.is_empty() {
            None
        } else {
            let path = PathBuf::from(directory);
            if let Err(err) = std::fs::create_dir_all(&path) {
                warn!("cannot create audit directory {}: {}", path.display(), err);
            }
            Some(path)
        };
        Self {
            dir,
            inner: Mutex::new(AuditInner {
                current_date: None,
                file: None,
            }),
        }
    }

    /// Append one entry; failures are logged and swallowed so auditing never
    /// fails the mutation it records.
    pub fn write_entry(&self, user: &str, operation: &str, data: &str) {
        let Some(dir) = &self.dir else {
            return;
        };
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let now = Local::now();
        let today = now.date_naive();
        if inner.current_date != Some(today) || inner.file.is_none() {
            let path = dir.join(now.format("%Y%m%d").to_string());
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    inner.file = Some(file);
                    inner.current_date = Some(today);
                }
                Err(err) => {
                    warn!("cannot open audit file {}: {}", path.display(), err);
                    return;
                }
            }
        }
        if let Some(file) = inner.file.as_mut() {
            let line = format!("{}|{}|{}|{}\n", now.format("%H:%M:%S%.3f"), user, operation, data);
            if let Err(err) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                warn!("audit write failed: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_pipe_separated_lines() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::new(dir.path().to_str().unwrap());
        audit.write_entry("mark", "AddResource", "toolId=git;URL=/r1");
        audit.write_entry("mark", "LinkResources", "fromURL=/r1;toURL=/r2");

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let body = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("|mark|AddResource|toolId=git;URL=/r1"));
    }

    #[test]
    fn empty_directory_disables_auditing() {
        let audit = AuditLog::new("");
        audit.write_entry("mark", "AddResource", "x=y");
    }
}
