//! Append-only transition log for debugging the scheduler.
//!
//! One line per transition: `<OP> <pool>/<queue> <feed title>`.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Added at queue head
    AddFront,
    /// Added at queue tail
    AddRear,
    /// Moved from queue to pool
    Move,
    /// Attempt failed, retrying
    Retry,
    Success,
    /// Last attempt failed
    Fail,
}

impl OpCode {
    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::AddFront => "AF",
            OpCode::AddRear => "AR",
            OpCode::Move => "MV",
            OpCode::Retry => "RT",
            OpCode::Success => "SC",
            OpCode::Fail => "FL",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Disabled when no path is configured or the file cannot be created.
#[derive(Debug, Default)]
pub(crate) struct OpLog {
    file: Option<Mutex<File>>,
}

impl OpLog {
    /// Create (truncating) the log file.
    pub fn open(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
        {
            Ok(file) => Self {
                file: Some(Mutex::new(file)),
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to open task log");
                Self::default()
            }
        }
    }

    pub fn record(&self, op: OpCode, pool: usize, queue: usize, title: &str) {
        let Some(file) = &self.file else {
            return;
        };
        let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{op} {pool}/{queue} {title}") {
            tracing::debug!(error = %e, "Failed to write task log");
        }
    }
}
