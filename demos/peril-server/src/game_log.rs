//! Appends received game logs to a file.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;

use warren::Verdict;

use crate::routing::GameLog;

pub struct LogWriter {
    path: PathBuf,
}

impl LogWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Writes one entry. A write failure requeues the message so another
    /// server instance, or a later attempt, can record it.
    pub fn handle(&self, log: &GameLog) -> Verdict {
        match self.write(log) {
            Ok(()) => {
                tracing::debug!(username = %log.username, "game log written");
                Verdict::Accept
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to write game log"
                );
                Verdict::RejectRequeue
            }
        }
    }

    fn write(&self, log: &GameLog) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {}: {}", log.current_time, log.username, log.message)
    }
}
