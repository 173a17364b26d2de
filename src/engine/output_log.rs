use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{EngineError, Result};

const HISTORY_FILE: &str = "history.json";
const HUMAN_TURN_SUFFIX: &str = "\n\n<human>:";

#[derive(Serialize)]
struct HistoryRecord<'a> {
    text: &'a str,
    time: String,
    base_model: &'a str,
}

/// Append-only history of generated outputs under `save_dir`.
#[derive(Debug)]
pub struct OutputLog {
    save_dir: PathBuf,
    lock: Mutex<()>,
}

impl OutputLog {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn history_path(&self) -> PathBuf {
        self.save_dir.join(HISTORY_FILE)
    }

    /// Append one record. Failures are logged and swallowed.
    pub fn persist(&self, output: &str, base_model: &str) {
        if let Err(err) = self.try_persist(output, base_model) {
            error!(error = %err, save_dir = %self.save_dir.display(), "Failed to save generation output");
        }
    }

    pub fn try_persist(&self, output: &str, base_model: &str) -> Result<()> {
        if self.save_dir.exists() && !self.save_dir.is_dir() {
            return Err(EngineError::config(
                "save_dir",
                format!("save_dir already exists and is not a directory: {}", self.save_dir.display()),
            ));
        }
        let text = output.strip_suffix(HUMAN_TURN_SUFFIX).unwrap_or(output);
        let record = HistoryRecord {
            text,
            time: Local::now().format("%a %b %e %H:%M:%S %Y").to_string(),
            base_model,
        };
        let line = format!("  {},\n", serde_json::to_string(&record)?);

        let _guard = self.lock.lock();
        fs::create_dir_all(&self.save_dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())?;
        file.write_all(line.as_bytes())?;
        debug!(path = %self.history_path().display(), bytes = line.len(), "Saved generation output");
        Ok(())
    }
}
