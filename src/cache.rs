//! The hash → work-directory cache index.
//!
//! Successful firings append a JSON record to
//! `<work>/.weir/cache/<workflow>.idx`; a resumed session loads the file at
//! start and answers lookups from memory. Rehydration itself (re-reading
//! exit codes, matching declared outputs) happens in the processor, which
//! knows the output declarations.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    pub hash: String,
    pub work_dir: PathBuf,
    pub exit_status: i32,
}

pub struct CacheIndex {
    path: PathBuf,
    resume: bool,
    entries: Mutex<HashMap<String, CacheRecord>>,
}

impl CacheIndex {
    /// Open the index for a workflow. Prior records are loaded only when
    /// resuming; recording happens either way so the next run can resume.
    pub fn open(session_work_dir: &Path, workflow_id: &str, resume: bool) -> io::Result<Self> {
        let dir = session_work_dir.join(".weir").join("cache");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{workflow_id}.idx"));

        let mut entries = HashMap::new();
        if resume && path.exists() {
            for line in fs::read_to_string(&path)?.lines() {
                match serde_json::from_str::<CacheRecord>(line) {
                    Ok(record) => {
                        entries.insert(record.hash.clone(), record);
                    }
                    Err(err) => warn!(%err, "skipping corrupt cache record"),
                }
            }
            debug!(entries = entries.len(), path = %path.display(), "loaded cache index");
        }
        Ok(Self {
            path,
            resume,
            entries: Mutex::new(entries),
        })
    }

    /// A hit requires resume mode; the processor still validates the
    /// recorded directory before honoring it.
    pub fn lookup(&self, hash: &str) -> Option<CacheRecord> {
        if !self.resume {
            return None;
        }
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .get(hash)
            .cloned()
    }

    pub fn record(&self, record: CacheRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "cache record serialization failed");
                return;
            }
        };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = result {
            warn!(%err, path = %self.path.display(), "cache record write failed");
        }
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .insert(record.hash.clone(), record);
    }
}
