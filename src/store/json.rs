// src/store/json.rs

//! One JSON document per execution under a directory.
//!
//! Files are named `<execution name>.json`. Writes go to a temporary file in
//! the same directory and are renamed into place, so a reader never sees a
//! half-written record.
//!
//! `<name>.lock` holds the pid of the process leasing the execution and
//! `<name>.kill` is a pending kill request. A lock whose process is gone is
//! stale and taken over.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{BatchdagError, Result};
use crate::model::{Execution, ExecutionId, ExecutionRecord};
use crate::store::{ExecutionLease, ExecutionStore};

#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        Execution::validate_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    fn side_file(&self, name: &str, ext: &str) -> Result<PathBuf> {
        Execution::validate_name(name)?;
        Ok(self.dir.join(format!("{name}.{ext}")))
    }

    fn read(path: &Path) -> Result<Option<ExecutionRecord>> {
        match fs::read_to_string(path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn all(&self) -> Result<Vec<ExecutionRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read(&path)? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.execution.id);
        Ok(records)
    }
}

/// Pid written in a lock file, if that process is still alive.
fn live_holder(path: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|&pid| process_alive(pid))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Without procfs every recorded holder counts as alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl ExecutionStore for JsonStore {
    fn next_id(&self) -> Result<ExecutionId> {
        Ok(self
            .all()?
            .iter()
            .map(|r| r.execution.id)
            .max()
            .unwrap_or(0)
            + 1)
    }

    fn load_by_name(&self, name: &str) -> Result<Option<ExecutionRecord>> {
        Self::read(&self.path_for(name)?)
    }

    fn load_by_id(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>> {
        Ok(self.all()?.into_iter().find(|r| r.execution.id == id))
    }

    fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let path = self.path_for(&record.execution.name)?;
        let tmp = self
            .dir
            .join(format!(".{}.json.tmp", record.execution.name));

        let body = serde_json::to_vec_pretty(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(execution = %record.execution.name, path = %path.display(), "execution saved");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Execution>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|r| !r.execution.deleted)
            .map(|r| r.execution)
            .collect())
    }

    fn soft_delete(&self, name: &str) -> Result<()> {
        let mut record = self
            .load_by_name(name)?
            .ok_or_else(|| BatchdagError::ExecutionNotFound(name.to_string()))?;
        record.execution.deleted = true;
        self.save(&record)
    }

    fn delete(&self, name: &str) -> Result<()> {
        remove_if_present(&self.path_for(name)?).map(|_| ())
    }

    fn lease(&self, name: &str) -> Result<ExecutionLease> {
        let path = self.side_file(name, "lock")?;
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!(execution = %name, path = %path.display(), "execution leased");
                    let lock = path.clone();
                    return Ok(ExecutionLease::new(name, move || {
                        if let Err(e) = fs::remove_file(&lock) {
                            warn!(path = %lock.display(), error = %e, "could not release execution lease");
                        }
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if let Some(pid) = live_holder(&path)? {
                        return Err(BatchdagError::ExecutionBusy {
                            execution: name.to_string(),
                            pid,
                        });
                    }
                    warn!(execution = %name, path = %path.display(), "taking over stale execution lease");
                    remove_if_present(&path)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(BatchdagError::ExecutionBusy {
            execution: name.to_string(),
            pid: live_holder(&path)?.unwrap_or_default(),
        })
    }

    fn is_leased(&self, name: &str) -> Result<bool> {
        Ok(live_holder(&self.side_file(name, "lock")?)?.is_some())
    }

    fn request_kill(&self, name: &str) -> Result<()> {
        fs::write(self.side_file(name, "kill")?, std::process::id().to_string())?;
        Ok(())
    }

    fn take_kill_request(&self, name: &str) -> Result<bool> {
        remove_if_present(&self.side_file(name, "kill")?)
    }
}
