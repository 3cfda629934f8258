//! Pre-mutation backups
//!
//! Before a task changes the restrictions of a package, the current state is
//! recorded so that the run can be undone later by feeding the backup file
//! back in as an input (see restore mode of [`crate::apply`]).
//!
//! Workers hand records to a [`BackupRecorder`] through a bounded channel.
//! A single named writer thread owns the file: it writes the header once,
//! appends one row per record and flushes after every row. No other thread
//! touches the file, so rows never interleave.
//!
//! [`BackupRecorder::finish`] closes the channel, waits for the writer to
//! drain every queued record and reports how many rows were written.
//! Dropping a recorder without calling `finish` performs the same drain.

use crate::error::{OriginError, Result};
use crate::identity::ContentIdentity;
use crate::types::{PackageKey, PackageRecord, Restrictions, CSV_HEADER};
use crossbeam_channel::{bounded, Sender};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Default number of records that may wait in the queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Backup file belonging to an input: `<backups_home>/<hash>.csv`
pub fn backup_path_for(backups_home: &Path, identity: &ContentIdentity) -> PathBuf {
    backups_home.join(format!("{}.csv", identity.as_str()))
}

/// Asynchronous, single-writer backup of restriction state
#[derive(Debug)]
pub struct BackupRecorder {
    path: PathBuf,
    sender: Option<Sender<PackageRecord>>,
    writer: Option<JoinHandle<Result<u64>>>,
}

impl BackupRecorder {
    /// Create (or truncate) the backup file and start the writer thread
    pub fn start(path: &Path) -> Result<Self> {
        Self::with_capacity(path, DEFAULT_QUEUE_CAPACITY)
    }

    /// Same as [`BackupRecorder::start`] with an explicit queue capacity
    ///
    /// Producers block in [`BackupRecorder::record`] while the queue is full.
    pub fn with_capacity(path: &Path, capacity: usize) -> Result<Self> {
        Self::open(path, capacity, false)
    }

    /// Keep the rows of an existing backup and append new ones
    ///
    /// Used when resuming a run, so that the state captured before earlier
    /// mutations is not lost. The header is only written if the file is new
    /// or empty.
    pub fn append(path: &Path, capacity: usize) -> Result<Self> {
        Self::open(path, capacity, true)
    }

    fn open(path: &Path, capacity: usize, append: bool) -> Result<Self> {
        if capacity == 0 {
            return Err(OriginError::InvalidConfiguration(
                "backup queue capacity must be at least 1".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    OriginError::backup(format!("cannot create {:?}: {}", parent, e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(|e| OriginError::backup(format!("cannot open {:?}: {}", path, e)))?;
        let existing = file
            .metadata()
            .map_err(|e| OriginError::backup(format!("cannot stat {:?}: {}", path, e)))?
            .len();

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if existing == 0 {
            writer
                .write_record(CSV_HEADER)
                .map_err(|e| OriginError::backup(format!("cannot write header: {}", e)))?;
            writer
                .flush()
                .map_err(|e| OriginError::backup(format!("cannot flush header: {}", e)))?;
        } else {
            debug!("Appending to existing backup {:?} ({} bytes)", path, existing);
        }

        let (sender, receiver) = bounded::<PackageRecord>(capacity);
        let handle = thread::Builder::new()
            .name("backup-writer".to_string())
            .spawn(move || -> Result<u64> {
                let mut written = 0u64;
                for record in receiver {
                    writer
                        .serialize(&record)
                        .map_err(|e| OriginError::backup(format!("cannot write row: {}", e)))?;
                    writer
                        .flush()
                        .map_err(|e| OriginError::backup(format!("cannot flush: {}", e)))?;
                    written += 1;
                }
                Ok(written)
            })
            .map_err(|e| OriginError::backup(format!("cannot spawn writer thread: {}", e)))?;

        info!("Backing up current restrictions to {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            sender: Some(sender),
            writer: Some(handle),
        })
    }

    /// Queue the restrictions a package had before it is mutated
    ///
    /// Returns as soon as the record is queued. Fails with
    /// [`OriginError::Backup`] once the writer has stopped.
    pub fn record(&self, key: &PackageKey, before: Restrictions) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| OriginError::backup("recorder already finished"))?;
        sender
            .send(PackageRecord::new(key.clone(), before))
            .map_err(|_| OriginError::backup("backup writer stopped"))?;
        debug!("Queued backup for {}", key);
        Ok(())
    }

    /// Backup file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting records, drain the queue and join the writer
    ///
    /// Returns the number of data rows written.
    pub fn finish(mut self) -> Result<u64> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64> {
        // Closing the sender ends the writer loop once the queue is empty
        self.sender.take();
        match self.writer.take() {
            Some(handle) => {
                let written = handle
                    .join()
                    .map_err(|_| OriginError::backup("backup writer panicked"))??;
                info!("Backup complete: {} records in {:?}", written, self.path);
                Ok(written)
            }
            None => Ok(0),
        }
    }
}

impl Drop for BackupRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Backup to {:?} did not complete: {}", self.path, e);
        }
    }
}
