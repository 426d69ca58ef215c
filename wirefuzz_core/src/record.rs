use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

/// Errors raised while keeping or relocating recorded traffic.
#[derive(Error, Debug)]
pub enum RecordError {
    /// Contains a string describing the underlying I/O error.
    #[error("Record I/O error: {0}")]
    Io(String),

    #[error("Record index serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for RecordError {
    fn from(err: std::io::Error) -> Self {
        RecordError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Serialization(err.to_string())
    }
}

/// Which traffic the engine keeps.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RecordPolicy {
    /// Every sent message and every response.
    All,
    /// Only messages that made the target crash.
    #[default]
    Critical,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Sent,
    Received,
}

/// One recorded message.
///
/// The payload lives only in a temporary file owned by the [`Recorder`];
/// `output_path` stays `None` until [`Recorder::persist`] relocates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedRecord {
    pub is_crash: bool,
    pub captured_at_epoch_millis: i64,
    pub direction: Direction,
    /// Zero-based iteration the message belongs to.
    pub iteration: u64,
    len: usize,
    md5: String,
    temp_path: PathBuf,
    output_path: Option<PathBuf>,
}

impl SavedRecord {
    /// MD5 of the payload as lowercase hex.
    pub fn digest(&self) -> &str {
        &self.md5
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the payload back from disk, from the output directory once
    /// persisted and from the spool before that.
    pub fn read_payload(&self) -> Result<Vec<u8>, RecordError> {
        let path = self.output_path().unwrap_or(&self.temp_path);
        fs::read(path)
            .map_err(|e| RecordError::Io(format!("Failed to read record {:?}: {}", path, e)))
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }
}

/// Entry of the JSON index written next to persisted records.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordIndexEntry {
    pub file: String,
    pub iteration: u64,
    pub direction: Direction,
    pub is_crash: bool,
    pub captured_at_epoch_millis: i64,
    pub md5: String,
    pub len: usize,
}

/// Collects records for one fuzzing session in a temporary directory.
#[derive(Debug)]
pub struct Recorder {
    policy: RecordPolicy,
    spool: TempDir,
    records: Vec<SavedRecord>,
}

impl Recorder {
    const INDEX_FILENAME: &'static str = "records_index.json";

    pub fn new(policy: RecordPolicy) -> Result<Self, RecordError> {
        let spool = tempfile::Builder::new().prefix("wirefuzz-").tempdir()?;
        Ok(Self {
            policy,
            spool,
            records: Vec::new(),
        })
    }

    pub fn policy(&self) -> RecordPolicy {
        self.policy
    }

    pub fn records(&self) -> &[SavedRecord] {
        &self.records
    }

    pub fn crash_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_crash).count()
    }

    fn push(
        &mut self,
        iteration: u64,
        direction: Direction,
        payload: &[u8],
        is_crash: bool,
    ) -> Result<(), RecordError> {
        let temp_path = self.spool.path().join(format!("{:08}.bin", self.records.len()));
        fs::write(&temp_path, payload).map_err(|e| {
            RecordError::Io(format!("Failed to spool record to {:?}: {}", temp_path, e))
        })?;
        self.records.push(SavedRecord {
            is_crash,
            captured_at_epoch_millis: chrono::Utc::now().timestamp_millis(),
            direction,
            iteration,
            len: payload.len(),
            md5: format!("{:x}", md5::compute(payload)),
            temp_path,
            output_path: None,
        });
        Ok(())
    }

    /// Records a successful exchange when the policy keeps all traffic.
    pub fn record_exchange(
        &mut self,
        iteration: u64,
        sent: &[u8],
        received: &[u8],
    ) -> Result<(), RecordError> {
        if self.policy != RecordPolicy::All {
            return Ok(());
        }
        self.push(iteration, Direction::Sent, sent, false)?;
        self.push(iteration, Direction::Received, received, false)
    }

    /// Records a crash-triggering message regardless of policy.
    pub fn record_crash(&mut self, iteration: u64, sent: &[u8]) -> Result<(), RecordError> {
        self.push(iteration, Direction::Sent, sent, true)
    }

    /// Moves every record into `output_dir`, assigns output paths and writes
    /// a JSON index. The temporary spool is removed afterwards.
    pub fn persist(self, output_dir: &Path) -> Result<Vec<SavedRecord>, RecordError> {
        fs::create_dir_all(output_dir).map_err(|e| {
            RecordError::Io(format!(
                "Failed to create output directory {:?}: {}",
                output_dir, e
            ))
        })?;

        let mut index = Vec::with_capacity(self.records.len());
        let mut persisted = Vec::with_capacity(self.records.len());
        for mut record in self.records {
            let digest = record.md5.clone();
            let kind = if record.is_crash { "crash" } else { "traffic" };
            let direction = match record.direction {
                Direction::Sent => "sent",
                Direction::Received => "recv",
            };
            let file = format!(
                "{:08}-{}-{}-{}.bin",
                record.iteration, kind, direction, digest
            );
            let target = output_dir.join(&file);
            fs::copy(&record.temp_path, &target).map_err(|e| {
                RecordError::Io(format!(
                    "Failed to move record {:?} to {:?}: {}",
                    record.temp_path, target, e
                ))
            })?;
            index.push(RecordIndexEntry {
                file,
                iteration: record.iteration,
                direction: record.direction,
                is_crash: record.is_crash,
                captured_at_epoch_millis: record.captured_at_epoch_millis,
                md5: digest,
                len: record.len,
            });
            record.output_path = Some(target);
            persisted.push(record);
        }

        let index_path = output_dir.join(Self::INDEX_FILENAME);
        let writer = BufWriter::new(File::create(&index_path)?);
        serde_json::to_writer_pretty(writer, &index)?;
        debug!("Persisted {} records to {:?}", persisted.len(), output_dir);
        Ok(persisted)
    }
}
