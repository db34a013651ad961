use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::scanner::ScannedItem;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to open report {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Stamped<'a, T: Serialize> {
    timestamp: String,
    #[serde(flatten)]
    record: &'a T,
}

/// JSON-lines writer; one object per line, each stamped with the write time.
pub struct ReportSink {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl ReportSink {
    /// Starts a fresh report, replacing any existing file.
    pub fn create(path: &Path) -> Result<Self, ReportError> {
        Self::open(path, OpenOptions::new().create(true).write(true).truncate(true))
    }

    /// Appends to an existing report, creating it if needed.
    pub fn append_to(path: &Path) -> Result<Self, ReportError> {
        Self::open(path, OpenOptions::new().create(true).append(true))
    }

    fn open(path: &Path, options: &OpenOptions) -> Result<Self, ReportError> {
        let file = options.open(path).map_err(|source| ReportError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), ReportError> {
        let stamped = Stamped {
            timestamp: Utc::now().to_rfc3339(),
            record,
        };
        writeln!(self.out, "{}", serde_json::to_string(&stamped)?)?;
        self.written += 1;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn finish(mut self) -> Result<usize, ReportError> {
        self.out.flush()?;
        Ok(self.written)
    }
}

pub fn write_inventory(path: &Path, items: &[ScannedItem]) -> Result<usize, ReportError> {
    let mut sink = ReportSink::create(path)?;
    for item in items {
        sink.append(item)?;
    }
    sink.finish()
}

/// Reads an inventory written by [`write_inventory`]. Malformed lines are
/// skipped with a warning.
pub fn read_inventory(path: &Path) -> Result<Vec<ScannedItem>, ReportError> {
    let file = File::open(path).map_err(|source| ReportError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let mut items = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ScannedItem>(&line) {
            Ok(item) => items.push(item),
            Err(err) => tracing::warn!("Skipping malformed inventory line {}: {}", i + 1, err),
        }
    }
    Ok(items)
}

/// Hex BLAKE3 digest of a file's contents.
pub fn digest_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(File::open(path)?)?;
    Ok(hasher.finalize().to_hex().to_string())
}
