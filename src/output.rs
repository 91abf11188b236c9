//! Relocation sinks - JSONL output for assembled relocations

use crate::relocations::{Relocation, Relocations};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait RelocationSink: Send {
    async fn write_relocation(&mut self, relocation: &Relocation) -> Result<(), OutputError>;

    async fn flush(&mut self) -> Result<(), OutputError>;

    fn backend_type(&self) -> &'static str;

    /// Write every relocation in order and flush; returns the count written
    async fn write_all(&mut self, relocations: &Relocations) -> Result<usize, OutputError> {
        let mut written = 0;
        for relocation in relocations.iter() {
            self.write_relocation(relocation).await?;
            written += 1;
        }
        self.flush().await?;
        Ok(written)
    }
}

/// One JSON object per line, appended to a single file
pub struct JsonlRelocationWriter {
    path: PathBuf,
    writer: BufWriter<std::fs::File>,
    last_flush: Instant,
}

impl JsonlRelocationWriter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, OutputError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        log::info!("📝 Writing relocations to: {}", path.display());

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            last_flush: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, relocation: &Relocation) -> Result<(), OutputError> {
        let json = serde_json::to_string(relocation)?;
        writeln!(self.writer, "{}", json)?;

        if self.last_flush.elapsed() > FLUSH_INTERVAL {
            self.flush_now()?;
        }
        Ok(())
    }

    pub fn flush_now(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        self.last_flush = Instant::now();
        Ok(())
    }
}

impl Drop for JsonlRelocationWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

#[async_trait]
impl RelocationSink for JsonlRelocationWriter {
    async fn write_relocation(&mut self, relocation: &Relocation) -> Result<(), OutputError> {
        self.write(relocation)
    }

    async fn flush(&mut self) -> Result<(), OutputError> {
        self.flush_now()
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}
