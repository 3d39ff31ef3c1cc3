use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Mutex, PoisonError},
};

use crate::{
    Result, SpineStats,
    monitoring::{DispatchRecord, Monitor},
};

/// A monitor that writes every dispatch record as a JSON object on its own
/// line (JSON Lines).
pub struct Recorder<W: Write + Send> {
    writer: Mutex<W>,
}

impl Recorder<BufWriter<File>> {
    /// Create a recorder writing to the file at `path`, truncating it.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(BufWriter::new(file)))
    }
}

impl<W: Write + Send> Recorder<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_line(&self, record: &DispatchRecord) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

impl<W: Write + Send> Monitor for Recorder<W> {
    fn on_record(&self, record: &DispatchRecord) {
        if let Err(e) = self.write_line(record) {
            tracing::warn!(event_id = %record.event_id, error = %e, "recorder failed to write record");
        }
    }

    fn on_run_end(&self, _stats: &SpineStats) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.flush() {
            tracing::warn!(error = %e, "recorder failed to flush");
        }
    }
}
