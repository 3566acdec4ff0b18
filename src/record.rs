//! Batches relayed messages into timestamped text files while recording is on.

use crate::protocol::Message;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct RecordBuffer {
    entries: Vec<String>,
    recording: bool,
    // bumped on every `start` so an in-flight batch never drains a cleared buffer
    generation: u64,
    sequence: u64,
}

pub struct RecordWriter {
    dir: PathBuf,
    record_size: usize,
    buffer: Mutex<RecordBuffer>,
    // held from snapshot to drain so concurrent flushes never copy the same prefix
    flush: Mutex<()>,
    pending: Notify,
}

impl RecordWriter {
    pub fn new(dir: impl Into<PathBuf>, record_size: usize) -> Self {
        Self {
            dir: dir.into(),
            record_size: record_size.max(1),
            buffer: Mutex::new(RecordBuffer::default()),
            flush: Mutex::new(()),
            pending: Notify::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    fn lock(&self) -> MutexGuard<'_, RecordBuffer> {
        // a panicked writer leaves plain strings behind; keep using them
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clears the buffer and begins recording.
    pub fn start(&self) {
        let mut buffer = self.lock();
        buffer.entries.clear();
        buffer.recording = true;
        buffer.generation += 1;
        tracing::info!(dir = %self.dir.display(), "Recording started");
    }

    /// Stops recording and writes whatever is still buffered. Returns the number of files written.
    pub fn stop(&self) -> usize {
        self.lock().recording = false;
        let files = self.flush_all();
        tracing::info!(files, "Recording stopped");
        files
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording
    }

    pub fn pending(&self) -> usize {
        self.lock().entries.len()
    }

    /// Buffers one message if recording. Returns whether it was buffered.
    pub fn append(&self, message: &Message) -> bool {
        self.append_line(format_record(message))
    }

    pub fn append_line(&self, line: String) -> bool {
        let mut buffer = self.lock();
        if !buffer.recording {
            return false;
        }
        buffer.entries.push(line);
        if buffer.entries.len() > self.record_size {
            self.pending.notify_one();
        }
        true
    }

    /// Writes full batches while the buffer holds more than `record_size` entries.
    pub fn flush_full(&self) -> usize {
        let mut files = 0;
        while self.write_batch(self.record_size) {
            files += 1;
        }
        files
    }

    /// Writes everything buffered, in batches of at most `record_size`.
    pub fn flush_all(&self) -> usize {
        let mut files = 0;
        while self.write_batch(0) {
            files += 1;
        }
        files
    }

    /// Writes the oldest batch to a new file if more than `threshold` entries are buffered,
    /// and drops exactly those entries on success.
    fn write_batch(&self, threshold: usize) -> bool {
        let _flush = self.flush.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let (batch, generation, sequence) = {
            let mut buffer = self.lock();
            if buffer.entries.len() <= threshold {
                return false;
            }
            let count = buffer.entries.len().min(self.record_size);
            buffer.sequence += 1;
            (buffer.entries[..count].to_vec(), buffer.generation, buffer.sequence)
        };

        let path = self.dir.join(record_file_name(sequence));
        if let Err(e) = write_lines(&path, &batch) {
            tracing::error!(path = %path.display(), error = %e, "Failed to write record file");
            return false;
        }
        tracing::debug!(path = %path.display(), entries = batch.len(), "Wrote record file");

        let mut buffer = self.lock();
        if buffer.generation == generation {
            let count = batch.len().min(buffer.entries.len());
            buffer.entries.drain(..count);
        }
        true
    }

    /// Background task that writes full batches as soon as the buffer overflows.
    pub fn spawn_writer_task(self: &Arc<Self>) -> JoinHandle<()> {
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                writer.pending.notified().await;
                let batch_writer = Arc::clone(&writer);
                match tokio::task::spawn_blocking(move || batch_writer.flush_full()).await {
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Record writer task failed");
                    }
                }
            }
        })
    }
}

/// `sync_<yyyyMMdd_hhmmss>_<seq>.txt` in local time.
pub fn record_file_name(sequence: u64) -> String {
    format!(
        "sync_{}_{}.txt",
        chrono::Local::now().format("%Y%m%d_%H%M%S"),
        sequence
    )
}

/// `client|tick|kind|object|parameter|type|payload-hex`
pub fn format_record(message: &Message) -> String {
    let mut line = format!(
        "{}|{}|{}|{}|{}|{}|",
        message.client_id,
        message.tick,
        message.kind as u8,
        message.object_id,
        message.parameter_id,
        message.parameter_type as u8
    );
    line.extend(message.payload.iter().map(|byte| format!("{:02x}", byte)));
    line
}

fn write_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for line in lines {
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
    }
    out.flush()
}
