//! Lazy snapshot reader
//!
//! The CSV is decoded on a blocking thread and handed to the async side one
//! row at a time through a bounded channel, so memory stays flat no matter
//! how large the snapshot is and a slow consumer applies back-pressure.

use csv::{ByteRecord, ReaderBuilder, StringRecord};
use std::fs::File;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::{IngestError, IngestResult};
use super::validation::RowLayout;

/// Rows buffered between the decoding thread and the processor
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// One data row in file order
#[derive(Debug, Clone)]
pub struct SourceRow {
    /// 1-based index among data rows
    pub position: u64,
    /// Natural key as written; may be empty for broken rows
    pub key: String,
    /// Decoded fields, or why the row could not be decoded
    pub fields: Result<StringRecord, String>,
}

/// Handle to a running row stream
pub struct RecordStream {
    layout: RowLayout,
    rx: mpsc::Receiver<IngestResult<SourceRow>>,
}

impl RecordStream {
    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    /// Next row, an error that ends the stream, or `None` at end of file
    pub async fn next(&mut self) -> Option<IngestResult<SourceRow>> {
        self.rx.recv().await
    }
}

/// Open `path`, resolve its header and start streaming rows
pub async fn open(path: &Path, capacity: usize) -> IngestResult<RecordStream> {
    let owned = path.to_path_buf();
    let (reader, layout) = tokio::task::spawn_blocking(move || open_reader(&owned))
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;

    let (tx, rx) = mpsc::channel(capacity.max(1));
    let pump_layout = layout.clone();
    let source = path.to_path_buf();
    tokio::task::spawn_blocking(move || pump(reader, pump_layout, tx, source));

    Ok(RecordStream { layout, rx })
}

fn open_reader(path: &Path) -> IngestResult<(csv::Reader<File>, RowLayout)> {
    let file = File::open(path)?;
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    let header = reader
        .headers()
        .map_err(|e| IngestError::FileCorruption(format!("unreadable header: {}", e)))?
        .clone();

    let layout = RowLayout::from_header(&header).map_err(|missing| {
        IngestError::FileCorruption(format!(
            "header is missing required columns: {}",
            missing.join(", ")
        ))
    })?;

    debug!(path = %path.display(), columns = header.len(), "Opened snapshot");
    Ok((reader, layout))
}

fn pump(
    mut reader: csv::Reader<File>,
    layout: RowLayout,
    tx: mpsc::Sender<IngestResult<SourceRow>>,
    path: PathBuf,
) {
    let mut raw = ByteRecord::new();
    let mut position = 0u64;

    loop {
        match reader.read_byte_record(&mut raw) {
            Ok(true) => {
                position += 1;
                let row = decode_row(&layout, &raw, position);
                if tx.blocking_send(Ok(row)).is_err() {
                    debug!(path = %path.display(), position, "Row consumer went away");
                    return;
                }
            },
            Ok(false) => return,
            Err(e) => {
                warn!(path = %path.display(), position, error = %e, "Snapshot read failed");
                let _ = tx.blocking_send(Err(IngestError::FileCorruption(format!(
                    "read failed after row {}: {}",
                    position, e
                ))));
                return;
            },
        }
    }
}

fn decode_row(layout: &RowLayout, raw: &ByteRecord, position: u64) -> SourceRow {
    match StringRecord::from_byte_record(raw.clone()) {
        Ok(fields) => SourceRow {
            position,
            key: layout.key(&fields).to_string(),
            fields: Ok(fields),
        },
        Err(e) => {
            // Salvage the key so the row can still anchor a checkpoint
            let lossy: StringRecord = raw.iter().map(|f| String::from_utf8_lossy(f)).collect();
            let key = layout.key(&lossy);
            let key = if key.contains('\u{fffd}') { String::new() } else { key.to_string() };
            SourceRow {
                position,
                key,
                fields: Err(format!("invalid UTF-8: {}", e)),
            }
        },
    }
}
