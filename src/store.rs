use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::model::Snapshot;
use crate::observability::RECORDS_SKIPPED_TOTAL;

pub const PROVIDERS_FILE: &str = "providers.json";
pub const BOOKINGS_FILE: &str = "bookings.json";

/// Write records to a temp file, fsync, then rename over `path`.
fn write_records<T: Serialize>(path: &Path, records: &[T]) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp_path, path)
}

/// Read a JSON array of records. A missing file is empty; records that do
/// not deserialize are logged and skipped.
fn read_records<T: DeserializeOwned>(path: &Path, kind: &'static str) -> io::Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let doc: serde_json::Value = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let serde_json::Value::Array(items) = doc else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: top-level value is not an array", path.display()),
        ));
    };

    let mut records = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<T>(item) {
            Ok(r) => records.push(r),
            Err(e) => {
                warn!("{}: skipping {kind} #{i}: {e}", path.display());
                metrics::counter!(RECORDS_SKIPPED_TOTAL, "kind" => kind).increment(1);
            }
        }
    }
    Ok(records)
}

pub fn save_snapshot(dir: &Path, snapshot: &Snapshot) -> io::Result<()> {
    write_records(&dir.join(PROVIDERS_FILE), &snapshot.providers)?;
    write_records(&dir.join(BOOKINGS_FILE), &snapshot.bookings)
}

pub fn load_snapshot(dir: &Path) -> io::Result<Snapshot> {
    Ok(Snapshot {
        providers: read_records(&dir.join(PROVIDERS_FILE), "provider")?,
        bookings: read_records(&dir.join(BOOKINGS_FILE), "booking")?,
    })
}
