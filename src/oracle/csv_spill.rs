//! CSV spillover: when a batch exhausts its commit retries, its entries are
//! written to a dated CSV file per destination instead of being lost
//! outright. UTF-8 with BOM, one header row, lowercase column names matching
//! the destination table, ISO-8601-microsecond timestamps (spec §6).

use crate::sample::{BufferEntry, Destination};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SpillError {
    #[error("failed to create backup directory {0:?}: {1}")]
    CreateDir(PathBuf, std::io::Error),
    #[error("failed to write CSV spill file {0:?}: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("failed to serialize CSV row: {0}")]
    Csv(#[from] csv::Error),
}

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

fn file_stub(destination: Destination) -> &'static str {
    match destination {
        Destination::DatatagLog => "xscada_datatag_log",
        Destination::Operation => "xscada_operation",
    }
}

fn header(destination: Destination) -> &'static [&'static str] {
    match destination {
        Destination::DatatagLog => &[
            "ctime",
            "otime",
            "datatag_name",
            "datatag_type",
            "value_str",
            "value_num",
            "value_raw",
        ],
        Destination::Operation => &["time", "name", "value"],
    }
}

fn row_for(destination: Destination, entry: &BufferEntry) -> Vec<String> {
    let otime = entry.sample.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
    match destination {
        Destination::DatatagLog => {
            let ctime = entry.enqueued_at.format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
            vec![
                ctime,
                otime,
                entry.sample.tag_name.clone(),
                entry.sample.kind.datatag_type().to_string(),
                entry.sample.raw_value.as_string(),
                entry.sample.scaled_value.to_string(),
                entry.sample.raw_value.as_string(),
            ]
        }
        Destination::Operation => {
            vec![otime, entry.sample.tag_name.clone(), entry.sample.scaled_value.to_string()]
        }
    }
}

/// Write one destination's worth of a failed batch to a freshly named CSV
/// file under `backup_dir`. `n` disambiguates multiple spills in the same
/// wall-clock second (spec filename pattern: `..._YYYYMMDD_HHMMSS_{n}.csv`).
pub async fn spill_to_csv(
    backup_dir: &Path,
    destination: Destination,
    entries: &[BufferEntry],
    spill_time: chrono::DateTime<chrono::Utc>,
    n: u32,
) -> Result<PathBuf, SpillError> {
    tokio::fs::create_dir_all(backup_dir)
        .await
        .map_err(|e| SpillError::CreateDir(backup_dir.to_path_buf(), e))?;

    let file_name = format!(
        "{}_{}_{n}.csv",
        file_stub(destination),
        spill_time.format("%Y%m%d_%H%M%S"),
    );
    let path = backup_dir.join(file_name);

    let mut bytes = Vec::with_capacity(UTF8_BOM.len() + entries.len() * 96);
    bytes.extend_from_slice(UTF8_BOM);
    {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(&mut bytes);
        writer.write_record(header(destination))?;
        for entry in entries {
            writer.write_record(row_for(destination, entry))?;
        }
        writer.flush().map_err(|e| SpillError::Write(path.clone(), e.into()))?;
    }

    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| SpillError::Write(path.clone(), e))?;

    info!(path = %path.display(), rows = entries.len(), "spilled batch to CSV");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mc3e::{DeviceAddress, DeviceCode};
    use crate::sample::{Quality, RawValue, Sample};
    use crate::sample::TagKind;
    use chrono::TimeZone;

    fn entry() -> BufferEntry {
        let sample = Sample::new(
            "PLC01",
            DeviceAddress::new(DeviceCode::D, 100),
            "EQUIP0000000001",
            TagKind::WordHost,
            RawValue::Word(42),
            1.0,
            Quality::Good,
        );
        BufferEntry::new(sample)
    }

    #[tokio::test]
    async fn spill_writes_bom_header_and_one_row_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ts = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let entries = vec![entry(), entry()];
        let path = spill_to_csv(dir.path(), Destination::DatatagLog, &entries, ts, 1)
            .await
            .unwrap();

        let bytes = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&bytes[..3], UTF8_BOM);
        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "ctime,otime,datatag_name,datatag_type,value_str,value_num,value_raw");
        assert_eq!(lines.count(), 2);
    }

    #[tokio::test]
    async fn operation_destination_uses_its_own_header() {
        let dir = tempfile::tempdir().unwrap();
        let ts = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let path = spill_to_csv(dir.path(), Destination::Operation, &[entry()], ts, 1)
            .await
            .unwrap();
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.contains("time,name,value"));
    }

    #[tokio::test]
    async fn filename_matches_spec_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let ts = chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 45).unwrap();
        let path = spill_to_csv(dir.path(), Destination::DatatagLog, &[entry()], ts, 3)
            .await
            .unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "xscada_datatag_log_20240601_123045_3.csv");
    }
}
