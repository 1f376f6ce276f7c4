//! CSV and JSON output helpers shared by the alert sink and tick statistics.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// Logs any serializable record as pretty-printed JSON.
pub fn print_json(record: &impl Serialize) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(record)?);
    Ok(())
}

/// Appends a record as a row to a CSV file.
///
/// Creates the file (and its parent directory) with headers if it does not
/// already exist.
pub fn append_record(path: &str, record: &impl Serialize) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending CSV record");

    if !file_exists
        && let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(record)?;
    writer.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[derive(Serialize, Default)]
    struct Row {
        timestamp: String,
        count: usize,
    }

    fn temp_path(name: &str) -> String {
        format!("{}/{}", env::temp_dir().display(), name)
    }

    #[test]
    fn test_print_json_does_not_panic() {
        print_json(&Row::default()).unwrap();
    }

    #[test]
    fn test_append_record_creates_file() {
        let path = temp_path("trip_monitor_test_create.csv");
        let _ = fs::remove_file(&path); // clean up any prior run

        append_record(&path, &Row::default()).unwrap();

        assert!(Path::new(&path).exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.is_empty());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_writes_header_once() {
        let path = temp_path("trip_monitor_test_header.csv");
        let _ = fs::remove_file(&path);

        append_record(&path, &Row::default()).unwrap();
        append_record(&path, &Row::default()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        // Header line should appear exactly once
        let header_count = content.lines().filter(|l| l.contains("timestamp")).count();
        assert_eq!(header_count, 1);
        assert_eq!(content.lines().count(), 3);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_append_record_creates_parent_directory() {
        let dir = temp_path("trip_monitor_test_nested");
        let _ = fs::remove_dir_all(&dir);
        let path = format!("{dir}/out/rows.csv");

        append_record(&path, &Row::default()).unwrap();
        assert!(Path::new(&path).exists());

        fs::remove_dir_all(&dir).unwrap();
    }
}
