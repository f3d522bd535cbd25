//! Persisted detection sequences.
//!
//! A recording is an ordered list of detection frames in capture order. The
//! format follows the file extension: `.json` is JSON, anything else is YAML.

use crate::error::Result;
use crate::proto::DetectionFrame;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// On-disk encoding of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Yaml,
    Json,
}

impl RecordFormat {
    /// Pick the format from the file extension
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => RecordFormat::Json,
            _ => RecordFormat::Yaml,
        }
    }
}

/// Reader and writer for detection recordings.
pub struct DetectionLog;

impl DetectionLog {
    pub fn save(path: impl AsRef<Path>, frames: &[DetectionFrame]) -> Result<()> {
        write_document(path.as_ref(), frames)?;
        log::debug!(
            "Wrote {} detection frames to {}",
            frames.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Vec<DetectionFrame>> {
        read_document(path.as_ref())
    }
}

/// Where the recording for `media` captured with `binary` goes:
/// `<dir>/<stem>.<binary name>.yml`
pub fn output_path_for(media: &Path, binary: &Path) -> PathBuf {
    let binary_name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vision".to_string());
    media.with_extension(format!("{}.yml", binary_name))
}

pub(crate) fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    let value = match RecordFormat::for_path(path) {
        RecordFormat::Json => serde_json::from_reader(reader)?,
        RecordFormat::Yaml => serde_yaml::from_reader(reader)?,
    };
    Ok(value)
}

pub(crate) fn write_document<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    match RecordFormat::for_path(path) {
        RecordFormat::Json => serde_json::to_writer_pretty(&mut writer, value)?,
        RecordFormat::Yaml => serde_yaml::to_writer(&mut writer, value)?,
    }
    writer.flush()?;
    Ok(())
}
