//! CSV manifest of image filenames and numeric labels

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::DataError;

/// One manifest row: an image file and its age label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// File name relative to the image directory
    pub filename: String,
    /// Numeric label (age)
    pub label: f64,
}

impl ManifestRecord {
    /// Create a new record
    pub fn new(filename: impl Into<String>, label: f64) -> Self {
        Self {
            filename: filename.into(),
            label,
        }
    }

    /// Sample identifier: the file name up to its first dot
    pub fn id(&self) -> &str {
        self.filename
            .split('.')
            .next()
            .unwrap_or(self.filename.as_str())
    }

    /// Full path of the image inside `image_dir`
    pub fn image_path(&self, image_dir: &Path) -> PathBuf {
        image_dir.join(&self.filename)
    }
}

/// Parsed manifest
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    records: Vec<ManifestRecord>,
}

impl Manifest {
    /// Build a manifest from already-parsed records
    pub fn from_records(records: Vec<ManifestRecord>) -> Self {
        Self { records }
    }

    /// Read a CSV manifest, picking the filename and label columns by header name
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_csv(
        path: impl AsRef<Path>,
        filename_column: &str,
        label_column: &str,
    ) -> Result<Self, DataError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DataError::ManifestNotFound {
                path: path.display().to_string(),
            });
        }

        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;
        let manifest = Self::from_reader(reader, filename_column, label_column)?;

        info!("Loaded manifest with {} records", manifest.len());
        Ok(manifest)
    }

    fn from_reader<R: std::io::Read>(
        mut reader: csv::Reader<R>,
        filename_column: &str,
        label_column: &str,
    ) -> Result<Self, DataError> {
        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| DataError::MissingColumn {
                    column: name.to_string(),
                })
        };
        let filename_idx = column(filename_column)?;
        let label_idx = column(label_column)?;
        debug!(
            "Manifest columns: {} -> {}, {} -> {}",
            filename_column, filename_idx, label_column, label_idx
        );

        let mut records = Vec::new();
        for (i, row) in reader.records().enumerate() {
            let row = row?;
            let row_number = i + 1;

            let filename = row
                .get(filename_idx)
                .filter(|f| !f.is_empty())
                .ok_or_else(|| DataError::MalformedRow {
                    row: row_number,
                    reason: format!("empty '{}' value", filename_column),
                })?;
            let raw_label = row.get(label_idx).unwrap_or_default();
            let label: f64 = raw_label.parse().map_err(|_| DataError::MalformedRow {
                row: row_number,
                reason: format!("'{}' is not a number: {:?}", label_column, raw_label),
            })?;

            records.push(ManifestRecord::new(filename, label));
        }

        if records.is_empty() {
            return Err(DataError::EmptyManifest);
        }

        Ok(Self { records })
    }

    /// Records in file order
    pub fn records(&self) -> &[ManifestRecord] {
        &self.records
    }

    /// Consume the manifest, returning its records
    pub fn into_records(self) -> Vec<ManifestRecord> {
        self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the manifest has no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
