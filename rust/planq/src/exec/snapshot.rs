use crate::result::ResultSet;
use anyhow::{Context, Result};
use arrow::error::ArrowError;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const EXTENSION: &str = "parquet";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SnapshotInfo {
    pub cache_key: String,
    pub path: String,
    pub size_bytes: u64,
}

/// Parquet snapshots named by fingerprint: `<dir>/<fingerprint>.parquet`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, cache_key: &str) -> PathBuf {
        self.dir.join(format!("{cache_key}.{EXTENSION}"))
    }

    pub fn exists(&self, cache_key: &str) -> bool {
        self.path_for(cache_key).is_file()
    }

    /// Writes through a uniquely named temporary file so readers never see a
    /// partial snapshot and concurrent writers of one key never share a file.
    pub fn write(&self, cache_key: &str, result: &ResultSet) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path_for(cache_key);

        let batch = result.to_record_batch()?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{cache_key}."))
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .with_context(|| format!("failed to create a temporary file in {}", self.dir.display()))?;
        let mut writer = ArrowWriter::try_new(tmp.as_file_mut(), batch.schema(), Some(props))
            .context("failed to open parquet writer")?;
        writer.write(&batch).context("failed to write snapshot rows")?;
        writer.close().context("failed to finish snapshot")?;

        tmp.persist(&path)
            .with_context(|| format!("failed to move snapshot into {}", path.display()))?;
        debug!(cache_key, rows = result.row_count(), path = %path.display(), "snapshot written");
        Ok(path)
    }

    pub fn read(&self, path: &Path) -> Result<ResultSet> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("invalid snapshot {}", path.display()))?;
        let schema = builder.schema().clone();
        let batches = builder
            .build()
            .context("failed to read snapshot")?
            .collect::<Result<Vec<_>, ArrowError>>()
            .context("failed to decode snapshot")?;
        ResultSet::from_record_batches(&schema, &batches)
    }

    /// Reads selected columns (all when empty), in the requested order, up
    /// to `limit` rows.
    pub fn read_projected(
        &self,
        path: &Path,
        columns: &[String],
        limit: Option<usize>,
    ) -> Result<ResultSet> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("invalid snapshot {}", path.display()))?;
        let full_schema = builder.schema().clone();

        let schema = if columns.is_empty() {
            full_schema
        } else {
            let mut indices = columns
                .iter()
                .map(|name| {
                    full_schema
                        .index_of(name)
                        .with_context(|| format!("snapshot has no column '{name}'"))
                })
                .collect::<Result<Vec<_>>>()?;
            indices.sort_unstable();
            indices.dedup();
            let mask = ProjectionMask::roots(builder.parquet_schema(), indices.iter().copied());
            builder = builder.with_projection(mask);
            Arc::new(full_schema.project(&indices)?)
        };
        if let Some(limit) = limit {
            builder = builder.with_limit(limit);
        }

        let batches = builder
            .build()
            .context("failed to read snapshot")?
            .collect::<Result<Vec<_>, ArrowError>>()
            .context("failed to decode snapshot")?;
        let result = ResultSet::from_record_batches(&schema, &batches)?;
        if columns.is_empty() {
            Ok(result)
        } else {
            result.project(columns)
        }
    }

    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(cache_key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            snapshots.push(SnapshotInfo {
                cache_key: cache_key.to_string(),
                path: path.to_string_lossy().into_owned(),
                size_bytes: entry.metadata()?.len(),
            });
        }
        snapshots.sort_by(|a, b| a.cache_key.cmp(&b.cache_key));
        Ok(snapshots)
    }

    pub fn remove(&self, cache_key: &str) -> Result<bool> {
        let path = self.path_for(cache_key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for snapshot in self.list()? {
            if self.remove(&snapshot.cache_key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
