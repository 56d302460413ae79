//! Record sinks: incremental per-site raw files and final deduplicated output.
//!
//! Raw files are appended after every harvest unit so a crash loses at most
//! one unit. Final files are written once per site after all its workers
//! have joined:
//!
//! ```text
//! <out>/raw/<site>.csv          appended, header on first write
//! <out>/raw/<site>.jsonl        appended, one record per line
//! <out>/<site>_records_<ts>.csv deduplicated
//! <out>/<site>_records_<ts>.json deduplicated
//! ```

use crate::config::SiteId;
use crate::records::{field_columns, ResultRecord};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Metadata columns written after the data-field columns.
const META_COLUMNS: &[&str] = &[
    "source_site",
    "source_url",
    "query_key_used",
    "capture_timestamp",
    "card_index",
    "flag",
];

/// Receives records as units complete. Must tolerate concurrent callers.
pub trait RecordSink: Send + Sync {
    fn append(&self, records: &[ResultRecord]) -> Result<()>;

    /// Called once a site's workers have joined; release its handles.
    fn finish_site(&self, _site: &str) -> Result<()> {
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

struct CsvFile {
    writer: csv::Writer<File>,
    columns: Vec<String>,
}

/// Appends raw records to `<dir>/<site>.csv`.
///
/// The header is fixed by the first batch ever written for a site, across
/// runs; fields that appear later are kept in the JSONL file only.
pub struct CsvSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, CsvFile>>,
}

impl CsvSink {
    pub fn open(dir: &Path) -> Result<Self> {
        create_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    fn open_site(&self, site: &str, records: &[ResultRecord]) -> Result<CsvFile> {
        let path = self
            .dir
            .join(format!("{}.csv", SiteId::new(site).file_stem()));
        let existing = existing_columns(&path)?;
        let mut writer = csv::Writer::from_writer(open_append(&path)?);
        let columns = match existing {
            Some(columns) => columns,
            None => {
                let columns = field_columns(records);
                writer.write_record(header(&columns))?;
                columns
            }
        };
        Ok(CsvFile { writer, columns })
    }
}

/// Data-field columns of an existing raw CSV, or `None` when it has no header yet.
fn existing_columns(path: &Path) -> Result<Option<Vec<String>>> {
    let empty = match std::fs::metadata(path) {
        Ok(meta) => meta.len() == 0,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => return Err(e).with_context(|| format!("failed to stat {}", path.display())),
    };
    if empty {
        return Ok(None);
    }
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let columns = reader
        .headers()
        .with_context(|| format!("failed to read header of {}", path.display()))?
        .iter()
        .filter(|c| !META_COLUMNS.contains(c))
        .map(str::to_string)
        .collect();
    Ok(Some(columns))
}

impl RecordSink for CsvSink {
    fn append(&self, records: &[ResultRecord]) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow::anyhow!("csv sink lock poisoned"))?;

        for record in records {
            let site = record.source_site();
            if !files.contains_key(site) {
                let batch: Vec<ResultRecord> = records
                    .iter()
                    .filter(|r| r.source_site() == site)
                    .cloned()
                    .collect();
                let opened = self.open_site(site, &batch)?;
                files.insert(site.to_string(), opened);
            }
            if let Some(out) = files.get_mut(site) {
                out.writer.write_record(row(record, &out.columns))?;
            }
        }
        for out in files.values_mut() {
            out.writer.flush()?;
        }
        Ok(())
    }

    fn finish_site(&self, site: &str) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow::anyhow!("csv sink lock poisoned"))?;
        if let Some(mut out) = files.remove(site) {
            out.writer.flush()?;
        }
        Ok(())
    }
}

/// Appends raw records to `<dir>/<site>.jsonl`, one JSON object per line.
pub struct JsonlSink {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl JsonlSink {
    pub fn open(dir: &Path) -> Result<Self> {
        create_dir(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }
}

impl RecordSink for JsonlSink {
    fn append(&self, records: &[ResultRecord]) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow::anyhow!("jsonl sink lock poisoned"))?;

        for record in records {
            let site = record.source_site();
            if !files.contains_key(site) {
                let path = self
                    .dir
                    .join(format!("{}.jsonl", SiteId::new(site).file_stem()));
                files.insert(site.to_string(), open_append(&path)?);
            }
            if let Some(file) = files.get_mut(site) {
                let json = serde_json::to_string(record)?;
                writeln!(file, "{json}")?;
            }
        }
        for file in files.values_mut() {
            file.flush()?;
        }
        Ok(())
    }

    fn finish_site(&self, site: &str) -> Result<()> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| anyhow::anyhow!("jsonl sink lock poisoned"))?;
        if let Some(mut file) = files.remove(site) {
            file.flush()?;
        }
        Ok(())
    }
}

/// CSV and JSONL raw sinks under one directory.
pub fn raw_sinks(dir: &Path) -> Result<FanoutSink> {
    Ok(FanoutSink::new(vec![
        Box::new(CsvSink::open(dir)?),
        Box::new(JsonlSink::open(dir)?),
    ]))
}

/// Forwards every batch to each inner sink. One failing sink does not
/// keep the batch from the others.
pub struct FanoutSink {
    sinks: Vec<Box<dyn RecordSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn RecordSink>>) -> Self {
        Self { sinks }
    }
}

impl FanoutSink {
    fn each(&self, op: impl Fn(&dyn RecordSink) -> Result<()>) -> Result<()> {
        let errors: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|sink| op(sink.as_ref()).err())
            .map(|e| format!("{e:#}"))
            .collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(anyhow::anyhow!("{}", errors[0])),
            n => Err(anyhow::anyhow!("{n} sinks failed: {}", errors.join("; "))),
        }
    }
}

impl RecordSink for FanoutSink {
    fn append(&self, records: &[ResultRecord]) -> Result<()> {
        self.each(|sink| sink.append(records))
    }

    fn finish_site(&self, site: &str) -> Result<()> {
        self.each(|sink| sink.finish_site(site))
    }
}

/// Paths of the final per-site files.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SiteOutput {
    pub csv: PathBuf,
    pub json: PathBuf,
    pub records: usize,
}

/// Write the deduplicated records of one site as CSV and JSON.
pub fn write_site_output(
    dir: &Path,
    site: &SiteId,
    records: &[ResultRecord],
    timestamp: &str,
) -> Result<SiteOutput> {
    create_dir(dir)?;
    let stem = format!("{}_records_{timestamp}", site.file_stem());
    let csv_path = dir.join(format!("{stem}.csv"));
    let json_path = dir.join(format!("{stem}.json"));

    write_csv(&csv_path, records)?;
    write_json(&json_path, records)?;

    Ok(SiteOutput {
        csv: csv_path,
        json: json_path,
        records: records.len(),
    })
}

/// Write records to a CSV file with data fields first, metadata after.
pub fn write_csv(path: &Path, records: &[ResultRecord]) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    let columns = field_columns(records);
    writer.write_record(header(&columns))?;
    for record in records {
        writer.write_record(row(record, &columns))?;
    }
    writer.flush()?;
    Ok(())
}

/// Write records as a pretty-printed JSON array.
pub fn write_json(path: &Path, records: &[ResultRecord]) -> Result<()> {
    let json = serde_json::to_vec_pretty(records)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output dir: {}", dir.display()))
}

/// Timestamp used in final file names.
pub fn file_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn header(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .cloned()
        .chain(META_COLUMNS.iter().map(|c| c.to_string()))
        .collect()
}

fn row(record: &ResultRecord, columns: &[String]) -> Vec<String> {
    let mut row: Vec<String> = columns
        .iter()
        .map(|c| record.field(c).to_string())
        .collect();
    row.extend([
        record.source_site().to_string(),
        record.source_url().to_string(),
        record.query_key_used().to_string(),
        record.capture_timestamp().to_rfc3339(),
        record.card_index().to_string(),
        record.flag().as_str().to_string(),
    ]);
    row
}
