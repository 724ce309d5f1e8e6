//! CSV export artifacts.
//!
//! One file per finished job, named after the job ID, under the configured
//! export directory. Files are written to a sibling temp path and renamed into
//! place so a reader never observes a partial artifact.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use tracing::{debug, instrument};

use paysettle_core::JobId;
use paysettle_core::period::DATE_FORMAT;
use paysettle_settlement::SettlementRow;

pub const CSV_HEADER: &str = "merchant_id,date,gross_cents,fee_cents,net_cents,txn_count,generated_at,run_id";

const CSV_EXTENSION: &str = "csv";

/// Export error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExportError {
    #[error("failed to write export {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid export file name: {0}")]
    InvalidName(String),
}

impl ExportError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Where artifacts live on disk and how they are addressed by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportLayout {
    dir: PathBuf,
    public_prefix: String,
}

impl ExportLayout {
    pub fn new(dir: impl Into<PathBuf>, public_prefix: impl Into<String>) -> Self {
        let public_prefix = public_prefix.into();
        Self {
            dir: dir.into(),
            public_prefix: public_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self, job_id: JobId) -> String {
        format!("{job_id}.{CSV_EXTENSION}")
    }

    pub fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(self.file_name(job_id))
    }

    /// Client-facing location of the artifact, e.g. `/jobs/downloads/<id>.csv`.
    pub fn public_location(&self, job_id: JobId) -> String {
        format!("{}/{}", self.public_prefix, self.file_name(job_id))
    }

    /// Map a requested download name back to the job it belongs to.
    ///
    /// Only `<job-id>.csv` is accepted, so a request can never address a path
    /// outside the export directory.
    pub fn job_for_file(&self, file_name: &str) -> Result<JobId, ExportError> {
        let invalid = || ExportError::InvalidName(file_name.to_string());
        let stem = file_name
            .strip_suffix(CSV_EXTENSION)
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(invalid)?;
        stem.parse::<JobId>().map_err(|_| invalid())
    }
}

/// Render settlement rows as CSV, header first, in the order given.
pub fn render_csv<'a>(rows: impl IntoIterator<Item = &'a SettlementRow>) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + 1);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for row in rows {
        // Writing into a String cannot fail.
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            row.merchant_id,
            row.date.format(DATE_FORMAT),
            row.gross,
            row.fee,
            row.net,
            row.txn_count,
            row.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            row.run_id,
        );
    }
    out
}

/// Writes per-job CSV artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    layout: ExportLayout,
}

impl ArtifactWriter {
    pub fn new(layout: ExportLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ExportLayout {
        &self.layout
    }

    /// Write the artifact for `job_id`, replacing any previous one.
    #[instrument(skip(self, rows), fields(job_id = %job_id), err)]
    pub async fn write(
        &self,
        job_id: JobId,
        rows: &[SettlementRow],
    ) -> Result<PathBuf, ExportError> {
        let dir = self.layout.dir();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ExportError::io(dir, e))?;

        let path = self.layout.path_for(job_id);
        let tmp = path.with_extension(format!("{CSV_EXTENSION}.tmp"));
        let body = render_csv(rows);

        tokio::fs::write(&tmp, body.as_bytes())
            .await
            .map_err(|e| ExportError::io(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ExportError::io(&path, e));
        }

        debug!(path = %path.display(), rows = rows.len(), "export written");
        Ok(path)
    }
}
