use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use csv::{Writer, WriterBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::distribution::TransferResult;
use crate::error::AuditError;
use crate::oracle::display_amount;

pub const AUDIT_COLUMNS: [&str; 17] = [
    "run_id",
    "timestamp",
    "vault",
    "asset",
    "recipient",
    "batch",
    "amount_requested",
    "shares_expected",
    "df_tokens_confirmed",
    "balance_before",
    "balance_after",
    "delta",
    "underlying_estimate",
    "underlying_display",
    "reconciliation",
    "tx_hash",
    "status",
];

/// `distribution_20250101T120000Z`, shared by the audit CSV and the run log
pub fn run_stem(started: DateTime<Utc>) -> String {
    format!("distribution_{}", started.format("%Y%m%dT%H%M%SZ"))
}

/// Append-only CSV audit trail, one row per [`TransferResult`], flushed per row
pub struct AuditSink {
    writer: Writer<File>,
    run_id: Uuid,
    path: PathBuf,
    rows: usize,
}

impl AuditSink {
    pub fn create(dir: &Path, started: DateTime<Utc>, run_id: Uuid) -> Result<Self, AuditError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv", run_stem(started)));
        Self::open(path, run_id)
    }

    /// Open `path` for appending; the header goes in only when the file is new
    pub fn open(path: PathBuf, run_id: Uuid) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_new = file.metadata()?.len() == 0;

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(AUDIT_COLUMNS)?;
            writer.flush()?;
        }
        debug!("Audit trail at {}", path.display());

        Ok(Self {
            writer,
            run_id,
            path,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }

    /// Append one row. `decimals` renders the underlying estimate for humans.
    pub fn record(&mut self, result: &TransferResult, decimals: Option<u32>) -> Result<(), AuditError> {
        let opt = |v: Option<String>| v.unwrap_or_default();
        let display = match (result.underlying_estimate, decimals) {
            (Some(estimate), Some(decimals)) => display_amount(estimate, decimals),
            _ => String::new(),
        };

        self.writer.write_record([
            self.run_id.to_string(),
            Utc::now().to_rfc3339(),
            result.vault.clone(),
            result.asset.clone(),
            result.recipient.clone(),
            opt(result.batch_number.map(|n| n.to_string())),
            result.amount_requested.to_string(),
            result.shares_expected.to_string(),
            result.share_tokens_confirmed.to_string(),
            opt(result.balance_before.map(|b| b.to_string())),
            opt(result.balance_after.map(|b| b.to_string())),
            opt(result.delta().map(|d| d.to_string())),
            opt(result.underlying_estimate.map(|u| u.to_string())),
            display,
            result.reconciliation.to_string(),
            opt(result.tx_hash.clone()),
            result.status.to_string(),
        ])?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }
}
