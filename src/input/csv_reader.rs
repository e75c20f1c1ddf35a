use std::{fs::File, io::Read, path::Path};

use tracing::{info, warn};

use crate::error::InputError;
use crate::input::models::{
    group_by_vault, DistributionMode, DistributionRecord, IngestStats, VaultGroup,
};

/// Header positions resolved once, so the rest of the pipeline never looks
/// at column names again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub asset: usize,
    pub vault: usize,
    pub recipient: usize,
    pub amount: usize,
    pub amount_column: &'static str,
}

impl ColumnMap {
    pub fn resolve(headers: &csv::StringRecord, mode: DistributionMode) -> Result<Self, InputError> {
        let normalized: Vec<String> = headers
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase())
            .collect();

        let find = |names: &[&str]| -> Option<(usize, usize)> {
            names.iter().enumerate().find_map(|(rank, name)| {
                normalized.iter().position(|h| h == name).map(|idx| (rank, idx))
            })
        };

        let mut missing = Vec::new();

        let asset = find(&["asset"]).map(|(_, idx)| idx);
        if asset.is_none() {
            missing.push("asset".to_string());
        }
        let vault = find(&["vault"]).map(|(_, idx)| idx);
        if vault.is_none() {
            missing.push("vault".to_string());
        }
        let recipient = find(&["user", "recipient"]).map(|(_, idx)| idx);
        if recipient.is_none() {
            missing.push("user|recipient".to_string());
        }
        let amount_names = mode.amount_columns();
        let amount = find(amount_names);
        if amount.is_none() {
            missing.push(amount_names.join("|"));
        }

        match (asset, vault, recipient, amount) {
            (Some(asset), Some(vault), Some(recipient), Some((rank, amount))) => Ok(Self {
                asset,
                vault,
                recipient,
                amount,
                amount_column: amount_names[rank],
            }),
            _ => Err(InputError::Format(format!(
                "header [{}] is missing required column(s): {}",
                normalized.join(","),
                missing.join(", ")
            ))),
        }
    }
}

/// Parsed and grouped input, ready for the orchestrator
#[derive(Debug, Clone)]
pub struct Ingested {
    pub groups: Vec<VaultGroup>,
    pub stats: IngestStats,
}

impl Ingested {
    pub fn recipient_count(&self) -> usize {
        self.groups.iter().map(VaultGroup::len).sum()
    }
}

pub fn read_distribution_file(path: &Path, mode: DistributionMode) -> Result<Ingested, InputError> {
    let file = File::open(path).map_err(|source| InputError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    let ingested = parse_distribution(file, mode)?;

    info!(
        "📄 Loaded {} ({} rows, {} vaults, {} recipients, {} skipped, {} merged, {} dropped for asset conflict, {} dropped as self-recipient)",
        path.display(),
        ingested.stats.rows_read,
        ingested.groups.len(),
        ingested.recipient_count(),
        ingested.stats.skipped_non_positive,
        ingested.stats.merged_duplicates,
        ingested.stats.dropped_asset_conflict,
        ingested.stats.dropped_self_recipient,
    );

    Ok(ingested)
}

pub fn parse_distribution<R: Read>(reader: R, mode: DistributionMode) -> Result<Ingested, InputError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let columns = ColumnMap::resolve(&headers, mode)?;

    let mut stats = IngestStats::default();
    let mut records = Vec::new();

    for row in rdr.records() {
        let row = row?;
        stats.rows_read += 1;
        let line = row.position().map(|p| p.line()).unwrap_or(0);

        let cell = |idx: usize, name: &str| -> Result<String, InputError> {
            match row.get(idx).map(str::trim) {
                Some(value) if !value.is_empty() => Ok(value.to_string()),
                _ => Err(InputError::Format(format!(
                    "line {}: empty or missing '{}' value",
                    line, name
                ))),
            }
        };

        let raw_amount = row.get(columns.amount).map(str::trim).unwrap_or("");
        let amount = match parse_amount(raw_amount) {
            Ok(Some(amount)) => amount,
            Ok(None) => {
                warn!(
                    "line {}: skipping row with non-positive {} '{}'",
                    line, columns.amount_column, raw_amount
                );
                stats.skipped_non_positive += 1;
                continue;
            }
            Err(reason) => {
                return Err(InputError::Format(format!(
                    "line {}: {} '{}' {}",
                    line, columns.amount_column, raw_amount, reason
                )))
            }
        };

        records.push(DistributionRecord {
            vault: cell(columns.vault, "vault")?,
            asset: cell(columns.asset, "asset")?,
            recipient: cell(columns.recipient, "recipient")?,
            amount,
        });
    }

    let groups = group_by_vault(records, &mut stats)?;

    Ok(Ingested { groups, stats })
}

/// `Ok(None)` for values that parse but are not positive
fn parse_amount(raw: &str) -> Result<Option<u128>, &'static str> {
    if raw.is_empty() {
        return Err("is empty");
    }
    let value: i128 = raw
        .parse()
        .map_err(|_| "is not an integer amount in base units")?;
    if value <= 0 {
        return Ok(None);
    }
    Ok(Some(value as u128))
}
