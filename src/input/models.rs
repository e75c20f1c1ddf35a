use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::InputError;

pub type VaultId = String;
pub type AssetId = String;
pub type AccountId = String;

/// Pipeline stage the input file feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionMode {
    /// CSV amounts are share tokens, moved as-is from the distributing account
    Transfer,
    /// CSV amounts are underlying asset; the vault total is deposited first
    /// and the minted share tokens are split pro-rata
    Deposit,
}

impl DistributionMode {
    /// Accepted amount headers, in order of preference
    pub fn amount_columns(&self) -> &'static [&'static str] {
        match self {
            DistributionMode::Transfer => &["df_tokens_to_receive", "amount"],
            DistributionMode::Deposit => &["underlying_amount", "amount"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionMode::Transfer => "transfer",
            DistributionMode::Deposit => "deposit",
        }
    }
}

impl fmt::Display for DistributionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DistributionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transfer" => Ok(DistributionMode::Transfer),
            "deposit" => Ok(DistributionMode::Deposit),
            other => Err(format!(
                "DISTRIBUTION_MODE must be transfer or deposit, got '{}'",
                other
            )),
        }
    }
}

/// One intended transfer. `amount` is always positive once ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRecord {
    pub vault: VaultId,
    pub asset: AssetId,
    pub recipient: AccountId,
    pub amount: u128,
}

/// All recipients of one vault. Every recipient shares the vault's asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultGroup {
    pub vault: VaultId,
    pub asset: AssetId,
    pub recipients: Vec<(AccountId, u128)>,
}

impl VaultGroup {
    pub fn new(vault: VaultId, asset: AssetId) -> Self {
        Self {
            vault,
            asset,
            recipients: Vec::new(),
        }
    }

    /// Sum of requested amounts, `None` on overflow
    pub fn total_requested(&self) -> Option<u128> {
        self.recipients
            .iter()
            .try_fold(0u128, |acc, (_, amount)| acc.checked_add(*amount))
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }
}

/// Counters reported at the end of ingestion
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    pub rows_read: usize,
    pub skipped_non_positive: usize,
    pub merged_duplicates: usize,
    pub dropped_asset_conflict: usize,
    pub dropped_self_recipient: usize,
}

/// Stable multi-map build keyed by vault. Vault order and recipient order
/// follow first appearance in the input.
pub fn group_by_vault(
    records: Vec<DistributionRecord>,
    stats: &mut IngestStats,
) -> Result<Vec<VaultGroup>, InputError> {
    let mut groups: Vec<VaultGroup> = Vec::new();
    let mut vault_index: HashMap<VaultId, usize> = HashMap::new();
    let mut recipient_index: HashMap<(usize, AccountId), usize> = HashMap::new();

    for record in records {
        if record.recipient == record.vault {
            warn!(
                "Dropping row: recipient {} is the vault itself",
                record.recipient
            );
            stats.dropped_self_recipient += 1;
            continue;
        }

        let group_idx = *vault_index.entry(record.vault.clone()).or_insert_with(|| {
            groups.push(VaultGroup::new(record.vault.clone(), record.asset.clone()));
            groups.len() - 1
        });
        let group = &mut groups[group_idx];

        if group.asset != record.asset {
            warn!(
                "Dropping row for {}: asset {} conflicts with vault {} asset {}",
                record.recipient, record.asset, group.vault, group.asset
            );
            stats.dropped_asset_conflict += 1;
            continue;
        }

        match recipient_index.get(&(group_idx, record.recipient.clone())) {
            Some(&pos) => {
                let entry = &mut group.recipients[pos];
                entry.1 = entry.1.checked_add(record.amount).ok_or_else(|| {
                    InputError::Format(format!(
                        "amount overflow merging duplicate rows for {} in vault {}",
                        record.recipient, record.vault
                    ))
                })?;
                warn!(
                    "Merged duplicate row for {} in vault {} (new total {})",
                    record.recipient, record.vault, entry.1
                );
                stats.merged_duplicates += 1;
            }
            None => {
                recipient_index.insert((group_idx, record.recipient.clone()), group.recipients.len());
                group.recipients.push((record.recipient, record.amount));
            }
        }
    }

    Ok(groups)
}
