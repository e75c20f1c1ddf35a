use std::{collections::HashMap, fmt};

use serde::Serialize;
use uuid::Uuid;

use crate::input::{AccountId, AssetId, VaultId};
use crate::oracle::ConversionRate;

/// Per-recipient outcome of a vault run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Success,
    /// Ledger reported success but gave no usable per-recipient amount
    Unconfirmed,
    Failed(String),
}

impl TransferStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, TransferStatus::Failed(_))
    }

    /// Success or unconfirmed: the recipient was part of a successful batch
    pub fn was_paid(&self) -> bool {
        matches!(self, TransferStatus::Success | TransferStatus::Unconfirmed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Success => write!(f, "success"),
            TransferStatus::Unconfirmed => write!(f, "unconfirmed"),
            TransferStatus::Failed(reason) => write!(f, "failed:{}", reason),
        }
    }
}

/// Balance delta versus the contract-declared amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileStatus {
    Match,
    Mismatch,
    /// No declared amount, or a balance snapshot is missing
    Unverified,
    NotApplicable,
}

impl fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileStatus::Match => write!(f, "MATCH"),
            ReconcileStatus::Mismatch => write!(f, "MISMATCH"),
            ReconcileStatus::Unverified => write!(f, "UNVERIFIED"),
            ReconcileStatus::NotApplicable => write!(f, "N/A"),
        }
    }
}

/// One audit row. Built once after the vault's after-snapshot, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub vault: VaultId,
    pub asset: AssetId,
    pub recipient: AccountId,
    pub batch_number: Option<usize>,
    /// Amount from the input file (share tokens or underlying, by mode)
    pub amount_requested: u128,
    /// Share tokens owed: the requested amount in transfer mode, the
    /// pro-rata floor of the batch's minted total in deposit mode
    pub shares_expected: u128,
    pub share_tokens_confirmed: u128,
    pub balance_before: Option<i128>,
    pub balance_after: Option<i128>,
    pub underlying_estimate: Option<u128>,
    pub tx_hash: Option<String>,
    pub status: TransferStatus,
    pub reconciliation: ReconcileStatus,
}

impl TransferResult {
    pub fn delta(&self) -> Option<i128> {
        match (self.balance_before, self.balance_after) {
            (Some(before), Some(after)) => after.checked_sub(before),
            _ => None,
        }
    }
}

/// How the ledger answered for one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchConfirmation {
    /// Per-recipient amounts declared by the relay's return value
    Confirmed(HashMap<AccountId, u128>),
    Unconfirmed,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub number: usize,
    pub tx_hash: Option<String>,
    pub confirmation: BatchConfirmation,
    /// Rate quoted right after the batch reached a terminal status
    pub rate: Option<ConversionRate>,
}

/// Aggregate of one vault run
#[derive(Debug, Clone, Default, Serialize)]
pub struct VaultRunReport {
    pub vault: VaultId,
    pub asset: AssetId,
    pub recipients: usize,
    pub batches_attempted: usize,
    pub batches_failed: usize,
    pub paid: usize,
    pub failed: usize,
    pub mismatches: usize,
    /// Deposit mode: recipients whose declared shares differ from the
    /// pro-rata floor beyond the relay's last-recipient remainder
    pub split_deviations: usize,
    pub total_confirmed: u128,
    pub total_delta: i128,
    /// Σdelta - Σconfirmed over paid recipients with both snapshots
    pub discrepancy: i128,
    /// Deposit mode: Σ(minted - Σ floor shares) over successful batches
    pub dust: Option<u128>,
    pub failed_batches: Vec<(usize, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub vaults: Vec<VaultRunReport>,
}

impl RunSummary {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            vaults: Vec::new(),
        }
    }

    pub fn discrepancy(&self) -> i128 {
        self.vaults.iter().map(|v| v.discrepancy).sum()
    }

    pub fn mismatches(&self) -> usize {
        self.vaults.iter().map(|v| v.mismatches).sum()
    }

    pub fn paid(&self) -> usize {
        self.vaults.iter().map(|v| v.paid).sum()
    }

    pub fn failed(&self) -> usize {
        self.vaults.iter().map(|v| v.failed).sum()
    }

    pub fn dust(&self) -> u128 {
        self.vaults.iter().filter_map(|v| v.dust).sum()
    }

    /// (vault, batch, reason) for every failed batch
    pub fn failed_batches(&self) -> Vec<(&str, usize, &str)> {
        self.vaults
            .iter()
            .flat_map(|v| {
                v.failed_batches
                    .iter()
                    .map(move |(n, reason)| (v.vault.as_str(), *n, reason.as_str()))
            })
            .collect()
    }
}
