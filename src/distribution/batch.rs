use std::fmt;

use crate::input::AccountId;

/// A contiguous, order-preserving slice of a vault's payouts.
/// Numbering starts at 1 and depends only on input order and batch size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub number: usize,
    pub recipients: Vec<(AccountId, u128)>,
}

impl Batch {
    /// Σ requested amounts, `None` on overflow
    pub fn total(&self) -> Option<u128> {
        self.recipients
            .iter()
            .try_fold(0u128, |acc, (_, amount)| acc.checked_add(*amount))
    }
}

/// Split `recipients` into `ceil(len / max_batch_size)` batches
pub fn partition(recipients: &[(AccountId, u128)], max_batch_size: usize) -> Vec<Batch> {
    let size = max_batch_size.max(1);
    recipients
        .chunks(size)
        .enumerate()
        .map(|(idx, chunk)| Batch {
            number: idx + 1,
            recipients: chunk.to_vec(),
        })
        .collect()
}

/// Lifecycle of one batch: BUILDING -> SUBMITTED -> CONFIRMED | FAILED
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    Building,
    Submitted,
    Confirmed { hash: String },
    /// Terminal success without a usable return value
    Unconfirmed { hash: String },
    Failed { hash: Option<String>, reason: String },
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchState::Confirmed { .. } | BatchState::Unconfirmed { .. } | BatchState::Failed { .. }
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Building => write!(f, "BUILDING"),
            BatchState::Submitted => write!(f, "SUBMITTED"),
            BatchState::Confirmed { .. } => write!(f, "CONFIRMED"),
            BatchState::Unconfirmed { .. } => write!(f, "CONFIRMED(unverified return)"),
            BatchState::Failed { .. } => write!(f, "FAILED"),
        }
    }
}
