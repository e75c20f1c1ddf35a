use crate::distribution::{ReconcileStatus, TransferResult, TransferStatus};

/// Compare the observed balance delta with the contract-declared amount.
/// Balance delta is authoritative; a mismatch is flagged, never raised.
pub fn reconcile(status: &TransferStatus, confirmed: u128, delta: Option<i128>) -> ReconcileStatus {
    match status {
        TransferStatus::Failed(_) => ReconcileStatus::NotApplicable,
        TransferStatus::Unconfirmed => ReconcileStatus::Unverified,
        TransferStatus::Success => match (delta, i128::try_from(confirmed)) {
            (Some(delta), Ok(declared)) if delta == declared => ReconcileStatus::Match,
            (Some(_), _) => ReconcileStatus::Mismatch,
            (None, _) => ReconcileStatus::Unverified,
        },
    }
}

/// Aggregates over a vault's results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileTotals {
    pub total_confirmed: u128,
    pub total_delta: i128,
    /// Σdelta - Σconfirmed over paid recipients with both snapshots
    pub discrepancy: i128,
    pub mismatches: usize,
}

pub fn totals(results: &[TransferResult]) -> ReconcileTotals {
    let mut totals = ReconcileTotals::default();
    for result in results.iter().filter(|r| r.status.was_paid()) {
        totals.total_confirmed = totals
            .total_confirmed
            .saturating_add(result.share_tokens_confirmed);
        if result.reconciliation == ReconcileStatus::Mismatch {
            totals.mismatches += 1;
        }
        if let Some(delta) = result.delta() {
            let declared = i128::try_from(result.share_tokens_confirmed).unwrap_or(i128::MAX);
            totals.total_delta = totals.total_delta.saturating_add(delta);
            totals.discrepancy = totals
                .discrepancy
                .saturating_add(delta.saturating_sub(declared));
        }
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: TransferStatus, confirmed: u128, before: Option<i128>, after: Option<i128>) -> TransferResult {
        let delta = match (before, after) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        };
        TransferResult {
            vault: "V".into(),
            asset: "A".into(),
            recipient: "R".into(),
            batch_number: Some(1),
            amount_requested: confirmed,
            shares_expected: confirmed,
            share_tokens_confirmed: confirmed,
            balance_before: before,
            balance_after: after,
            underlying_estimate: None,
            tx_hash: None,
            reconciliation: reconcile(&status, confirmed, delta),
            status,
        }
    }

    #[test]
    fn test_equal_delta_matches() {
        assert_eq!(reconcile(&TransferStatus::Success, 100, Some(100)), ReconcileStatus::Match);
        assert_eq!(reconcile(&TransferStatus::Success, 100, Some(99)), ReconcileStatus::Mismatch);
        assert_eq!(reconcile(&TransferStatus::Success, 100, None), ReconcileStatus::Unverified);
    }

    #[test]
    fn test_failed_and_unconfirmed_rows() {
        assert_eq!(
            reconcile(&TransferStatus::Failed("x".into()), 0, Some(0)),
            ReconcileStatus::NotApplicable
        );
        assert_eq!(
            reconcile(&TransferStatus::Unconfirmed, 10, Some(10)),
            ReconcileStatus::Unverified
        );
    }

    #[test]
    fn test_totals_report_discrepancy() {
        // fee-on-transfer: each recipient gets 1 less than declared
        let results = vec![
            row(TransferStatus::Success, 100, Some(0), Some(99)),
            row(TransferStatus::Success, 50, Some(10), Some(59)),
            row(TransferStatus::Failed("rejected".into()), 0, Some(5), Some(5)),
            row(TransferStatus::Success, 7, None, Some(7)),
        ];

        let totals = totals(&results);
        assert_eq!(totals.total_confirmed, 157);
        assert_eq!(totals.total_delta, 148);
        assert_eq!(totals.discrepancy, -2);
        assert_eq!(totals.mismatches, 2);
    }
}
