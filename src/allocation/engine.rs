use ruint::aliases::U256;

use crate::error::AllocationError;
use crate::input::AccountId;

/// Result of splitting `minted_total` across recipients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub minted_total: u128,
    pub total_requested: u128,
    /// Per-recipient shares, in request order
    pub shares: Vec<(AccountId, u128)>,
    pub distributed: u128,
    /// Truncation remainder kept by the distributing account
    pub dust: u128,
}

/// floor(requested * minted_total / total_requested) with a 256-bit intermediate
pub fn proportional_share(
    requested: u128,
    minted_total: u128,
    total_requested: u128,
) -> Result<u128, AllocationError> {
    if total_requested == 0 {
        return Err(AllocationError::ZeroDenominator);
    }

    let product = U256::from(requested)
        .checked_mul(U256::from(minted_total))
        .ok_or(AllocationError::Overflow("share product"))?;
    let quotient = product / U256::from(total_requested);

    u128::try_from(quotient).map_err(|_| AllocationError::Overflow("share quotient"))
}

/// Split `minted_total` across `requests` proportionally to each requested
/// amount. Floor division only: the remainder is reported as dust and is
/// never handed to any recipient.
///
/// `requests` must sum exactly to `total_requested`.
pub fn allocate(
    minted_total: u128,
    total_requested: u128,
    requests: &[(AccountId, u128)],
) -> Result<Allocation, AllocationError> {
    if total_requested == 0 {
        return Err(AllocationError::ZeroDenominator);
    }

    let actual = requests
        .iter()
        .try_fold(0u128, |acc, (_, amount)| acc.checked_add(*amount))
        .ok_or(AllocationError::Overflow("requested total"))?;
    if actual != total_requested {
        return Err(AllocationError::TotalMismatch {
            expected: total_requested,
            actual,
        });
    }

    let mut shares = Vec::with_capacity(requests.len());
    let mut distributed: u128 = 0;

    for (recipient, requested) in requests {
        let share = proportional_share(*requested, minted_total, total_requested)?;
        distributed = distributed
            .checked_add(share)
            .ok_or(AllocationError::Overflow("distributed total"))?;
        shares.push((recipient.clone(), share));
    }

    // Σ floor(x_i) <= floor(Σ x_i) = minted_total, so this cannot underflow
    let dust = minted_total
        .checked_sub(distributed)
        .ok_or(AllocationError::Overflow("dust"))?;

    Ok(Allocation {
        minted_total,
        total_requested,
        shares,
        distributed,
        dust,
    })
}
