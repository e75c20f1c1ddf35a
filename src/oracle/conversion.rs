use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::debug;

use crate::allocation::proportional_share;
use crate::error::GatewayError;
use crate::execution::ContractClient;

/// Whole tokens used as the reference quantity; large enough to keep the
/// relative rounding error of the quoted rate negligible
pub const REFERENCE_WHOLE_TOKENS: u128 = 10;

/// Share-token -> underlying exchange rate, as quoted by the vault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionRate {
    pub reference_share_amount: u128,
    pub reference_underlying_amount: u128,
}

impl ConversionRate {
    /// floor(shares * underlying_ref / shares_ref). Reporting only.
    pub fn to_underlying(&self, share_amount: u128) -> Option<u128> {
        proportional_share(
            share_amount,
            self.reference_underlying_amount,
            self.reference_share_amount,
        )
        .ok()
    }
}

/// 10 whole tokens scaled by the token's decimals
pub fn reference_share_amount(decimals: u32) -> Option<u128> {
    10u128
        .checked_pow(decimals)
        .and_then(|unit| unit.checked_mul(REFERENCE_WHOLE_TOKENS))
}

/// Render a base-unit amount with its decimals, e.g. `12345` at 2 -> `123.45`
pub fn display_amount(amount: u128, decimals: u32) -> String {
    i128::try_from(amount)
        .ok()
        .and_then(|value| Decimal::try_from_i128_with_scale(value, decimals).ok())
        .map(|d| d.to_string())
        .unwrap_or_else(|| amount.to_string())
}

/// Queries vault exchange rates through simulated reads
pub struct ConversionOracle {
    contracts: ContractClient,
    decimals: HashMap<String, u32>,
}

impl ConversionOracle {
    pub fn new(contracts: ContractClient) -> Self {
        Self {
            contracts,
            decimals: HashMap::new(),
        }
    }

    /// Token decimals (share token or underlying asset), read once per token
    pub async fn decimals(&mut self, token: &str) -> Result<u32, GatewayError> {
        if let Some(decimals) = self.decimals.get(token) {
            return Ok(*decimals);
        }
        let decimals = self.contracts.decimals(token).await?;
        self.decimals.insert(token.to_string(), decimals);
        Ok(decimals)
    }

    /// Current rate of `vault`. Called once per batch; the rate may drift
    /// between batches as the vault accrues yield.
    pub async fn fetch_rate(&mut self, vault: &str) -> Result<ConversionRate, GatewayError> {
        let decimals = self.decimals(vault).await?;
        let reference = reference_share_amount(decimals).ok_or_else(|| {
            GatewayError::UnexpectedReturn(format!("decimals {} too large for a reference amount", decimals))
        })?;

        let underlying = self.contracts.asset_amount_for_shares(vault, reference).await?;
        debug!(
            "Rate for {}: {} shares -> {} underlying",
            vault, reference, underlying
        );

        Ok(ConversionRate {
            reference_share_amount: reference,
            reference_underlying_amount: underlying,
        })
    }
}
