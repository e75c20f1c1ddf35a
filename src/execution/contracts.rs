use std::sync::Arc;

use stellar_xdr::curr::ScVal;
use tracing::debug;

use crate::error::GatewayError;
use crate::execution::gateway::{ContractCall, LedgerGateway, TxOutcome};
use crate::execution::scval;
use crate::input::AccountId;

/// Typed calls against the vault (which is also its own share token) and
/// the relay contract, on top of a [`LedgerGateway`]
#[derive(Clone)]
pub struct ContractClient {
    gateway: Arc<dyn LedgerGateway>,
    relay_contract: String,
    relay_method: String,
}

impl ContractClient {
    pub fn new(
        gateway: Arc<dyn LedgerGateway>,
        relay_contract: impl Into<String>,
        relay_method: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            relay_contract: relay_contract.into(),
            relay_method: relay_method.into(),
        }
    }

    pub fn caller(&self) -> &str {
        self.gateway.caller()
    }

    /// Share-token balance of `account`
    pub async fn balance(&self, token: &str, account: &str) -> Result<i128, GatewayError> {
        let call = ContractCall::new(token, "balance", vec![scval::address(account)?]);
        let value = self.gateway.simulate(&call).await?;
        scval::to_i128(&value)
    }

    pub async fn decimals(&self, token: &str) -> Result<u32, GatewayError> {
        let call = ContractCall::new(token, "decimals", vec![]);
        let value = self.gateway.simulate(&call).await?;
        scval::to_u32(&value)
    }

    /// Underlying asset redeemable for `shares` of a single-asset vault
    pub async fn asset_amount_for_shares(&self, vault: &str, shares: u128) -> Result<u128, GatewayError> {
        let call = ContractCall::new(
            vault,
            "get_asset_amounts_per_shares",
            vec![scval::amount(shares)?],
        );
        let value = self.gateway.simulate(&call).await?;
        let first = scval::to_vec(&value)?
            .first()
            .ok_or_else(|| GatewayError::UnexpectedReturn("vault returned no asset amounts".to_string()))?;
        let amount = scval::to_i128(first)?;
        u128::try_from(amount)
            .map_err(|_| GatewayError::UnexpectedReturn(format!("negative asset amount {}", amount)))
    }

    /// Submit a prepared call and wait for its terminal status
    pub async fn submit(&self, call: &ContractCall) -> Result<TxOutcome, GatewayError> {
        debug!(
            "Submitting {}.{} ({} args)",
            call.contract,
            call.function,
            call.args.len()
        );
        self.gateway.submit(call).await
    }

    /// One relay invocation `distribute(caller, vault, recipients)`.
    ///
    /// A deposit relay pulls the summed underlying from the caller, deposits
    /// it into `vault` and splits the minted shares (floor, remainder to the
    /// last entry). A transfer relay moves `vault` share tokens as-is. Both
    /// return the per-recipient amounts they paid.
    pub fn distribute_call(&self, vault: &str, recipients: &[(AccountId, u128)]) -> Result<ContractCall, GatewayError> {
        let entries = recipients
            .iter()
            .map(|(who, how_much)| {
                scval::record(vec![
                    ("address", scval::address(who)?),
                    ("amount", scval::amount(*how_much)?),
                ])
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ContractCall::new(
            self.relay_contract.clone(),
            self.relay_method.clone(),
            vec![
                scval::address(self.gateway.caller())?,
                scval::address(vault)?,
                scval::vec(entries)?,
            ],
        ))
    }
}

/// Per-recipient amounts out of the relay's `Vec<(Address, i128)>`
pub fn decode_distribution(value: &ScVal) -> Result<Vec<(AccountId, i128)>, GatewayError> {
    scval::to_address_amounts(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::scval::test_support::account;

    #[test]
    fn test_decode_distribution_pairs() {
        let pairs = vec![(account(1), 5), (account(2), 6)];
        let value = scval::address_amounts(&pairs).unwrap();

        assert_eq!(decode_distribution(&value).unwrap(), pairs);
        assert!(decode_distribution(&ScVal::Void).is_err());
    }
}
