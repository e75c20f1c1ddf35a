use async_trait::async_trait;
use stellar_xdr::curr::ScVal;

use crate::error::GatewayError;

/// A single contract invocation, addressed by strkey
#[derive(Debug, Clone, PartialEq)]
pub struct ContractCall {
    pub contract: String,
    pub function: String,
    pub args: Vec<ScVal>,
}

impl ContractCall {
    pub fn new(contract: impl Into<String>, function: impl Into<String>, args: Vec<ScVal>) -> Self {
        Self {
            contract: contract.into(),
            function: function.into(),
            args,
        }
    }
}

/// Terminal status reported by the ledger for a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Success,
    Failed,
    Expired,
}

/// What the ledger said about a submitted transaction once it stopped moving
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub hash: String,
    pub status: TerminalStatus,
    /// Decoded contract return value, when the ledger reported one
    pub return_value: Option<ScVal>,
    /// Result code and diagnostic events, human-readable
    pub diagnostics: Vec<String>,
    pub ledger: Option<u32>,
    pub waited_secs: u64,
}

impl TxOutcome {
    /// Turn a non-success terminal status into the matching error
    pub fn require_success(self) -> Result<Self, GatewayError> {
        match self.status {
            TerminalStatus::Success => Ok(self),
            TerminalStatus::Failed => Err(GatewayError::ExecutionFailed {
                hash: self.hash,
                detail: if self.diagnostics.is_empty() {
                    "no diagnostics returned".to_string()
                } else {
                    self.diagnostics.join(" | ")
                },
            }),
            TerminalStatus::Expired => Err(GatewayError::TransactionExpired {
                hash: self.hash,
                waited_secs: self.waited_secs,
            }),
        }
    }
}

/// Ledger gateway - read-only simulation plus submit-and-wait
///
/// INVARIANTS:
/// - `submit` returns only once the transaction is terminal (success,
///   failure or expiry of its own time bounds)
/// - callers issue one request at a time; implementations need no locking
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Strkey of the distributing account that signs and pays
    fn caller(&self) -> &str;

    /// Simulated read; nothing is submitted
    async fn simulate(&self, call: &ContractCall) -> Result<ScVal, GatewayError>;

    /// Build, sign, submit and poll to a terminal status
    async fn submit(&self, call: &ContractCall) -> Result<TxOutcome, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: TerminalStatus) -> TxOutcome {
        TxOutcome {
            hash: "abc".to_string(),
            status,
            return_value: None,
            diagnostics: vec!["TxFailed".to_string(), "event".to_string()],
            ledger: Some(7),
            waited_secs: 300,
        }
    }

    #[test]
    fn test_require_success_maps_terminal_status() {
        assert!(outcome(TerminalStatus::Success).require_success().is_ok());

        match outcome(TerminalStatus::Failed).require_success() {
            Err(GatewayError::ExecutionFailed { hash, detail }) => {
                assert_eq!(hash, "abc");
                assert_eq!(detail, "TxFailed | event");
            }
            other => panic!("unexpected {:?}", other),
        }

        match outcome(TerminalStatus::Expired).require_success() {
            Err(GatewayError::TransactionExpired { waited_secs, .. }) => {
                assert_eq!(waited_secs, 300)
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
