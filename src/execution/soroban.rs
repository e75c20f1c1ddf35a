use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::{Digest, Sha256};
use stellar_xdr::curr::{
    DecoratedSignature, DiagnosticEvent, Hash, HostFunction, InvokeContractArgs,
    InvokeHostFunctionOp, Limits, Memo, MuxedAccount, Operation, OperationBody, Preconditions,
    ReadXdr, ScVal, SequenceNumber, Signature, SignatureHint, SorobanAuthorizationEntry,
    SorobanTransactionData, TimeBounds, TimePoint, Transaction, TransactionEnvelope,
    TransactionExt, TransactionMeta, TransactionResult, TransactionSignaturePayload,
    TransactionSignaturePayloadTaggedTransaction, TransactionV1Envelope, Uint256, VecM, WriteXdr,
};
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::GatewayError;
use crate::execution::gateway::{ContractCall, LedgerGateway, TerminalStatus, TxOutcome};
use crate::execution::scval;

/// How long past `max_time` polling continues while the RPC has not yet
/// ingested a ledger closed after the bound
const EXPIRY_GRACE_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct SorobanConfig {
    pub rpc_url: String,
    pub horizon_url: String,
    pub network_passphrase: String,
    /// Inclusion fee in stroops, before the simulated resource fee is added
    pub base_fee: u32,
    /// Upper time bound written into every transaction
    pub tx_timeout_secs: u64,
    pub poll_interval: Duration,
}

impl Default for SorobanConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://soroban-testnet.stellar.org".to_string(),
            horizon_url: "https://horizon-testnet.stellar.org".to_string(),
            network_passphrase: "Test SDF Network ; September 2015".to_string(),
            base_fee: 100,
            tx_timeout_secs: 300,
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl From<&Settings> for SorobanConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            rpc_url: settings.rpc_url.clone(),
            horizon_url: settings.horizon_url.clone(),
            network_passphrase: settings.network.passphrase().to_string(),
            base_fee: settings.base_fee,
            tx_timeout_secs: settings.tx_timeout_secs,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    error: Option<String>,
    transaction_data: Option<String>,
    min_resource_fee: Option<String>,
    #[serde(default)]
    results: Vec<SimulateHostFunctionResult>,
    #[serde(default)]
    events: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SimulateHostFunctionResult {
    xdr: String,
    #[serde(default)]
    auth: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    status: String,
    hash: Option<String>,
    error_result_xdr: Option<String>,
    #[serde(default)]
    diagnostic_events_xdr: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetTransactionResponse {
    status: String,
    ledger: Option<u32>,
    result_xdr: Option<String>,
    result_meta_xdr: Option<String>,
    return_value: Option<String>,
    #[serde(default)]
    diagnostic_events_xdr: Vec<String>,
    /// Unix seconds, as a decimal string
    latest_ledger_close_time: Option<String>,
}

impl GetTransactionResponse {
    /// NOT_FOUND in a ledger that closed after `max_time`: the transaction
    /// can no longer be included
    fn expired_after(&self, max_time: u64) -> Option<u64> {
        if self.status != "NOT_FOUND" {
            return None;
        }
        self.latest_ledger_close_time
            .as_deref()
            .and_then(|t| t.parse::<u64>().ok())
            .filter(|closed| *closed > max_time)
    }
}

#[derive(Debug, Deserialize)]
struct HorizonAccount {
    sequence: String,
}

/// Simulation output needed to finish a transaction
struct Prepared {
    transaction_data: SorobanTransactionData,
    auth: Vec<SorobanAuthorizationEntry>,
    resource_fee: u32,
}

/// Ledger gateway backed by Soroban RPC (simulate/send/poll) and Horizon
/// (account sequence)
pub struct SorobanRpcGateway {
    config: SorobanConfig,
    signing_key: SigningKey,
    public_key: [u8; 32],
    account_id: String,
    client: reqwest::Client,
}

impl SorobanRpcGateway {
    pub fn new(config: SorobanConfig, secret: &str) -> Result<Self, GatewayError> {
        let seed = stellar_strkey::ed25519::PrivateKey::from_string(secret.trim())
            .map_err(|_| GatewayError::Signing("DISTRIBUTOR_SECRET is not a valid S... strkey".to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed.0);
        let public_key = signing_key.verifying_key().to_bytes();
        let account_id = stellar_strkey::ed25519::PublicKey(public_key).to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        info!("Soroban gateway ready for {} via {}", account_id, config.rpc_url);

        Ok(Self {
            config,
            signing_key,
            public_key,
            account_id,
            client,
        })
    }

    async fn rpc<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, GatewayError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self.client.post(&self.config.rpc_url).json(&body).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transport(format!("{} returned {}: {}", method, status, text)));
        }

        let envelope: RpcEnvelope<T> = response.json().await?;
        if let Some(err) = envelope.error {
            return Err(GatewayError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        envelope
            .result
            .ok_or_else(|| GatewayError::Transport(format!("{} returned neither result nor error", method)))
    }

    /// Current sequence number of the distributing account, from Horizon
    async fn load_sequence(&self) -> Result<i64, GatewayError> {
        let url = format!("{}/accounts/{}", self.config.horizon_url, self.account_id);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Transport(format!("failed to load account {}: {}", self.account_id, text)));
        }

        let account: HorizonAccount = response.json().await?;
        account
            .sequence
            .parse::<i64>()
            .map_err(|_| GatewayError::Transport(format!("invalid sequence number '{}'", account.sequence)))
    }

    fn build_transaction(
        &self,
        call: &ContractCall,
        seq_num: i64,
        max_time: u64,
        fee: u32,
        auth: Vec<SorobanAuthorizationEntry>,
        ext: TransactionExt,
    ) -> Result<Transaction, GatewayError> {
        let args: VecM<ScVal> = call.args.clone().try_into()?;
        let op = Operation {
            source_account: None,
            body: OperationBody::InvokeHostFunction(InvokeHostFunctionOp {
                host_function: HostFunction::InvokeContract(InvokeContractArgs {
                    contract_address: scval::parse_address(&call.contract)?,
                    function_name: scval::symbol(&call.function)?,
                    args,
                }),
                auth: auth.try_into()?,
            }),
        };

        Ok(Transaction {
            source_account: MuxedAccount::Ed25519(Uint256(self.public_key)),
            fee,
            seq_num: SequenceNumber(seq_num),
            cond: Preconditions::Time(TimeBounds {
                min_time: TimePoint(0),
                max_time: TimePoint(max_time),
            }),
            memo: Memo::None,
            operations: vec![op].try_into()?,
            ext,
        })
    }

    fn envelope_base64(&self, tx: Transaction, signatures: Vec<DecoratedSignature>) -> Result<String, GatewayError> {
        let envelope = TransactionEnvelope::Tx(TransactionV1Envelope {
            tx,
            signatures: signatures.try_into()?,
        });
        let bytes = envelope.to_xdr(Limits::none())?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// SHA-256 of the signature payload; doubles as the transaction hash
    fn payload_hash(&self, tx: &Transaction) -> Result<[u8; 32], GatewayError> {
        let network_id: [u8; 32] = Sha256::digest(self.config.network_passphrase.as_bytes()).into();
        let payload = TransactionSignaturePayload {
            network_id: Hash(network_id),
            tagged_transaction: TransactionSignaturePayloadTaggedTransaction::Tx(tx.clone()),
        };
        let bytes = payload.to_xdr(Limits::none())?;
        Ok(Sha256::digest(bytes).into())
    }

    fn sign(&self, hash: &[u8; 32]) -> Result<DecoratedSignature, GatewayError> {
        let signature = self.signing_key.sign(hash);
        let mut hint = [0u8; 4];
        hint.copy_from_slice(&self.public_key[28..32]);

        Ok(DecoratedSignature {
            hint: SignatureHint(hint),
            signature: Signature(
                signature
                    .to_bytes()
                    .to_vec()
                    .try_into()
                    .map_err(|_| GatewayError::Signing("signature does not fit 64 bytes".to_string()))?,
            ),
        })
    }

    async fn simulate_transaction(&self, tx: Transaction) -> Result<SimulateResponse, GatewayError> {
        let envelope = self.envelope_base64(tx, vec![])?;
        let response: SimulateResponse = self
            .rpc("simulateTransaction", serde_json::json!({ "transaction": envelope }))
            .await?;

        if let Some(error) = response.error {
            let events = decode_diagnostics(&response.events);
            return Err(GatewayError::Simulation(if events.is_empty() {
                error
            } else {
                format!("{} | {}", error, events.join(" | "))
            }));
        }

        Ok(response)
    }

    fn prepare(&self, response: &SimulateResponse) -> Result<Prepared, GatewayError> {
        let data = response
            .transaction_data
            .as_deref()
            .ok_or_else(|| GatewayError::Simulation("simulation returned no transaction data".to_string()))?;
        let transaction_data = SorobanTransactionData::from_xdr(decode_b64(data)?, Limits::none())?;

        let auth = response
            .results
            .first()
            .map(|r| r.auth.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|entry| Ok(SorobanAuthorizationEntry::from_xdr(decode_b64(entry)?, Limits::none())?))
            .collect::<Result<Vec<_>, GatewayError>>()?;

        let resource_fee = response
            .min_resource_fee
            .as_deref()
            .unwrap_or("0")
            .parse::<u64>()
            .map_err(|_| GatewayError::Simulation("unparseable minResourceFee".to_string()))?;

        Ok(Prepared {
            transaction_data,
            auth,
            resource_fee: u32::try_from(resource_fee).unwrap_or(u32::MAX),
        })
    }

    /// Poll until the ledger reports a terminal status. A transaction is
    /// expired once the RPC reports it NOT_FOUND as of a ledger closed after
    /// `max_time`, or once the grace period past `max_time` runs out.
    async fn wait_for_terminal(&self, hash: &str, max_time: u64) -> Result<TxOutcome, GatewayError> {
        let started = time::Instant::now();

        loop {
            time::sleep(self.config.poll_interval).await;

            match self
                .rpc::<GetTransactionResponse>("getTransaction", serde_json::json!({ "hash": hash }))
                .await
            {
                Ok(tx) if tx.status == "SUCCESS" || tx.status == "FAILED" => {
                    let status = if tx.status == "SUCCESS" {
                        TerminalStatus::Success
                    } else {
                        TerminalStatus::Failed
                    };
                    let mut diagnostics = Vec::new();
                    if let Some(result) = tx.result_xdr.as_deref() {
                        diagnostics.push(describe_result(result));
                    }
                    diagnostics.extend(decode_diagnostics(&tx.diagnostic_events_xdr));

                    return Ok(TxOutcome {
                        hash: hash.to_string(),
                        status,
                        return_value: extract_return_value(&tx),
                        diagnostics,
                        ledger: tx.ledger,
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
                Ok(tx) => {
                    if let Some(closed) = tx.expired_after(max_time) {
                        warn!("Transaction {} not found as of a ledger closed at {}", hash, closed);
                        return Ok(expired(
                            hash,
                            format!("ledger closed at {} past max_time {}", closed, max_time),
                            started,
                        ));
                    }
                    debug!("Transaction {} status {}", hash, tx.status);
                }
                Err(e) => warn!("Polling {} failed, will retry: {}", hash, e),
            }

            if unix_now() > max_time.saturating_add(EXPIRY_GRACE_SECS) {
                warn!("Transaction {} passed its time bound without a terminal status", hash);
                return Ok(expired(
                    hash,
                    format!("max_time {} elapsed, no ledger past it observed", max_time),
                    started,
                ));
            }
        }
    }
}

fn expired(hash: &str, reason: String, started: time::Instant) -> TxOutcome {
    TxOutcome {
        hash: hash.to_string(),
        status: TerminalStatus::Expired,
        return_value: None,
        diagnostics: vec![reason],
        ledger: None,
        waited_secs: started.elapsed().as_secs(),
    }
}

#[async_trait]
impl LedgerGateway for SorobanRpcGateway {
    fn caller(&self) -> &str {
        &self.account_id
    }

    async fn simulate(&self, call: &ContractCall) -> Result<ScVal, GatewayError> {
        // Simulation ignores the sequence number
        let max_time = unix_now() + self.config.tx_timeout_secs;
        let tx = self.build_transaction(call, 0, max_time, self.config.base_fee, vec![], TransactionExt::V0)?;
        let response = self.simulate_transaction(tx).await?;

        let first = response
            .results
            .first()
            .ok_or_else(|| GatewayError::Simulation(format!("{}: no result returned", call.function)))?;
        Ok(ScVal::from_xdr(decode_b64(&first.xdr)?, Limits::none())?)
    }

    async fn submit(&self, call: &ContractCall) -> Result<TxOutcome, GatewayError> {
        let seq_num = self.load_sequence().await? + 1;
        let max_time = unix_now() + self.config.tx_timeout_secs;

        let draft = self.build_transaction(call, seq_num, max_time, self.config.base_fee, vec![], TransactionExt::V0)?;
        let simulation = self.simulate_transaction(draft).await?;
        let prepared = self.prepare(&simulation)?;

        let fee = self.config.base_fee.saturating_add(prepared.resource_fee);
        let tx = self.build_transaction(
            call,
            seq_num,
            max_time,
            fee,
            prepared.auth,
            TransactionExt::V1(prepared.transaction_data),
        )?;

        let hash_bytes = self.payload_hash(&tx)?;
        let hash = hex::encode(hash_bytes);
        let signature = self.sign(&hash_bytes)?;
        let envelope = self.envelope_base64(tx, vec![signature])?;

        let sent: SendResponse = self
            .rpc("sendTransaction", serde_json::json!({ "transaction": envelope }))
            .await?;

        match sent.status.as_str() {
            "PENDING" | "DUPLICATE" => {}
            status => {
                let mut detail = Vec::new();
                if let Some(result) = sent.error_result_xdr.as_deref() {
                    detail.push(describe_result(result));
                }
                detail.extend(decode_diagnostics(&sent.diagnostic_events_xdr));
                return Err(GatewayError::Rejected {
                    status: status.to_string(),
                    detail: if detail.is_empty() {
                        "no diagnostics returned".to_string()
                    } else {
                        detail.join(" | ")
                    },
                });
            }
        }

        let hash = sent.hash.unwrap_or(hash);
        info!("Transaction {} submitted (seq {}, fee {})", hash, seq_num, fee);

        self.wait_for_terminal(&hash, max_time).await
    }
}

fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

fn decode_b64(data: &str) -> Result<Vec<u8>, GatewayError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(data)?)
}

/// Result code of a `TransactionResult`, falling back to the raw XDR
fn describe_result(result_xdr: &str) -> String {
    decode_b64(result_xdr)
        .ok()
        .and_then(|bytes| TransactionResult::from_xdr(bytes, Limits::none()).ok())
        .map(|result| format!("result: {:?} (fee charged {})", result.result, result.fee_charged))
        .unwrap_or_else(|| format!("result xdr: {}", result_xdr))
}

fn decode_diagnostics(events: &[String]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            decode_b64(event)
                .ok()
                .and_then(|bytes| DiagnosticEvent::from_xdr(bytes, Limits::none()).ok())
                .map(|decoded| format!("event: {:?}", decoded.event.body))
                .unwrap_or_else(|| format!("event xdr: {}", event))
        })
        .collect()
}

fn extract_return_value(tx: &GetTransactionResponse) -> Option<ScVal> {
    if let Some(value) = tx.return_value.as_deref() {
        return decode_b64(value)
            .ok()
            .and_then(|bytes| ScVal::from_xdr(bytes, Limits::none()).ok());
    }

    let meta = decode_b64(tx.result_meta_xdr.as_deref()?)
        .ok()
        .and_then(|bytes| TransactionMeta::from_xdr(bytes, Limits::none()).ok())?;

    match meta {
        TransactionMeta::V3(v3) => v3.soroban_meta.map(|m| m.return_value),
        TransactionMeta::V4(v4) => v4.soroban_meta.and_then(|m| m.return_value),
        _ => None,
    }
}
